//! watch 监督循环
//!
//! 把「与存储对话一次」和「持续与存储对话」分开：后端的 watch 是单次
//! 尝试，失败即返回；监督循环负责退避重试与封顶次数

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;
use crate::registry::{Discovery, Notify};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};
use crate::types::ServiceInfo;

/// watch 监督器
pub struct WatchSupervisor {
    policy: Arc<dyn RetryPolicy>,
}

impl WatchSupervisor {
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self { policy }
    }

    /// 不设次数上限的监督器：退避 500ms 起步，上限 30s
    pub fn forever() -> Self {
        Self::new(Arc::new(ExponentialBackoffPolicy::new(
            usize::MAX,
            Duration::from_millis(500),
            Duration::from_secs(30),
        )))
    }

    /// 持续监听直至 token 取消
    ///
    /// 单次 watch 出错后按策略退避重试；一旦某次 watch 成功投递过通知，
    /// 尝试计数归零（视为新一轮故障）。策略拒绝重试时返回最后的错误
    pub async fn run(
        &self,
        discovery: Arc<dyn Discovery>,
        name: &str,
        token: CancellationToken,
        mut notify: Box<Notify>,
    ) -> Result<()> {
        let delivered = Arc::new(AtomicBool::new(false));
        let mut attempt = 0usize;

        let flag = delivered.clone();
        let mut wrapped = move |services: Vec<ServiceInfo>| {
            flag.store(true, Ordering::Relaxed);
            notify(services);
        };

        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            delivered.store(false, Ordering::Relaxed);

            match discovery.watch(name, token.clone(), &mut wrapped).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if delivered.load(Ordering::Relaxed) {
                        attempt = 0;
                    }
                    if !self.policy.should_retry(attempt, &e) {
                        warn!(service = name, attempt, error = %e, "watch supervision giving up");
                        return Err(e);
                    }
                    let backoff = self.policy.backoff_duration(attempt);
                    warn!(
                        service = name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "watch attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
