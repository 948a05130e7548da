//! 解析器适配层
//!
//! 把 Discovery 的 watch 成员更新翻译成 tonic 原生的地址解析状态
//! （`Channel::balance_channel` 的 Change 事件），普通出站调用随成员
//! 变化自动重新均衡。自身不包含业务逻辑，只做两侧契约的阻抗匹配

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::channel::Change;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, warn};

use crate::registry::{Discovery, WatchSupervisor};
use crate::selector::LabelSelector;
use crate::types::ServiceInfo;

/// balance channel 的事件缓冲
const CHANGE_BUFFER: usize = 64;

/// 解析器句柄
///
/// 持有翻译任务的取消令牌；close 取消底层 watch 与翻译任务
pub struct Resolver {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Resolver {
    /// 构建带服务发现的负载均衡 Channel
    ///
    /// 返回的 Channel 可直接交给 tonic 生成的客户端使用；Resolver 负责
    /// 生命周期管理
    pub fn build(
        discovery: Arc<dyn Discovery>,
        name: impl Into<String>,
        selector: LabelSelector,
    ) -> (Channel, Resolver) {
        let name = name.into();
        let (channel, change_tx) = Channel::balance_channel(CHANGE_BUFFER);
        let token = CancellationToken::new();
        let task = tokio::spawn(Self::translate_loop(
            discovery,
            name,
            selector,
            change_tx,
            token.clone(),
        ));
        (
            channel,
            Resolver {
                token,
                task: Some(task),
            },
        )
    }

    /// 翻译循环：全量成员集合 → 地址增量事件
    async fn translate_loop(
        discovery: Arc<dyn Discovery>,
        name: String,
        selector: LabelSelector,
        change_tx: mpsc::Sender<Change<String, Endpoint>>,
        token: CancellationToken,
    ) {
        let (set_tx, mut set_rx) = mpsc::unbounded_channel::<Vec<ServiceInfo>>();
        let supervisor = WatchSupervisor::forever();
        let watch_token = token.child_token();
        let watch_name = name.clone();
        let watcher = tokio::spawn(async move {
            let notify = Box::new(move |services: Vec<ServiceInfo>| {
                let _ = set_tx.send(services);
            });
            if let Err(e) = supervisor
                .run(discovery, &watch_name, watch_token, notify)
                .await
            {
                error!(service = %watch_name, error = %e, "resolver watch terminated");
            }
        });

        let mut current: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                set = set_rx.recv() => match set {
                    Some(services) => {
                        let filtered = selector.filter(&services);
                        let next: HashSet<String> =
                            filtered.iter().map(|i| i.addr.clone()).collect();
                        if !push_diff(&change_tx, &current, &next).await {
                            break;
                        }
                        debug!(service = %name, instances = next.len(), "resolver state updated");
                        current = next;
                    }
                    None => break,
                }
            }
        }
        watcher.abort();
    }

    /// 解析提示（no-op：watch 是推送驱动的，没有可加速的拉取动作）
    pub fn resolve_now(&self) {}

    /// 关闭：取消底层 watch 与翻译任务
    pub fn close(&self) {
        self.token.cancel();
    }

    /// 关闭并等待翻译任务退出
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// 推送地址差量：先摘除离场地址，再接入新地址
///
/// 返回 false 表示 Channel 已关闭，翻译循环应当退出
async fn push_diff(
    change_tx: &mpsc::Sender<Change<String, Endpoint>>,
    current: &HashSet<String>,
    next: &HashSet<String>,
) -> bool {
    for addr in current.difference(next) {
        if change_tx
            .send(Change::Remove(addr.clone()))
            .await
            .is_err()
        {
            return false;
        }
    }
    for addr in next.difference(current) {
        let endpoint = match Endpoint::from_shared(format!("http://{addr}")) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(addr = %addr, error = %e, "skipping instance with invalid address");
                continue;
            }
        };
        if change_tx
            .send(Change::Insert(addr.clone(), endpoint))
            .await
            .is_err()
        {
            return false;
        }
    }
    true
}
