use super::RetryPolicy;
use crate::error::DiscoveryError;
use std::time::Duration;

/// 指数退避重试策略
pub struct ExponentialBackoffPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// 注册流程的退避策略：200ms 起步、倍增、上限 3s，不限次数
    pub fn register_default() -> Self {
        Self::new(
            usize::MAX,
            Duration::from_millis(200),
            Duration::from_secs(3),
        )
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn should_retry(&self, attempt: usize, error: &DiscoveryError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        // 只对瞬时错误进行重试
        error.is_transient()
    }

    fn backoff_duration(&self, attempt: usize) -> Duration {
        let delay_ms = self.base_delay.as_millis() as u64 * (1 << attempt.min(10));
        let delay = Duration::from_millis(delay_ms);
        delay.min(self.max_delay)
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}
