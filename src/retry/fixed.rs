use super::RetryPolicy;
use crate::error::DiscoveryError;
use std::time::Duration;

/// 固定延迟重试策略
///
/// 故障转移使用：每次尝试之间等待固定间隔，任何错误都重试
pub struct FixedRetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedRetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn should_retry(&self, attempt: usize, _error: &DiscoveryError) -> bool {
        attempt < self.max_attempts
    }

    fn backoff_duration(&self, _attempt: usize) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}
