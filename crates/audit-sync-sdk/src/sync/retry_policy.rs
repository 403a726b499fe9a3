use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::FailureReason;

/// 服务端暂时不可用时的退避策略（只作用于单条记录的一次同步内）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大重试次数（不含第一次请求）
    pub max_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 不重试（测试、或调用方自己控制节奏时用）
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 检查是否应该重试
    pub fn should_retry(&self, retry_count: u32, reason: &FailureReason) -> bool {
        retry_count < self.max_retries && reason.is_retryable()
    }

    /// 第 `retry_count` 次重试前的等待时间；不该重试时返回 None
    pub fn next_delay(&self, retry_count: u32, reason: &FailureReason) -> Option<Duration> {
        if !self.should_retry(retry_count, reason) {
            return None;
        }

        // 基础延迟 = base_delay * (backoff_factor ^ retry_count)
        let base_delay = self.base_delay_ms as f64 * self.backoff_factor.powf(retry_count as f64);

        // 429 限流等更久
        let multiplier = match reason {
            FailureReason::Transient(429) => 2.0,
            _ => 1.0,
        };

        let capped_delay = (base_delay * multiplier).min(self.max_delay_ms as f64);
        let jitter = capped_delay * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (capped_delay + jitter).max(0.0);

        Some(Duration::from_millis(final_delay as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retried() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0, &FailureReason::Transient(503)));
        assert!(!policy.should_retry(0, &FailureReason::Http(500)));
        assert!(!policy.should_retry(0, &FailureReason::HtmlPage));
        assert!(!policy.should_retry(3, &FailureReason::Transient(503)));
        assert!(policy.next_delay(0, &FailureReason::NoMatch).is_none());
    }

    #[test]
    fn test_exponential_backoff_with_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        let reason = FailureReason::Transient(503);
        assert_eq!(policy.next_delay(0, &reason), Some(Duration::from_millis(1000)));
        assert_eq!(policy.next_delay(1, &reason), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_delay(2, &reason), Some(Duration::from_millis(4000)));
        assert_eq!(policy.next_delay(5, &reason), Some(Duration::from_millis(8000)));
        assert_eq!(
            policy.next_delay(1, &FailureReason::Transient(429)),
            Some(Duration::from_millis(4000))
        );
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.next_delay(0, &FailureReason::Transient(503)).unwrap();
            assert!(delay >= Duration::from_millis(950) && delay <= Duration::from_millis(1050));
        }
    }

    #[test]
    fn test_none_policy() {
        assert!(RetryPolicy::none().next_delay(0, &FailureReason::Transient(503)).is_none());
    }
}
