//! # 重连熔断器
//!
//! 三态限流器，抑制对失联主节点的重连风暴:
//! - closed: 正常，允许连接
//! - open: 连续失败达到阈值后进入，冷却期内拒绝一切尝试
//! - half-open: 冷却期过后进入，按半开重试间隔放行单次尝试

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    half_open_retry: Duration,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_attempt: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration, half_open_retry: Duration) -> Self {
        Self {
            max_failures,
            reset_timeout,
            half_open_retry,
            failure_count: 0,
            last_failure: None,
            last_attempt: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.failure_count < self.max_failures {
            return CircuitState::Closed;
        }
        match self.last_failure {
            Some(at) if at.elapsed() > self.reset_timeout => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }

    /// 当前是否允许发起连接尝试
    pub fn can_attempt(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => match self.last_attempt {
                Some(at) => at.elapsed() > self.half_open_retry,
                None => true,
            },
        }
    }

    /// 记录一次连接尝试（半开限流用）
    pub fn record_attempt(&mut self) {
        self.last_attempt = Some(Instant::now());
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.last_failure = None;
        self.last_attempt = None;
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// 重连退避: min(2^(失败次数-1), 30) 秒
    pub fn backoff(&self) -> Duration {
        if self.failure_count == 0 {
            return Duration::from_secs(1);
        }
        let exp = std::cmp::min(self.failure_count - 1, 5);
        std::cmp::min(Duration::from_secs(1 << exp), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_millis(100), Duration::from_millis(30))
    }

    #[test]
    fn test_opens_after_max_failures() {
        let mut cb = fast_breaker();
        assert_eq!(cb.state(), CircuitState::Closed);

        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // 冷却期内拒绝所有尝试
        assert!(!cb.can_attempt());
    }

    #[test]
    fn test_half_open_after_reset_window() {
        let mut cb = fast_breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_attempt());

        // 半开状态下按间隔放行
        cb.record_attempt();
        assert!(!cb.can_attempt());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_success_closes_breaker() {
        let mut cb = fast_breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = fast_breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_backoff_progression() {
        let mut cb = fast_breaker();
        assert_eq!(cb.backoff(), Duration::from_secs(1));
        cb.record_failure();
        assert_eq!(cb.backoff(), Duration::from_secs(1));
        cb.record_failure();
        assert_eq!(cb.backoff(), Duration::from_secs(2));
        cb.record_failure();
        assert_eq!(cb.backoff(), Duration::from_secs(4));
        for _ in 0..10 {
            cb.record_failure();
        }
        // 上限30秒
        assert_eq!(cb.backoff(), Duration::from_secs(30));
    }
}
