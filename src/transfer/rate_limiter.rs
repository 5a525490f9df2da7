//! 全局请求限流：所有工作线程共享一个令牌桶，突发容量为 1，
//! 相邻两次放行至少间隔 `1/rate` 秒。

use std::thread;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota};

pub struct RateLimiter {
    gate: Option<DefaultDirectRateLimiter>,
    clock: DefaultClock,
}

impl RateLimiter {
    /// `requests_per_second <= 0` 时限流关闭。
    pub fn new(requests_per_second: f64) -> Self {
        let gate = (requests_per_second.is_finite() && requests_per_second > 0.0)
            .then(|| Quota::with_period(Duration::from_secs_f64(1.0 / requests_per_second)))
            .flatten()
            .map(DefaultDirectRateLimiter::direct);
        Self {
            gate,
            clock: DefaultClock::default(),
        }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self::new(0.0)
    }

    #[cfg(test)]
    pub fn is_enabled(&self) -> bool {
        self.gate.is_some()
    }

    /// 阻塞到令牌可用。
    pub fn acquire(&self) {
        let Some(gate) = &self.gate else {
            return;
        };
        while let Err(not_until) = gate.check() {
            thread::sleep(not_until.wait_time_from(self.clock.now()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn disabled_limiter_never_waits() {
        let limiter = RateLimiter::new(0.0);
        assert!(!limiter.is_enabled());
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.acquire();
        }
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(!RateLimiter::new(f64::NAN).is_enabled());
        assert!(!RateLimiter::new(-1.0).is_enabled());
    }

    #[test]
    fn consecutive_acquisitions_respect_interval() {
        let limiter = RateLimiter::new(20.0); // 50ms
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire();
        }
        // 第一次立即放行，其后三次各至少间隔 50ms
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn interval_is_global_across_threads() {
        let limiter = Arc::new(RateLimiter::new(25.0)); // 40ms
        let start = Instant::now();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || {
                    for _ in 0..2 {
                        limiter.acquire();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // 6 次放行 => 至少 5 个间隔
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
