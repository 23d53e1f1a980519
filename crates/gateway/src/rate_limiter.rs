use std::num::NonZeroU32;
use std::time::Duration;

use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// 单个端点的令牌桶限流器
///
/// 容量为每分钟请求数，令牌按 `60s / capacity` 的间隔匀速补充。
pub struct EndpointRateLimiter {
    limiter: DirectRateLimiter,
    capacity: u32,
}

impl EndpointRateLimiter {
    /// 容量为0表示不限流，返回 `None`
    pub fn per_minute(capacity: u32) -> Option<Self> {
        let quota = Quota::per_minute(NonZeroU32::new(capacity)?);
        Some(Self {
            limiter: RateLimiter::direct(quota),
            capacity,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// 立即尝试获取一个令牌
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// 等待令牌，最多等待 `max_wait`
    pub async fn acquire(&self, max_wait: Duration) -> bool {
        if self.try_acquire() {
            return true;
        }
        if max_wait.is_zero() {
            return false;
        }
        tokio::time::timeout(max_wait, self.limiter.until_ready())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_disables_limiting() {
        assert!(EndpointRateLimiter::per_minute(0).is_none());
    }

    #[tokio::test]
    async fn test_burst_is_bounded_by_capacity() {
        let limiter = EndpointRateLimiter::per_minute(2).unwrap();
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        // 下一个令牌要30秒后才补充
        assert!(!limiter.acquire(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_replenishment() {
        // 每分钟6000次，约10ms补充一个令牌
        let limiter = EndpointRateLimiter::per_minute(6000).unwrap();
        while limiter.try_acquire() {}
        assert!(limiter.acquire(Duration::from_millis(500)).await);
    }
}
