//! Admission control for the inference step.
//!
//! Enhancements are CPU/GPU bound and the session runs one forward pass at a time, so an
//! unbounded pile of requests only grows latency and memory. [`EnhanceLimiter`] caps concurrency,
//! bounds how many requests may queue and how long they may wait. Anything beyond gets HTTP 429.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{EnhanceLimitsConfig, LimitsConfig};
use crate::errors::{Error, Result};

/// All limiters used by the application.
#[derive(Debug, Default, Clone)]
pub struct Limiters {
    /// Limiter for concurrent enhancements. None means unlimited.
    pub enhancements: Option<Arc<EnhanceLimiter>>,
}

impl Limiters {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            enhancements: EnhanceLimiter::new(&config.enhancements).map(Arc::new),
        }
    }

    /// Acquires an enhancement slot, or `None` when enhancements are unlimited.
    pub async fn enhancement_permit(&self) -> Result<Option<EnhancePermit>> {
        match &self.enhancements {
            Some(limiter) => limiter.acquire().await.map(Some),
            None => Ok(None),
        }
    }
}

/// Bounded queue in front of the enhancement step.
#[derive(Debug)]
pub struct EnhanceLimiter {
    semaphore: Arc<Semaphore>,
    /// Requests currently queued for a permit
    waiting: AtomicUsize,
    /// None = unlimited queue
    max_waiting: Option<usize>,
    max_wait: Duration,
}

impl EnhanceLimiter {
    /// Returns `None` when `max_concurrent` is 0. A `max_waiting` of 0 allows an unbounded queue.
    pub fn new(config: &EnhanceLimitsConfig) -> Option<Self> {
        if config.max_concurrent == 0 {
            return None;
        }

        Some(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            waiting: AtomicUsize::new(0),
            max_waiting: (config.max_waiting > 0).then_some(config.max_waiting),
            max_wait: config.max_wait,
        })
    }

    /// Waits for a free slot.
    ///
    /// Fails with [`Error::TooManyRequests`] when the queue is already full, when `max_wait` is
    /// zero and no slot is free, or when `max_wait` elapses first.
    pub async fn acquire(&self) -> Result<EnhancePermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(EnhancePermit { _permit: permit });
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        let result = self.wait_in_queue(queued).await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn wait_in_queue(&self, queued_ahead: usize) -> Result<EnhancePermit> {
        if self.max_waiting.is_some_and(|max| queued_ahead >= max) {
            return Err(too_many("Too many enhancements queued. Please retry later."));
        }

        // A slot may have been released between the first attempt and joining the queue
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(EnhancePermit { _permit: permit });
        }

        if self.max_wait.is_zero() {
            return Err(too_many("Too many enhancements in progress. Please retry later."));
        }

        match tokio::time::timeout(self.max_wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(EnhancePermit { _permit: permit }),
            Ok(Err(_closed)) => Err(too_many("Enhancement service temporarily unavailable.")),
            Err(_elapsed) => Err(too_many("Timed out waiting for an enhancement slot. Please retry later.")),
        }
    }
}

fn too_many(message: &str) -> Error {
    Error::TooManyRequests {
        message: message.to_string(),
    }
}

/// Releases the enhancement slot when dropped.
#[must_use]
pub struct EnhancePermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_concurrent: usize, max_waiting: usize, max_wait: Duration) -> EnhanceLimiter {
        EnhanceLimiter::new(&EnhanceLimitsConfig {
            max_concurrent,
            max_waiting,
            max_wait,
        })
        .expect("limiter should be enabled")
    }

    fn queued(limiter: &EnhanceLimiter) -> usize {
        limiter.waiting.load(Ordering::SeqCst)
    }

    #[test]
    fn test_zero_concurrency_is_unlimited() {
        let config = EnhanceLimitsConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert!(EnhanceLimiter::new(&config).is_none());
        assert!(Limiters::new(&LimitsConfig::default()).enhancements.is_none());
    }

    #[tokio::test]
    async fn test_unlimited_limiters_hand_out_no_permit() {
        let limiters = Limiters::default();
        assert!(limiters.enhancement_permit().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_up_to_capacity() {
        let limiter = limiter(2, 10, Duration::from_secs(60));

        let _a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(queued(&limiter), 0);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_slot() {
        let limiter = Arc::new(limiter(1, 10, Duration::from_secs(5)));
        let held = limiter.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queued(&limiter), 1);

        drop(held);

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(queued(&limiter), 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let limiter = Arc::new(limiter(1, 1, Duration::from_secs(60)));
        let _held = limiter.acquire().await.unwrap();

        let _queued = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        match limiter.acquire().await {
            Err(Error::TooManyRequests { message }) => assert!(message.contains("queued")),
            Err(other) => panic!("expected TooManyRequests, got {other:?}"),
            Ok(_) => panic!("expected TooManyRequests, got a permit"),
        }
    }

    #[tokio::test]
    async fn test_times_out() {
        let limiter = limiter(1, 10, Duration::from_millis(200));
        let _held = limiter.acquire().await.unwrap();

        let start = std::time::Instant::now();
        let result = limiter.acquire().await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(Error::TooManyRequests { ref message }) if message.contains("Timed out")));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(queued(&limiter), 0);
    }

    #[tokio::test]
    async fn test_zero_wait_rejects_immediately() {
        let limiter = limiter(1, 10, Duration::ZERO);
        let _held = limiter.acquire().await.unwrap();

        let start = std::time::Instant::now();
        assert!(limiter.acquire().await.is_err());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let limiter = limiter(1, 10, Duration::from_secs(1));
        {
            let _permit = limiter.acquire().await.unwrap();
        }
        assert!(limiter.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_unbounded_queue() {
        let limiter = Arc::new(limiter(1, 0, Duration::from_secs(5)));
        let held = limiter.acquire().await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            waiters.push(tokio::spawn(async move { limiter.acquire().await.map(|_| ()) }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queued(&limiter), 10);

        drop(held);

        for waiter in waiters {
            assert!(waiter.await.unwrap().is_ok());
        }
    }
}
