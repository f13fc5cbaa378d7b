//! Per-address throttling of failed handshakes.
//!
//! Each source address gets a sliding window that starts at its first failure.
//! Reaching `max_attempts` failures inside the window blocks the address for
//! `block_duration`. A block always runs its full duration: a later success
//! from the same address clears the failure counter but not the block.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Blocked { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone, Copy)]
struct Record {
    attempts: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

/// Sliding-window failure counter keyed by client address.
pub struct RateLimiter {
    records: Mutex<HashMap<IpAddr, Record>>,
    max_attempts: u32,
    window: Duration,
    block_duration: Duration,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration, block_duration: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            window,
            block_duration,
        }
    }

    /// Whether `ip` may attempt a handshake right now.
    pub async fn is_allowed(&self, ip: IpAddr) -> Decision {
        let records = self.records.lock().await;
        let now = Instant::now();
        match records.get(&ip).and_then(|r| r.blocked_until) {
            Some(until) if until > now => Decision::Blocked {
                retry_after: until - now,
            },
            _ => Decision::Allowed,
        }
    }

    /// Record a failed attempt. Returns `Blocked` when this failure tripped
    /// (or the address is already under) a block.
    pub async fn record_failure(&self, ip: IpAddr) -> Decision {
        let mut records = self.records.lock().await;
        let now = Instant::now();
        let record = records.entry(ip).or_insert(Record {
            attempts: 0,
            window_start: now,
            blocked_until: None,
        });

        if let Some(until) = record.blocked_until {
            if until > now {
                return Decision::Blocked {
                    retry_after: until - now,
                };
            }
            record.blocked_until = None;
        }

        if record.attempts == 0 || now.duration_since(record.window_start) >= self.window {
            record.attempts = 0;
            record.window_start = now;
        }
        record.attempts += 1;
        debug!("Rate limit: {ip} failure {}/{}", record.attempts, self.max_attempts);

        if record.attempts >= self.max_attempts {
            record.attempts = 0;
            record.blocked_until = Some(now + self.block_duration);
            warn!(
                "Rate limit: blocking {ip} for {}s after {} failed attempts",
                self.block_duration.as_secs(),
                self.max_attempts
            );
            return Decision::Blocked {
                retry_after: self.block_duration,
            };
        }
        Decision::Allowed
    }

    /// Record a successful attempt: clears the failure counter, keeps any block.
    pub async fn record_success(&self, ip: IpAddr) {
        let mut records = self.records.lock().await;
        let now = Instant::now();
        if let Some(record) = records.get_mut(&ip) {
            if record.blocked_until.is_some_and(|until| until > now) {
                record.attempts = 0;
            } else {
                records.remove(&ip);
            }
        }
    }

    /// Drop records whose window and block have both expired. Returns the
    /// number of records removed.
    pub async fn cleanup(&self) -> usize {
        let mut records = self.records.lock().await;
        let now = Instant::now();
        let before = records.len();
        records.retain(|_, r| {
            let blocked = r.blocked_until.is_some_and(|until| until > now);
            let window_open = r.attempts > 0 && now.duration_since(r.window_start) < self.window;
            blocked || window_open
        });
        before - records.len()
    }

    /// Number of tracked addresses.
    pub async fn tracked(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Spawn the periodic [`cleanup`](Self::cleanup) task. It stops when
    /// `cancel` fires.
    pub fn spawn_cleanup(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.cleanup().await;
                        if removed > 0 {
                            debug!("Rate limiter dropped {removed} expired record(s)");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
    const OTHER: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 8));

    fn limiter() -> RateLimiter {
        RateLimiter::new(5, Duration::from_secs(60), Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_after_max_attempts() {
        let rl = limiter();
        for _ in 0..4 {
            assert_eq!(rl.record_failure(IP).await, Decision::Allowed);
        }
        assert!(rl.is_allowed(IP).await.is_allowed());

        let tripped = rl.record_failure(IP).await;
        assert_eq!(
            tripped,
            Decision::Blocked {
                retry_after: Duration::from_secs(300)
            }
        );
        match rl.is_allowed(IP).await {
            Decision::Blocked { retry_after } => {
                assert!(retry_after <= Duration::from_secs(300));
                assert!(retry_after > Duration::from_secs(299));
            }
            Decision::Allowed => panic!("expected block"),
        }
        assert!(rl.is_allowed(OTHER).await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires() {
        let rl = limiter();
        for _ in 0..5 {
            rl.record_failure(IP).await;
        }
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!rl.is_allowed(IP).await.is_allowed());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(rl.is_allowed(IP).await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_counter() {
        let rl = limiter();
        for _ in 0..4 {
            rl.record_failure(IP).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        // Window elapsed: this is failure 1 of a fresh window.
        assert_eq!(rl.record_failure(IP).await, Decision::Allowed);
        for _ in 0..3 {
            assert_eq!(rl.record_failure(IP).await, Decision::Allowed);
        }
        assert!(!rl.record_failure(IP).await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_counter_but_not_block() {
        let rl = limiter();
        for _ in 0..4 {
            rl.record_failure(IP).await;
        }
        rl.record_success(IP).await;
        assert_eq!(rl.record_failure(IP).await, Decision::Allowed);

        for _ in 0..4 {
            rl.record_failure(IP).await;
        }
        assert!(!rl.is_allowed(IP).await.is_allowed());
        rl.record_success(IP).await;
        assert!(!rl.is_allowed(IP).await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_expired_records() {
        let rl = limiter();
        rl.record_failure(IP).await;
        for _ in 0..5 {
            rl.record_failure(OTHER).await;
        }
        assert_eq!(rl.tracked().await, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(rl.cleanup().await, 1);
        assert_eq!(rl.tracked().await, 1);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(rl.cleanup().await, 1);
        assert_eq!(rl.tracked().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_runs_until_cancelled() {
        let rl = Arc::new(limiter());
        rl.record_failure(IP).await;
        let cancel = CancellationToken::new();
        let task = Arc::clone(&rl).spawn_cleanup(Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(rl.tracked().await, 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
