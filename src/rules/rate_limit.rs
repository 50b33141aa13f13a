//! Per-fee-payer transaction rate limiting
//!
//! Each fee payer gets a `{count, window_start}` entry. The entry is reset
//! once the window has elapsed; within a window at most `max_per_window`
//! transactions are admitted. Check and increment happen under the
//! DashMap shard lock, so two concurrent callers never both take the last slot.

use dashmap::DashMap;
use solana_sdk::pubkey::Pubkey;
use std::time::Duration;
use tokio::time::Instant;

/// Entries are swept once the map grows past this many fee payers
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct WindowState {
    count: usize,
    window_start: Instant,
}

/// Fee-payer rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_per_window: usize,
    entries: DashMap<Pubkey, WindowState>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_per_window: usize) -> Self {
        Self {
            window,
            max_per_window,
            entries: DashMap::new(),
        }
    }

    /// Admit one transaction for `fee_payer` at `now`
    ///
    /// Returns `false` when the payer has already used its quota in the
    /// current window; a rejected attempt does not consume quota.
    pub fn check_and_increment(&self, fee_payer: &Pubkey, now: Instant) -> bool {
        if self.entries.len() > PRUNE_THRESHOLD {
            self.prune_expired(now);
        }

        let mut entry = self.entries.entry(*fee_payer).or_insert(WindowState {
            count: 0,
            window_start: now,
        });

        if now.saturating_duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= self.max_per_window {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Transactions admitted for `fee_payer` in its current window
    pub fn current_count(&self, fee_payer: &Pubkey, now: Instant) -> usize {
        self.entries
            .get(fee_payer)
            .filter(|state| now.saturating_duration_since(state.window_start) < self.window)
            .map(|state| state.count)
            .unwrap_or(0)
    }

    /// Drop entries whose window has elapsed
    pub fn prune_expired(&self, now: Instant) {
        let window = self.window;
        self.entries
            .retain(|_, state| now.saturating_duration_since(state.window_start) < window);
    }

    pub fn tracked_payers(&self) -> usize {
        self.entries.len()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_per_window(&self) -> usize {
        self.max_per_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_eleventh_transaction_rejected_then_window_resets() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 10);
        let payer = Pubkey::new_unique();

        for _ in 0..10 {
            assert!(limiter.check_and_increment(&payer, Instant::now()));
        }
        assert!(!limiter.check_and_increment(&payer, Instant::now()));
        assert_eq!(limiter.current_count(&payer, Instant::now()), 10);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check_and_increment(&payer, Instant::now()));
        assert_eq!(limiter.current_count(&payer, Instant::now()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payers_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        let a = Pubkey::new_unique();
        let b = Pubkey::new_unique();

        assert!(limiter.check_and_increment(&a, Instant::now()));
        assert!(!limiter.check_and_increment(&a, Instant::now()));
        assert!(limiter.check_and_increment(&b, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_expired() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 5);
        for _ in 0..3 {
            limiter.check_and_increment(&Pubkey::new_unique(), Instant::now());
        }
        assert_eq!(limiter.tracked_payers(), 3);

        tokio::time::advance(Duration::from_secs(11)).await;
        limiter.prune_expired(Instant::now());
        assert_eq!(limiter.tracked_payers(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_never_exceed_quota() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60), 10));
        let payer = Pubkey::new_unique();
        let now = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check_and_increment(&payer, now)
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
