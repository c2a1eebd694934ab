//! Backoff policy for transient collaborator failures.
//!
//! Delays double per retry from `base` and stop growing at `max`:
//! with 500 ms and 30 s that is 500 ms → 1 s → 2 s → … → 30 s. Doubling
//! spreads concurrent workers out when an inference endpoint recovers,
//! instead of having them all retry at the same instant.

use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_millis(500, 30_000)
    }
}

impl BackoffPolicy {
    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms.max(base_ms)),
        }
    }

    /// Delay before retry number `retry` (1-based): `base × 2^(retry-1)`, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Resolve once the cancellation flag is raised. Never resolves if the
/// sender is gone without raising it.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
pub(crate) async fn sleep_or_cancel(delay: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancelled(rx) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_then_cap() {
        let p = BackoffPolicy::from_millis(500, 3_000);
        let ms: Vec<u128> = (1..=5).map(|n| p.delay(n).as_millis()).collect();
        assert_eq!(ms, vec![500, 1000, 2000, 3000, 3000]);
    }

    #[test]
    fn huge_retry_numbers_do_not_overflow() {
        let p = BackoffPolicy::default();
        assert_eq!(p.delay(u32::MAX), p.max);
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_cancellation() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            sleep_or_cancel(Duration::from_secs(60), &mut rx).await
        });
        tx.send_replace(true);
        let finished = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sleep should end promptly")
            .unwrap();
        assert!(!finished);
    }

    #[tokio::test]
    async fn sleep_completes_without_cancellation() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(sleep_or_cancel(Duration::from_millis(1), &mut rx).await);
    }
}
