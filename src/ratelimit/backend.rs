//! Counter backend trait for abstracting rate limit storage.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

use super::key::ClientKey;

/// Trait for counter backend implementations.
///
/// A backend stores per-key request counts over a rolling window. It is a
/// best-effort counter: none of its operations fail, and a restart loses
/// every count.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Atomically record one request for `key`.
    ///
    /// Starts a fresh window (count 1) when the key is absent or its window
    /// has expired, otherwise increments. Returns the post-increment count
    /// and the window start.
    fn increment(&self, key: &ClientKey, interval: Duration) -> (u64, Instant);

    /// Read the live window for `key` without recording a request.
    ///
    /// Returns `None` if the key is absent or its window has expired.
    fn peek(&self, key: &ClientKey, interval: Duration) -> Option<(u64, Instant)>;

    /// Number of keys currently tracked.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Begin the periodic background cleanup. Calling it while already
    /// running is a no-op.
    fn start(&self);

    /// Whether the background cleanup is running.
    fn is_running(&self) -> bool;

    /// Halt the background cleanup and wait for it to finish. Safe to call
    /// when never started. No cleanup pass runs after this returns.
    async fn stop(&self);
}
