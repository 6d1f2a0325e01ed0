//! Core rate limiter implementation.

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::backend::CounterBackend;
use super::key::{ClientKey, KeyExtractor, RemoteAddrKey};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Outcome of a rate limit check for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Requests allowed per window
    pub limit: u64,
    /// Requests left in the current window, never negative
    pub remaining: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    /// Whether this request went over the limit
    pub exceeded: bool,
}

impl RateLimitDecision {
    fn from_window(limit: u64, count: u64, window_start: Instant, interval: Duration) -> Self {
        let until_reset = (window_start + interval).saturating_duration_since(Instant::now());

        Self {
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: reset_time(until_reset),
            exceeded: count > limit,
        }
    }

    /// Reset time as Unix seconds, the form used in `X-Ratelimit-Reset`.
    pub fn reset_timestamp(&self) -> i64 {
        self.reset_at.timestamp()
    }

    /// Set the `X-Ratelimit-*` headers on a response.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_timestamp()));
    }
}

fn reset_time(until_reset: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(until_reset).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Emitted after a request has been found over the limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitExceeded {
    pub key: ClientKey,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
}

/// Receives limit-exceeded notifications.
///
/// Called synchronously once the decision is final; implementations must
/// not block.
pub trait ExceededObserver: Send + Sync {
    fn on_exceeded(&self, event: &LimitExceeded);
}

/// Logs every limit-exceeded event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl ExceededObserver for LogObserver {
    fn on_exceeded(&self, event: &LimitExceeded) {
        info!(
            key = %event.key,
            limit = event.limit,
            reset = event.reset_at.timestamp(),
            "Client has hit rate limit"
        );
    }
}

/// Per-client fixed-window rate limiter.
///
/// Every check increments the client's counter before deciding, so rejected
/// requests count too and concurrent requests at the boundary cannot all be
/// admitted.
pub struct RateLimiter {
    /// Counter storage
    backend: Arc<dyn CounterBackend>,
    /// Requests allowed per window
    limit: u64,
    /// Window length
    interval: Duration,
    extractor: Arc<dyn KeyExtractor>,
    observer: Arc<dyn ExceededObserver>,
}

impl RateLimiter {
    /// Create a rate limiter keyed by remote address that logs rejections.
    pub fn new(backend: Arc<dyn CounterBackend>, limit: u64, interval: Duration) -> Self {
        Self {
            backend,
            limit,
            interval,
            extractor: Arc::new(RemoteAddrKey),
            observer: Arc::new(LogObserver),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn KeyExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExceededObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How requests are mapped to client keys.
    pub fn extractor(&self) -> &Arc<dyn KeyExtractor> {
        &self.extractor
    }

    pub fn backend(&self) -> &Arc<dyn CounterBackend> {
        &self.backend
    }

    /// Derive the client key for a request.
    pub fn key_for(&self, request: &Request) -> ClientKey {
        self.extractor.extract(request)
    }

    /// Count a request against its client's quota and decide allow/deny.
    pub fn check(&self, request: &Request) -> RateLimitDecision {
        let key = self.key_for(request);
        self.check_key(&key)
    }

    /// Count one request for `key` and decide allow/deny.
    pub fn check_key(&self, key: &ClientKey) -> RateLimitDecision {
        let (count, window_start) = self.backend.increment(key, self.interval);
        let decision = RateLimitDecision::from_window(self.limit, count, window_start, self.interval);

        trace!(
            key = %key,
            count = count,
            remaining = decision.remaining,
            "Checked rate limit"
        );

        if decision.exceeded {
            debug!(key = %key, count = count, limit = self.limit, "Rate limit exceeded");
            self.observer.on_exceeded(&LimitExceeded {
                key: key.clone(),
                limit: self.limit,
                reset_at: decision.reset_at,
            });
        }

        decision
    }

    /// Report a request's quota state without counting it.
    pub fn snapshot(&self, request: &Request) -> RateLimitDecision {
        let key = self.key_for(request);
        self.snapshot_key(&key)
    }

    /// Report the quota state of `key` without counting a request.
    pub fn snapshot_key(&self, key: &ClientKey) -> RateLimitDecision {
        match self.backend.peek(key, self.interval) {
            Some((count, window_start)) => {
                RateLimitDecision::from_window(self.limit, count, window_start, self.interval)
            }
            None => RateLimitDecision {
                limit: self.limit,
                remaining: self.limit,
                reset_at: reset_time(self.interval),
                exceeded: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MemoryBackend;
    use parking_lot::Mutex;

    const MINUTE: Duration = Duration::from_secs(60);

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<LimitExceeded>>,
    }

    impl ExceededObserver for RecordingObserver {
        fn on_exceeded(&self, event: &LimitExceeded) {
            self.events.lock().push(event.clone());
        }
    }

    fn limiter(limit: u64) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryBackend::new(Duration::from_secs(10))), limit, MINUTE)
    }

    #[tokio::test]
    async fn test_fourth_request_exceeds_limit_of_three() {
        let limiter = limiter(3);
        let key = ClientKey::new("192.0.2.1");

        let decisions: Vec<_> = (0..4).map(|_| limiter.check_key(&key)).collect();

        let exceeded: Vec<_> = decisions.iter().map(|d| d.exceeded).collect();
        let remaining: Vec<_> = decisions.iter().map(|d| d.remaining).collect();
        assert_eq!(exceeded, vec![false, false, false, true]);
        assert_eq!(remaining, vec![2, 1, 0, 0]);
    }

    #[tokio::test]
    async fn test_limiting_is_monotonic_within_window() {
        let limiter = limiter(2);
        let key = ClientKey::new("192.0.2.1");

        limiter.check_key(&key);
        limiter.check_key(&key);

        for _ in 0..10 {
            let decision = limiter.check_key(&key);
            assert!(decision.exceeded);
            assert_eq!(decision.remaining, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_readmits() {
        let limiter = limiter(1);
        let key = ClientKey::new("192.0.2.1");

        assert!(!limiter.check_key(&key).exceeded);
        assert!(limiter.check_key(&key).exceeded);

        tokio::time::advance(MINUTE).await;

        let decision = limiter.check_key(&key);
        assert!(!decision.exceeded);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_reset_at_is_window_end() {
        let limiter = limiter(5);
        let before = Utc::now();

        let decision = limiter.check_key(&ClientKey::new("192.0.2.1"));

        let delta = decision.reset_at - before;
        assert!(delta <= chrono::Duration::seconds(61));
        assert!(delta >= chrono::Duration::seconds(59));
    }

    #[tokio::test]
    async fn test_observer_notified_only_when_exceeded() {
        let observer = Arc::new(RecordingObserver::default());
        let limiter = limiter(1).with_observer(observer.clone());
        let key = ClientKey::new("198.51.100.4");

        limiter.check_key(&key);
        assert!(observer.events.lock().is_empty());

        limiter.check_key(&key);
        let events = observer.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, key);
        assert_eq!(events[0].limit, 1);
    }

    #[tokio::test]
    async fn test_snapshot_does_not_count() {
        let limiter = limiter(3);
        let key = ClientKey::new("192.0.2.1");

        let fresh = limiter.snapshot_key(&key);
        assert_eq!(fresh.remaining, 3);
        assert!(!fresh.exceeded);
        assert!(limiter.backend().is_empty());

        limiter.check_key(&key);
        for _ in 0..5 {
            assert_eq!(limiter.snapshot_key(&key).remaining, 2);
        }
    }

    #[tokio::test]
    async fn test_snapshot_reports_exceeded_state() {
        let limiter = limiter(1);
        let key = ClientKey::new("192.0.2.1");

        limiter.check_key(&key);
        limiter.check_key(&key);

        let decision = limiter.snapshot_key(&key);
        assert!(decision.exceeded);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_apply_headers() {
        let limiter = limiter(10);
        let decision = limiter.check_key(&ClientKey::new("192.0.2.1"));

        let mut headers = HeaderMap::new();
        decision.apply_headers(&mut headers);

        assert_eq!(headers[X_RATELIMIT_LIMIT], "10");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "9");
        assert_eq!(
            headers[X_RATELIMIT_RESET].to_str().unwrap(),
            decision.reset_timestamp().to_string()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_never_exceed_limit() {
        let limiter = Arc::new(limiter(50));
        let key = ClientKey::new("192.0.2.1");

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let key = key.clone();
                tokio::spawn(async move { !limiter.check_key(&key).exceeded })
            })
            .collect();

        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(admitted, 50);
    }
}
