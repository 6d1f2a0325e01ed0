//! Gateway middleware.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Response as HttpResponse, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tower_http::catch_panic::ResponseForPanic;
use tracing::{error, warn};

use super::handlers::json_error;
use crate::ratelimit::{RateLimiter, RemoteAddr};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const X_ACCEL_EXPIRES: HeaderName = HeaderName::from_static("x-accel-expires");

const NO_CACHE_CONTROL: &str = "no-cache, no-store, no-transform, must-revalidate, private, max-age=0";
const EPOCH: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// Whether forwarded-client headers from a reverse proxy are trusted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyTrust(pub bool);

/// Record the effective client address as a [`RemoteAddr`] extension.
///
/// Uses the peer address unless proxy headers are trusted, in which case
/// the first hop of `X-Forwarded-For` (or `X-Real-IP`) wins.
pub async fn real_ip(State(trust): State<ProxyTrust>, mut request: Request, next: Next) -> Response {
    let forwarded = if trust.0 {
        forwarded_client(request.headers())
    } else {
        None
    };

    let remote = forwarded.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
    });

    if let Some(addr) = remote {
        request.extensions_mut().insert(RemoteAddr(addr));
    }

    next.run(request).await
}

fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    let first_hop = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    first_hop(X_FORWARDED_FOR).or_else(|| first_hop(X_REAL_IP))
}

/// Count the request against its client's quota; reject with 429 once over.
pub async fn enforce_rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let decision = limiter.check(&request);

    if decision.exceeded {
        let mut response = json_error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
        decision.apply_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    decision.apply_headers(response.headers_mut());
    response
}

/// Attach the caller's current quota headers without counting the request.
pub async fn quota_headers(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let decision = limiter.snapshot(&request);

    let mut response = next.run(request).await;
    decision.apply_headers(response.headers_mut());
    response
}

/// Disable client and proxy caching.
pub async fn no_cache(mut request: Request, next: Next) -> Response {
    let headers = request.headers_mut();
    for name in [
        header::ETAG,
        header::IF_MODIFIED_SINCE,
        header::IF_MATCH,
        header::IF_NONE_MATCH,
        header::IF_RANGE,
        header::IF_UNMODIFIED_SINCE,
    ] {
        headers.remove(name);
    }

    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(header::EXPIRES, HeaderValue::from_static(EPOCH));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE_CONTROL));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(X_ACCEL_EXPIRES, HeaderValue::from_static("0"));
    response
}

/// Bounds concurrently running requests, with a bounded wait queue.
pub struct Throttle {
    /// Requests allowed to run at once
    running: Semaphore,
    /// Requests admitted at all, running or waiting
    admitted: Semaphore,
    /// How long a waiting request may wait for a slot
    timeout: Duration,
}

impl Throttle {
    /// Permit counts are capped at [`Semaphore::MAX_PERMITS`].
    pub fn new(limit: usize, backlog: usize, timeout: Duration) -> Self {
        let limit = limit.min(Semaphore::MAX_PERMITS);
        let admitted = limit.saturating_add(backlog).min(Semaphore::MAX_PERMITS);

        Self {
            running: Semaphore::new(limit),
            admitted: Semaphore::new(admitted),
            timeout,
        }
    }
}

pub async fn throttle(State(throttle): State<Arc<Throttle>>, request: Request, next: Next) -> Response {
    let Ok(_admitted) = throttle.admitted.try_acquire() else {
        warn!("Throttle backlog full, rejecting request");
        return json_error(StatusCode::TOO_MANY_REQUESTS, "server capacity exceeded");
    };

    let _running = match tokio::time::timeout(throttle.timeout, throttle.running.acquire()).await {
        Ok(Ok(permit)) => permit,
        _ => {
            warn!(timeout = ?throttle.timeout, "Timed out waiting for a request slot");
            return json_error(StatusCode::TOO_MANY_REQUESTS, "timed out waiting for capacity");
        }
    };

    next.run(request).await
}

/// Turns a handler panic into a JSON 500.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicHandler {
    /// Include the panic message in the response body
    pub debug: bool,
}

impl ResponseForPanic for PanicHandler {
    type ResponseBody = axum::body::Body;

    fn response_for_panic(&mut self, err: Box<dyn Any + Send + 'static>) -> HttpResponse<Self::ResponseBody> {
        let details = if let Some(s) = err.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = err.downcast_ref::<&str>() {
            s.to_string()
        } else {
            "unknown panic".to_string()
        };

        error!(panic = %details, "Handler panicked");

        let body = if self.debug {
            json!({ "error": "internal server error", "details": details })
        } else {
            json!({ "error": "internal server error" })
        };

        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}
