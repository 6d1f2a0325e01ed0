//! Router composition.
//!
//! Middleware runs in a fixed order, outermost first:
//!
//! 1. real-IP rewrite, so everything below sees the effective client
//! 2. panic recovery
//! 3. request tracing
//! 4. trailing-slash normalization
//! 5. response compression
//! 6. backlog throttle (optional)
//! 7. route groups: `/dist` assets, the SPA entry document, and the API
//!    (CORS, no-cache, then the rate limiter)
//!
//! `/api/ping` sits outside the rate-limited group. It reports the caller's
//! quota headers without counting against them.

use axum::http::{header, HeaderValue, Method};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{any, get};
use axum::{Extension, Router};
use std::sync::Arc;
use std::time::Duration;
use tower::{Layer, ServiceBuilder};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use super::assets::SpaAssets;
use super::handlers;
use super::middleware::{self, PanicHandler, ProxyTrust, Throttle};
use crate::config::{CorsConfig, PorticoConfig};
use crate::ratelimit::{
    KeyExtractor, RateLimiter, RemoteAddrKey, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};

/// `/dist` assets are content-hashed and cached for 90 days.
const DIST_CACHE_CONTROL: &str = "public, max-age=7776000";
/// How long a request may wait for a throttle slot.
const THROTTLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Preflight responses are cached for an hour.
const CORS_MAX_AGE: Duration = Duration::from_secs(3600);

/// Routes served under the rate limiter.
pub fn api_routes() -> Router {
    Router::new().route("/api/ip", get(handlers::client_ip))
}

/// Build the gateway service.
///
/// `api` holds the rate-limited API handlers; unknown `/api` paths get a
/// JSON 404 inside the same group. `limiter` is `None` when limiting is
/// disabled.
pub fn build_router(
    config: &PorticoConfig,
    assets: Arc<SpaAssets>,
    limiter: Option<Arc<RateLimiter>>,
    api: Router,
) -> Router {
    let cors = cors_layer(&config.cors);

    let identity: Arc<dyn KeyExtractor> = match &limiter {
        Some(limiter) => Arc::clone(limiter.extractor()),
        None => Arc::new(RemoteAddrKey),
    };

    let mut api = api
        .route("/api", any(handlers::api_not_found))
        .route("/api/{*path}", any(handlers::api_not_found))
        .layer(Extension(identity));
    if let Some(limiter) = &limiter {
        api = api.layer(from_fn_with_state(Arc::clone(limiter), middleware::enforce_rate_limit));
    }
    let api = api.layer(from_fn(middleware::no_cache)).layer(cors.clone());

    let mut ping = Router::new().route("/api/ping", get(handlers::ping));
    if let Some(limiter) = limiter {
        ping = ping.layer(from_fn_with_state(limiter, middleware::quota_headers));
    }
    let ping = ping.layer(from_fn(middleware::no_cache)).layer(cors);

    let dist = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static(DIST_CACHE_CONTROL),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::VARY,
            HeaderValue::from_static("Accept-Encoding"),
        ))
        .service(ServeDir::new(assets.root()));

    let spa = Router::new()
        .fallback(handlers::spa_index)
        .with_state(assets);

    let mut routes = Router::new()
        .merge(api)
        .merge(ping)
        .nest_service("/dist", dist)
        .fallback_service(spa);

    if config.server.throttle > 0 {
        let limit = config.server.throttle;
        let throttle = Arc::new(Throttle::new(limit, limit.saturating_mul(2), THROTTLE_TIMEOUT));
        routes = routes.layer(from_fn_with_state(throttle, middleware::throttle));
    }

    let routes = routes.layer(CompressionLayer::new());
    let normalized = NormalizePathLayer::trim_trailing_slash().layer(routes);

    Router::new()
        .fallback_service(normalized)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(PanicHandler {
            debug: config.server.debug,
        }))
        .layer(from_fn_with_state(
            ProxyTrust(config.server.proxy),
            middleware::real_ip,
        ))
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origins = if config.allows_any() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE])
        .expose_headers([X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET])
        .max_age(CORS_MAX_AGE)
}
