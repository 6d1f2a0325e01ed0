//! Route handlers.

use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::json;
use std::sync::Arc;

use super::assets::SpaAssets;
use crate::ratelimit::KeyExtractor;

/// Build a JSON error response of the form `{"error": message}`.
pub(crate) fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// `GET|HEAD /api/ping`: liveness check.
pub async fn ping(method: Method) -> Response {
    if method == Method::HEAD {
        return StatusCode::OK.into_response();
    }

    Json(json!({ "pong": true })).into_response()
}

/// `GET /api/ip`: the identity the caller's quota is tracked against.
pub async fn client_ip(
    Extension(identity): Extension<Arc<dyn KeyExtractor>>,
    request: Request,
) -> Json<serde_json::Value> {
    let key = identity.extract(&request);
    Json(json!({ "ip": key.as_str() }))
}

/// Unknown API paths.
pub async fn api_not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// Serve the SPA entry document for any non-API path.
pub async fn spa_index(State(assets): State<Arc<SpaAssets>>, method: Method, uri: Uri) -> Response {
    if uri.path() == "/api" || uri.path().starts_with("/api/") {
        return json_error(StatusCode::NOT_FOUND, "not found");
    }

    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        assets.index(),
    )
        .into_response()
}
