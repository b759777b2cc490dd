use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{connect_info::ConnectInfo, State},
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::state::AppState;

/// Guards the voice and cover-art endpoints, which spend provider credits.
pub async fn ai_rate_limit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let socket_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|value| value.0);
    let key = client_identity(request.headers(), socket_addr, state.config.trust_proxy);

    if !state.ai_limiter.check_and_count(&key) {
        tracing::warn!(client = %key, path = %request.uri().path(), "AI rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Too many requests from this IP, please try again after 15 minutes"
            })),
        )
            .into_response();
    }

    next.run(request).await
}

fn client_identity(
    headers: &HeaderMap,
    socket_addr: Option<SocketAddr>,
    trust_proxy: bool,
) -> String {
    if trust_proxy {
        if let Some(value) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            if let Some(first) = value.split(',').next() {
                let candidate = first.trim();
                if !candidate.is_empty() {
                    return candidate.to_string();
                }
            }
        }

        if let Some(value) = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
        {
            let candidate = value.trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }

    socket_addr
        .map(|address| address.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
