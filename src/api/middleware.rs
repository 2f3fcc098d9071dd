// Request guards: allowed hosts, admin token, CORS and cache headers

use super::AppState;
use crate::config::Settings;
use crate::error::Error;
use axum::{
    extract::{Request, State},
    http::{header, request::Parts, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowOrigin, CorsLayer};

// =============================================================================
// ALLOWED HOSTS
// =============================================================================

/// Reject requests whose `Host` is not in `ALLOWED_HOSTS` with 400.
pub async fn check_allowed_host(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))
        .unwrap_or_default()
        .to_string();

    if state.settings.host_allowed(&host) {
        return next.run(request).await;
    }

    tracing::warn!(%host, "request for disallowed host");
    let body = serde_json::json!({
        "success": false,
        "data": null,
        "error": format!("Invalid HTTP_HOST header: '{}'", host),
    });
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

// =============================================================================
// ADMIN TOKEN
// =============================================================================

/// Same-length constant-time comparison; lengths are compared after.
fn token_matches(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();

    let max_len = provided.len().max(expected.len());
    let mut padded_provided = vec![0u8; max_len];
    let mut padded_expected = vec![0u8; max_len];
    padded_provided[..provided.len()].copy_from_slice(provided);
    padded_expected[..expected.len()].copy_from_slice(expected);

    let bytes_match: bool = padded_provided.ct_eq(&padded_expected).into();
    bytes_match && provided.len() == expected.len()
}

/// Admin routes need `Authorization: Bearer <TOKEN>`; without a configured
/// token they are closed.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let Some(expected) = state.settings.token.as_deref() else {
        tracing::warn!(reason = "no_token_configured", "admin request refused");
        return Err(Error::Unauthorized);
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token_matches(token, expected) => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!(reason = "invalid_token", "admin request refused");
            Err(Error::Unauthorized)
        }
        None => {
            tracing::warn!(reason = "missing_authorization_header", "admin request refused");
            Err(Error::Unauthorized)
        }
    }
}

// =============================================================================
// CACHE & CORS
// =============================================================================

/// `Cache-Control: max-age=N` on successful GETs when `CACHE_MAX_AGE` is set.
pub async fn cache_control(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let is_get = request.method() == Method::GET;
    let mut response = next.run(request).await;

    if let Some(max_age) = state.settings.cache_max_age {
        if is_get && response.status().is_success() && !response.headers().contains_key(header::CACHE_CONTROL) {
            if let Ok(value) = HeaderValue::from_str(&format!("max-age={}", max_age)) {
                response.headers_mut().insert(header::CACHE_CONTROL, value);
            }
        }
    }
    response
}

pub fn cors_layer(settings: Arc<Settings>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _parts: &Parts| {
            origin
                .to_str()
                .map(|o| settings.origin_allowed(o))
                .unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_matches() {
        assert!(token_matches("s3cret", "s3cret"));
        assert!(!token_matches("s3cre", "s3cret"));
        assert!(!token_matches("s3cret!", "s3cret"));
        assert!(!token_matches("", "s3cret"));
    }
}
