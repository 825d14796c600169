use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Implemented by a binary's `Arc<AppState>` to expose the bearer token
/// [`require_bearer_token`] checks incoming requests against (§6
/// "bearer-token required"). Kept as a trait rather than a concrete type so
/// the middleware stays reusable across every binary's own state shape —
/// generalized from the teacher's per-source `auth_mode` dispatch in
/// `skynet-gateway::http::webhooks::webhook_handler`.
pub trait BearerTokenSource {
    fn expected_bearer_token(&self) -> &str;
}

/// Axum middleware rejecting any request whose `Authorization` header does
/// not carry the expected bearer token, with a 401 JSON body. Wire up with
/// `axum::middleware::from_fn_with_state(state.clone(), require_bearer_token::<Arc<AppState>>)`.
pub async fn require_bearer_token<S>(State(state): State<S>, req: Request, next: Next) -> Response
where
    S: BearerTokenSource + Clone + Send + Sync + 'static,
{
    match verify_bearer_token(req.headers(), state.expected_bearer_token()) {
        Ok(()) => next.run(req).await,
        Err(reason) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized", "reason": reason})),
        )
            .into_response(),
    }
}

/// Verify a static bearer token in the `Authorization: Bearer <token>`
/// header. Every service's HTTP surface in this pipeline expects one (§6
/// "bearer-token required"); the token itself is resolved by each binary's
/// `SecretResolver`, not checked here.
pub fn verify_bearer_token(headers: &HeaderMap, expected: &str) -> Result<(), String> {
    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing Authorization header".to_string())?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| "Authorization header must use Bearer scheme".to_string())?;

    if token == expected {
        Ok(())
    } else {
        Err("bearer token mismatch".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret-1"));
        assert!(verify_bearer_token(&headers, "secret-1").is_ok());
    }

    #[test]
    fn rejects_mismatched_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer wrong"));
        assert!(verify_bearer_token(&headers, "secret-1").is_err());
    }

    #[test]
    fn rejects_missing_header() {
        let headers = HeaderMap::new();
        assert!(verify_bearer_token(&headers, "secret-1").is_err());
    }
}
