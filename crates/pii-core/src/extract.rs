//! Shared JSON body extractor (§7.1 "Shape error").
//!
//! Axum's own `Json<T>` extractor returns 422 Unprocessable Entity for a
//! body that parses as JSON but is missing a required field — a
//! `JsonDataError` rejection. Every HTTP surface in this pipeline treats
//! that the same as malformed JSON or a missing body: one undifferentiated
//! shape error, always a 400 (§4.1, §4.3, §6). `ShapeJson<T>` wraps
//! `Json<T>` and collapses every rejection kind into that single 400 path.

use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde_json::json;

pub struct ShapeJson<T>(pub T);

impl<T, S> FromRequest<S> for ShapeJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ShapeJson(value)),
            Err(rejection) => Err((
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid request body", "reason": rejection.to_string()})),
            )
                .into_response()),
        }
    }
}
