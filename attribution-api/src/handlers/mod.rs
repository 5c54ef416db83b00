use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::error;

pub mod app;
mod conversion;
mod reporting;
mod visit;

pub use app::add_routes;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, msg: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: msg.to_owned(),
        }),
    )
}

fn bad_request(msg: &str) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, msg)
}

fn not_found(msg: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, msg)
}

fn internal_error<E>(err: E) -> ApiError
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}
