use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::social::SocialError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Social(#[from] SocialError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

fn internal() -> (StatusCode, serde_json::Value) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": "Internal server error" }),
    )
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, json!({ "error": "Unauthorized" }))
            }
            AppError::Social(e) => match e {
                SocialError::InvalidInput(_) | SocialError::SelfFollowRejected => {
                    (StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }))
                }
                SocialError::DuplicateEmail | SocialError::DuplicateUsername => {
                    (StatusCode::CONFLICT, json!({ "error": e.to_string() }))
                }
                SocialError::AuthenticationFailed => {
                    (StatusCode::UNAUTHORIZED, json!({ "error": e.to_string() }))
                }
                SocialError::UnknownTarget(_) => {
                    (StatusCode::NOT_FOUND, json!({ "error": e.to_string() }))
                }
                SocialError::PartialFanoutFailure {
                    post,
                    not_delivered,
                } => {
                    tracing::error!(
                        post_id = post.id,
                        author_id = post.author_id,
                        ?not_delivered,
                        "Partial fan-out"
                    );
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        json!({
                            "error": e.to_string(),
                            "post": post,
                            "not_delivered": not_delivered,
                        }),
                    )
                }
                SocialError::Hashing(err) => {
                    tracing::error!("Hashing error: {}", err);
                    internal()
                }
                SocialError::HashingTask(err) => {
                    tracing::error!("Hashing task error: {}", err);
                    internal()
                }
                SocialError::Persistence(err) => {
                    tracing::error!("Persistence error: {}", err);
                    internal()
                }
            },
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                internal()
            }
            AppError::Pool(e) => {
                tracing::error!("Pool error: {}", e);
                internal()
            }
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
