use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use gubae_chat::ChatError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("Missing caller identity")]
    Unauthenticated,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Too many requests")]
    RateLimited,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Chat(e) => match e {
                ChatError::ConversationNotFound(_) | ChatError::MessageNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                ChatError::ContentInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
                ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                ChatError::Forbidden => StatusCode::FORBIDDEN,
                ChatError::AlreadyMember(_) => StatusCode::OK,
                ChatError::ConflictingEdit(_) => StatusCode::CONFLICT,
                ChatError::Storage(_) | ChatError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Chat(e) => e.code(),
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::RateLimited => "rate_limited",
        }
    }

    /// Message safe to show clients; internal failures are not described.
    pub fn public_message(&self) -> String {
        match self {
            ApiError::Chat(ChatError::Storage(_) | ChatError::Internal(_)) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.public_message(),
            "code": self.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}
