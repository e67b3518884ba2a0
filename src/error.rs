use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::access::{AccessError, DenialReason, SourceError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("subscription source error: {0}")]
    Source(#[from] SourceError),
    #[error("{0}")]
    AccessDenied(DenialReason),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Message(String),
}

impl From<AccessError> for AppError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::AccessDenied(reason) => AppError::AccessDenied(reason),
            AccessError::MalformedSubscriptionPayload(_) => AppError::BadRequest(err.to_string()),
            AccessError::HandlerFailure { .. } => AppError::Message(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::AccessDenied(_) | AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Source(_) => StatusCode::BAD_GATEWAY,
            AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        if let AppError::AccessDenied(reason) = self {
            let body = json!({
                "allowed": false,
                "reasonCode": reason.to_string(),
                "denialCode": reason.code(),
            });
            return (status, Json(body)).into_response();
        }
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
