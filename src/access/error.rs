use thiserror::Error;

use super::models::DenialReason;

/// key: access-errors -> malformed payloads, denials, observer faults
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("malformed subscription payload: {0}")]
    MalformedSubscriptionPayload(String),
    #[error("{0}")]
    AccessDenied(DenialReason),
    #[error("handler for `{event}` failed: {message}")]
    HandlerFailure {
        event: &'static str,
        message: String,
    },
}

impl AccessError {
    pub fn denial(&self) -> Option<&DenialReason> {
        match self {
            AccessError::AccessDenied(reason) => Some(reason),
            _ => None,
        }
    }
}
