use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::models::{BargainId, BargainStatus, Party};

/// Everything a bargain operation can refuse with.
///
/// None of these are retried inside the crate: the caller re-reads the
/// authoritative record and decides whether trying again still makes sense.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BargainError {
    #[error("Bargain {0} not found")]
    NotFound(BargainId),
    #[error("Cannot {action} while bargain is {status}")]
    InvalidStateForAction {
        action: &'static str,
        status: BargainStatus,
    },
    #[error("The {0} cannot respond to its own offer")]
    SelfAcceptance(Party),
    #[error("No offer to respond to")]
    NoQualifyingOffer,
    #[error("Bargain {id} changed (expected revision {expected}, found {found})")]
    ConcurrentWriteConflict {
        id: BargainId,
        expected: u64,
        found: u64,
    },
    #[error("User {user_id} is not the {party} of bargain {id}")]
    NotParticipant {
        id: BargainId,
        user_id: i64,
        party: Party,
    },
    #[error("Message text is empty")]
    EmptyMessage,
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl BargainError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BargainError::NotFound(_) => StatusCode::NOT_FOUND,
            BargainError::InvalidStateForAction { .. }
            | BargainError::SelfAcceptance(_)
            | BargainError::NoQualifyingOffer
            | BargainError::ConcurrentWriteConflict { .. } => StatusCode::CONFLICT,
            BargainError::NotParticipant { .. } | BargainError::Forbidden(_) => {
                StatusCode::FORBIDDEN
            }
            BargainError::EmptyMessage => StatusCode::BAD_REQUEST,
            BargainError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BargainError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        } else {
            log::info!("Request refused: {}", self);
        }
        let body = axum::Json(json!({
            "error": self.to_string(),
            "status": status.as_u16()
        }));
        (status, body).into_response()
    }
}

pub type BargainResult<T> = Result<T, BargainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BargainError::InvalidStateForAction {
            action: "post a message",
            status: BargainStatus::Rejected,
        };
        assert_eq!(err.to_string(), "Cannot post a message while bargain is rejected");
        assert_eq!(
            BargainError::SelfAcceptance(Party::Vendor).to_string(),
            "The vendor cannot respond to its own offer"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(BargainError::NotFound(1).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(BargainError::NoQualifyingOffer.status_code(), StatusCode::CONFLICT);
        assert_eq!(BargainError::EmptyMessage.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            BargainError::Storage("down".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
