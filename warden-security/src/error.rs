use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use warden_core::CoreError;

use crate::audit::AuditError;
use crate::rate_limit::RateLimitError;
use crate::rbac::{PermissionError, RoleError};
use crate::session::SessionError;
use crate::token::TokenError;

/// How a failure is reported at the request boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityOutcome {
    Unauthenticated,
    Forbidden,
    Throttled,
    Internal,
}

impl SecurityOutcome {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SecurityOutcome::Unauthenticated => StatusCode::UNAUTHORIZED,
            SecurityOutcome::Forbidden => StatusCode::FORBIDDEN,
            SecurityOutcome::Throttled => StatusCode::TOO_MANY_REQUESTS,
            SecurityOutcome::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("Missing bearer token")]
    MissingCredentials,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Role(#[from] RoleError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SecurityError {
    pub fn outcome(&self) -> SecurityOutcome {
        match self {
            SecurityError::MissingCredentials
            | SecurityError::Token(_)
            | SecurityError::Session(_) => SecurityOutcome::Unauthenticated,
            SecurityError::Permission(_) | SecurityError::Role(_) => SecurityOutcome::Forbidden,
            SecurityError::RateLimit(_) => SecurityOutcome::Throttled,
            SecurityError::Audit(_) | SecurityError::Core(_) => SecurityOutcome::Internal,
        }
    }
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        if let SecurityError::RateLimit(err) = self {
            return err.into_response();
        }

        let outcome = self.outcome();
        let (message, details) = match outcome {
            SecurityOutcome::Internal => {
                tracing::error!(error = %self, "Security subsystem failure");
                ("Internal server error", None)
            }
            SecurityOutcome::Forbidden => ("Forbidden", Some(self.to_string())),
            SecurityOutcome::Throttled => ("Too Many Requests", None),
            SecurityOutcome::Unauthenticated => ("Unauthorized", Some(self.to_string())),
        };

        let mut body = json!({ "error": message });
        if let Some(details) = details {
            body["details"] = json!(details);
        }

        (outcome.status_code(), Json(body)).into_response()
    }
}

pub type SecurityResult<T> = Result<T, SecurityError>;
