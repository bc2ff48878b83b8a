//! Application error taxonomy
//!
//! Every failure the auth and workflow core can raise is one variant of
//! [`AppError`]. Callers that need to branch on the category (HTTP status,
//! flash message style, retry hint) match on [`AppError::kind`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Result type alias for core operations
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Application error types
///
/// Messages of the user-facing variants are German and safe to display as-is.
#[derive(Error, Debug)]
pub enum AppError {
    /// Login-time failure: bad credentials, unknown identity, locked account
    #[error("{0}")]
    Authentication(String),

    /// The actor lacks the role or relationship an operation requires
    #[error("{0}")]
    Authorization(String),

    /// A role-sufficient actor violated a workflow rule
    #[error("{0}")]
    BusinessRule(String),

    /// The presented version is stale
    #[error("{0}")]
    Conflict(String),

    /// Malformed input
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Closed set of error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Authorization,
    BusinessRule,
    Conflict,
    Validation,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::BusinessRule => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Authentication(_) => ErrorKind::Authentication,
            AppError::Authorization(_) => ErrorKind::Authorization,
            AppError::BusinessRule(_) => ErrorKind::BusinessRule,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Database(_) | AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        AppError::Authentication(message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        AppError::Authorization(message.into())
    }

    pub fn business_rule(message: impl Into<String>) -> Self {
        AppError::BusinessRule(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound(message.into())
    }

    /// Standard conflict for an entry whose version moved underneath the caller
    pub fn stale_version() -> Self {
        AppError::Conflict(
            "Der Eintrag wurde zwischenzeitlich von einer anderen Person geändert. \
             Bitte laden Sie die Seite neu."
                .to_string(),
        )
    }

    /// Message that may be shown to the end user
    pub fn user_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Internal(_) => {
                "Ein interner Fehler ist aufgetreten.".to_string()
            },
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        match &self {
            AppError::Database(e) => tracing::error!("Database error: {:?}", e),
            AppError::Internal(message) => tracing::error!("Internal error: {}", message),
            _ => {},
        }

        let status = kind.status_code();
        let body = Json(json!({
            "error": {
                "kind": kind,
                "message": self.user_message(),
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
