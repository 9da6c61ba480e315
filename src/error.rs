use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

/// Why a lookup came back empty. Both collapse to 404 at the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    /// A list query matched zero rows.
    EmptyResult,
    /// An ID does not reference an existing row.
    InvalidReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Forbidden,
    Unauthorized,
    BadRequest,
    Transient,
    Internal,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{message}")]
    NotFound {
        code: &'static str,
        message: &'static str,
        reason: NotFoundReason,
    },

    #[error("{message}")]
    Conflict {
        code: &'static str,
        message: &'static str,
    },

    #[error("{message}")]
    Forbidden {
        code: &'static str,
        message: &'static str,
    },

    #[error("not logged in")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn empty(code: &'static str, message: &'static str) -> Self {
        RelayError::NotFound {
            code,
            message,
            reason: NotFoundReason::EmptyResult,
        }
    }

    pub fn missing(code: &'static str, message: &'static str) -> Self {
        RelayError::NotFound {
            code,
            message,
            reason: NotFoundReason::InvalidReference,
        }
    }

    pub fn forbidden(code: &'static str, message: &'static str) -> Self {
        RelayError::Forbidden { code, message }
    }

    pub fn conflict(code: &'static str, message: &'static str) -> Self {
        RelayError::Conflict { code, message }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::NotFound { .. } => ErrorKind::NotFound,
            RelayError::Conflict { .. } => ErrorKind::Conflict,
            RelayError::Forbidden { .. } => ErrorKind::Forbidden,
            RelayError::Unauthorized => ErrorKind::Unauthorized,
            RelayError::BadRequest(_) => ErrorKind::BadRequest,
            RelayError::Transient(_) => ErrorKind::Transient,
            RelayError::Database(_) | RelayError::Config(_) | RelayError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn not_found_reason(&self) -> Option<NotFoundReason> {
        match self {
            RelayError::NotFound { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::NotFound { code, .. }
            | RelayError::Conflict { code, .. }
            | RelayError::Forbidden { code, .. } => code,
            RelayError::Unauthorized => "not-logged-in",
            RelayError::BadRequest(_) => "bad-request",
            RelayError::Transient(_) => "unavailable",
            RelayError::Database(_) | RelayError::Config(_) | RelayError::Internal(_) => {
                "internal-error"
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                RelayError::Transient(err.to_string())
            }
            sqlx::Error::Database(db) if is_lock_contention(db.code().as_deref()) => {
                RelayError::Transient(err.to_string())
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                RelayError::missing("invalid-reference", "Referenced record does not exist.")
            }
            _ => RelayError::Database(err),
        }
    }
}

impl From<lapin::Error> for RelayError {
    fn from(err: lapin::Error) -> Self {
        RelayError::Transient(format!("broker: {err}"))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::BadRequest(err.to_string())
    }
}

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6), including their extended codes.
fn is_lock_contention(code: Option<&str>) -> bool {
    code.and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

/// True when `err` is a unique-constraint violation reported by the database.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let message = match &self {
            // Internal details stay in the logs.
            RelayError::Database(_) | RelayError::Config(_) | RelayError::Internal(_) => {
                "Internal server error.".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "code": self.code(),
            "message": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_missing_share_status_but_not_reason() {
        let empty = RelayError::empty("convs-not-found", "Conversations not found.");
        let missing = RelayError::missing("conv-not-found", "Conversation not found.");

        assert_eq!(empty.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(empty.not_found_reason(), Some(NotFoundReason::EmptyResult));
        assert_eq!(
            missing.not_found_reason(),
            Some(NotFoundReason::InvalidReference)
        );
    }

    #[test]
    fn pool_timeouts_are_transient() {
        let err: RelayError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            RelayError::conflict("duplicate-conv", "dup").code(),
            "duplicate-conv"
        );
        assert_eq!(RelayError::Unauthorized.code(), "not-logged-in");
        assert_eq!(
            RelayError::forbidden("conv/user-muted", "User has muted you.").status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn busy_and_locked_codes_are_contention() {
        assert!(is_lock_contention(Some("5")));
        assert!(is_lock_contention(Some("6")));
        // SQLITE_BUSY_SNAPSHOT
        assert!(is_lock_contention(Some("517")));
        assert!(!is_lock_contention(Some("19")));
        assert!(!is_lock_contention(Some("2067")));
        assert!(!is_lock_contention(None));
    }
}
