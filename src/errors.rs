//! Application error model with CLI error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to a stable machine-readable code and a process exit
//! code for the command-line surface.

use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers every failure the sync engine, cache store and protocol client may
/// report. Each variant maps to a stable `code` string in [`AppError::code`].
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (account, mailbox, message)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure (bad credentials, account disabled)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Transport failure (TCP connect, TLS handshake, greeting, dropped session)
    #[error("connection failed: {0}")]
    Connection(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Conflict (mailbox UIDVALIDITY changed under a message reference)
    #[error("conflict: {0}")]
    Conflict(String),
    /// Another run currently holds the sync lock for the mailbox
    #[error("sync already in progress: {0}")]
    SyncInProgress(String),
    /// Local cache store failure (SQLite, filesystem)
    #[error("cache store error: {0}")]
    Store(String),
    /// Internal error (unexpected failure, protocol violation)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Stable snake_case code for scripting against CLI output
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::AuthFailed(_) => "auth_failed",
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::Conflict(_) => "conflict",
            Self::SyncInProgress(_) => "sync_in_progress",
            Self::Store(_) => "store",
            Self::Internal(_) => "internal",
        }
    }

    /// Process exit code
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → 2
    /// - `NotFound` → 3
    /// - `AuthFailed` → 4
    /// - `Connection` / `Timeout` → 5
    /// - `Conflict` / `SyncInProgress` → 6
    /// - `Store` → 7
    /// - `Internal` → 1
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) => 2,
            Self::NotFound(_) => 3,
            Self::AuthFailed(_) => 4,
            Self::Connection(_) | Self::Timeout(_) => 5,
            Self::Conflict(_) | Self::SyncInProgress(_) => 6,
            Self::Store(_) => 7,
            Self::Internal(_) => 1,
        }
    }

    /// Render as the JSON error object printed by the CLI
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {e}"))
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn codes_and_exit_codes_are_distinct_per_category() {
        let err = AppError::NotFound("mailbox 'Nope'".to_owned());
        assert_eq!(err.code(), "not_found");
        assert_eq!(err.exit_code(), 3);
        assert_eq!(AppError::Timeout("x".to_owned()).exit_code(), 5);
        assert_eq!(AppError::Connection("x".to_owned()).exit_code(), 5);
        assert_eq!(AppError::SyncInProgress("x".to_owned()).code(), "sync_in_progress");
    }

    #[test]
    fn json_rendering_carries_code_and_message() {
        let value = AppError::invalid("limit must be positive").to_json();
        assert_eq!(value["error"]["code"], "invalid_input");
        assert_eq!(
            value["error"]["message"],
            "invalid input: limit must be positive"
        );
    }

    #[test]
    fn sqlite_errors_become_store_errors() {
        let err: AppError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.code(), "store");
    }
}
