//! Error taxonomy.
//!
//! Corresponds to spec.md §7. Mirrors the teacher's
//! `utilities::exceptions` pattern: one `thiserror` type per failure
//! kind, surfaced here as variants of a single closed `AppError` enum so
//! the dispatcher and JSON-RPC layer can match on `.code()` exhaustively.

use thiserror::Error;

/// The closed error taxonomy from spec.md §7.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("misconfigured: {0}")]
    Misconfigured(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error (correlation id {correlation_id})")]
    Internal { correlation_id: String },
}

impl AppError {
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(correlation_id = %correlation_id, detail = %detail, "internal error");
        AppError::Internal { correlation_id }
    }

    /// Numeric JSON-RPC error code for this taxonomy member.
    ///
    /// Standard JSON-RPC reserves -32768..-32000; application-specific
    /// codes below that range are used here, one per spec.md §7 row.
    pub fn code(&self) -> i64 {
        match self {
            AppError::Unauthenticated(_) => -32001,
            AppError::Forbidden(_) => -32002,
            AppError::RateLimited { .. } => -32003,
            AppError::InvalidArgument(_) => -32004,
            AppError::NotFound(_) => -32005,
            AppError::Conflict(_) => -32006,
            AppError::Misconfigured(_) => -32007,
            AppError::Unavailable(_) => -32008,
            AppError::DeadlineExceeded => -32009,
            AppError::Cancelled(_) => -32010,
            AppError::Internal { .. } => -32011,
        }
    }

    /// Short machine-readable kind name, used in audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthenticated(_) => "Unauthenticated",
            AppError::Forbidden(_) => "Forbidden",
            AppError::RateLimited { .. } => "RateLimited",
            AppError::InvalidArgument(_) => "InvalidArgument",
            AppError::NotFound(_) => "NotFound",
            AppError::Conflict(_) => "Conflict",
            AppError::Misconfigured(_) => "Misconfigured",
            AppError::Unavailable(_) => "Unavailable",
            AppError::DeadlineExceeded => "DeadlineExceeded",
            AppError::Cancelled(_) => "Cancelled",
            AppError::Internal { .. } => "Internal",
        }
    }

    /// Message safe to return to a client: internal details (paths,
    /// stack frames, secrets) never reach this string — callers that
    /// need to log detail should do so separately via `tracing`.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Internal { correlation_id } => {
                format!("internal error, correlation id {correlation_id}")
            }
            other => other.to_string(),
        }
    }
}

/// Error raised while parsing/validating process configuration.
/// Corresponds to exit code `2` in spec.md §6.4.
#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Error raised by the Store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("store unreachable: {0}")]
    Unreachable(String),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => AppError::NotFound(what),
            StoreError::Unreachable(msg) => AppError::Unavailable(msg),
            other => AppError::internal(other),
        }
    }
}
