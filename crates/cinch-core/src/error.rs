//! Error taxonomy for the Cinch control plane and executor.
//!
//! Mirrors the `spec.md` §7 taxonomy directly rather than growing an
//! ad hoc set of reasons: each variant corresponds to exactly one row
//! of that table.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("infra error during {phase}: {message}")]
    Infra { phase: String, message: String },

    #[error("command failed with exit code {0}")]
    CommandFailure(i32),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
