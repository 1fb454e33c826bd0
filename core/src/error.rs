//! The engine's single bubble-up error taxonomy. Every fallible operation
//! in `spdnn-core` returns `Result<T, EngineError>`; there is no retry or
//! partial-failure path — a detected invariant violation or communication
//! error is fatal. `thiserror` is used the way `strata-core` uses it for
//! its own closed domain-error enums; a matchable taxonomy with distinct
//! process exit codes needs a derived enum rather than bare `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("I/O failure reading {path}: {reason}")]
    IoFailure { path: String, reason: String },

    #[error("allocation failure: {0}")]
    AllocFailure(String),

    #[error("tiling failure: {0}")]
    TilingFailure(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("communication failure: {0}")]
    CommFailure(String),

    #[error("challenge failed: predicted categories disagree with ground truth")]
    ChallengeFailed,
}

impl EngineError {
    /// Process exit code for this error: 0 is reserved for success,
    /// `ChallengeFailed` gets its own distinct non-zero code separate from
    /// the other (fatal, pre-result) failure modes.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::ConfigInvalid(_) => 2,
            EngineError::IoFailure { .. } => 3,
            EngineError::AllocFailure(_) => 4,
            EngineError::TilingFailure(_) => 5,
            EngineError::DimensionMismatch(_) => 6,
            EngineError::InvariantViolation(_) => 7,
            EngineError::CommFailure(_) => 8,
            EngineError::ChallengeFailed => 9,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
