//! Error types for the control plane

use thiserror::Error;

use crate::coverage::CoverageReport;

/// Errors surfaced by control-plane operations
#[derive(Debug, Clone, Error)]
pub enum KeeperError {
    /// Malformed or out-of-range input
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown product, term, subscription or task
    #[error("not found: {0}")]
    NotFound(String),

    /// Reserve cannot cover a new guaranteed subscription
    #[error(
        "reserve coverage ratio {} below required {required_ratio}",
        .coverage.coverage_ratio
    )]
    ReserveCoverage {
        coverage: CoverageReport,
        required_ratio: f64,
    },

    /// Request conflicts with current state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Snapshot persistence failed
    #[error("storage error: {0}")]
    Storage(String),
}

impl KeeperError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, KeeperError>;

/// Failure of a single liquidation attempt
///
/// `Transient` failures are retried with backoff; `Terminal` failures block
/// the task until an operator intervenes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("{code}: {message}")]
    Transient { code: String, message: String },

    #[error("{code}: {message}")]
    Terminal { code: String, message: String },
}

impl ExecutionError {
    pub fn transient(code: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn terminal(code: &str, message: impl Into<String>) -> Self {
        Self::Terminal {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Transient { code, .. } | Self::Terminal { code, .. } => code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message, .. } | Self::Terminal { message, .. } => message,
        }
    }
}

/// Price lookup failure
#[derive(Debug, Clone, Error)]
pub enum PriceError {
    #[error("no price for token {0}")]
    Unavailable(String),

    #[error("price lookup timed out after {0}ms")]
    Timeout(u64),

    #[error("price source request failed: {0}")]
    Http(String),
}
