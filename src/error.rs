//! Error types for the router core
//!
//! The taxonomy follows the failure classes of the path-build protocol:
//! - Rejections reported through status records (never surfaced as errors
//!   to remote peers)
//! - Timeouts resolved by the builder's backoff
//! - Decode failures, which are silently dropped on the wire
//! - Transport failures, mapped onto the closest status code
//! - Local selection/crypto failures that abort a build before any
//!   network activity

use thiserror::Error;

use crate::messages::status::StatusCode;

pub type Result<T> = std::result::Result<T, VeilError>;

/// Main error type for the router core
#[derive(Error, Debug, Clone)]
pub enum VeilError {
    // ===== Build Errors =====
    #[error("build rejected: {0}")]
    BuildRejected(StatusCode),

    #[error("build timed out")]
    BuildTimeout,

    #[error("hop selection exhausted: {0}")]
    SelectionExhausted(String),

    // ===== Wire Errors =====
    #[error("decode failure: {0}")]
    DecodeFailure(String),

    #[error("frame authentication failed")]
    FrameAuth,

    // ===== Transport Errors =====
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("no link session to {0}")]
    NoLink(String),

    // ===== Cryptographic Errors =====
    #[error("crypto: {0}")]
    Crypto(String),

    // ===== State Errors =====
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("path expired")]
    PathExpired,

    // ===== Internal Errors =====
    #[error("internal error: {0}")]
    Internal(String),
}

impl VeilError {
    /// Whether this error is fatal to the current build.
    ///
    /// Fatal build errors abort the build locally; they never crash the
    /// router process and never produce wire traffic on their own.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VeilError::Crypto(_) | VeilError::Internal(_) | VeilError::SelectionExhausted(_)
        )
    }

    /// Whether the failure is expected to clear up on a retry with
    /// different hops (handled one layer up, as a fresh build).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VeilError::BuildRejected(_)
                | VeilError::BuildTimeout
                | VeilError::Transport(_)
                | VeilError::NoLink(_)
        )
    }

    /// The status code a transit hop reports for this failure, if any.
    ///
    /// Decode failures deliberately have no status mapping: a forged or
    /// malformed frame is dropped without a reply.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            VeilError::BuildRejected(code) => Some(*code),
            VeilError::BuildTimeout => Some(StatusCode::Timeout),
            VeilError::Transport(_) => Some(StatusCode::CannotConnect),
            VeilError::NoLink(_) => Some(StatusCode::CannotConnect),
            _ => None,
        }
    }
}
