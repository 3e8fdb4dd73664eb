//! Error types for the kiln worker.
//!
//! All errors use `thiserror` for ergonomic error handling and proper
//! error chains. Every variant maps onto exactly one wire error kind via
//! [`KilnError::kind`], which is the single mapping table between the
//! internal taxonomy and what the build manager sees.

use thiserror::Error;

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Main error type for the kiln worker.
#[derive(Error, Debug)]
pub enum KilnError {
    // Source acquisition errors
    #[error("{reason}")]
    BuildPack { reason: String },

    #[error("{reason}")]
    GitClone { reason: String },

    #[error("{reason}")]
    GitCheckout { reason: String },

    // Dockerfile errors
    #[error("{reason}")]
    InvalidDockerfile { reason: String },

    // Runtime errors
    #[error("failed to pull base image: {reason}")]
    Pull { reason: String },

    #[error("failed to pull cache image: {reason}")]
    CannotPullForCache { reason: String },

    #[error("failed to tag image: {reason}")]
    Tag { reason: String },

    #[error("failed to push image: {reason}")]
    Push { reason: String },

    #[error("build failed: {reason}")]
    Build { reason: String },

    // Manager errors
    #[error("build manager rejected phase transition{}", reason_suffix(.reason))]
    PhaseRejected { reason: String },

    // Configuration errors
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn reason_suffix(reason: &str) -> String {
    if reason.is_empty() { String::new() } else { format!(": {reason}") }
}

impl KilnError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// The wire error kind reported to the build manager alongside the
    /// terminal `ERROR` phase.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BuildPack { .. } => "BuildPackError",
            Self::GitClone { .. } => "GitCloneError",
            Self::GitCheckout { .. } => "GitCheckoutError",
            Self::InvalidDockerfile { .. } => "InvalidDockerfileError",
            Self::Pull { .. } => "PullError",
            Self::CannotPullForCache { .. } => "CannotPullForCacheError",
            Self::Tag { .. } => "TagError",
            Self::Push { .. } => "PushError",
            Self::Build { .. } => "BuildError",
            Self::PhaseRejected { .. } => "PhaseRejected",
            Self::Config { .. } | Self::Internal(_) | Self::Other(_) => "InternalError",
        }
    }
}
