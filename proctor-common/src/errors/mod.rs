//! Error definitions for the proctor.
//!
//! [`ProctorError`] follows the failure taxonomy of the monitoring engine:
//! permission errors are shown to the user and not retried, transient
//! service errors are logged and superseded by the next cycle, and
//! precondition errors fail only the dependent operation.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                          |
//! |------------|-------------|--------------------------------------|
//! | E001-E099  | Config      | Configuration and setup errors       |
//! | E100-E199  | Permission  | Camera and fullscreen access         |
//! | E200-E299  | Service     | Detection service and network        |
//! | E300-E399  | Session     | Session identifiers and state        |
//! | E500-E599  | Internal    | Internal/unexpected errors           |

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

use crate::config::ConfigError;

/// Errors raised by proctor components and their collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ProctorError {
    #[error("{capability} permission denied: {reason}")]
    Permission {
        capability: Capability,
        reason: String,
    },

    #[error("Camera capture failed: {0}")]
    Capture(String),

    #[error("Detection service request failed: {0}")]
    Transport(String),

    #[error("Detection service returned an invalid response: {0}")]
    Protocol(String),

    #[error("Detection service reported failure: {0}")]
    Rejected(String),

    #[error("Student ID or Exam ID not found")]
    MissingSessionIds,

    #[error("Session storage error: {0}")]
    Storage(String),

    #[error("Platform signal unavailable: {0}")]
    Platform(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Platform capability guarded by a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Camera,
    Fullscreen,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Camera => write!(f, "camera"),
            Self::Fullscreen => write!(f, "fullscreen"),
        }
    }
}

impl ProctorError {
    pub fn permission(capability: Capability, reason: impl Into<String>) -> Self {
        Self::Permission {
            capability,
            reason: reason.into(),
        }
    }

    /// Transient failures are logged and superseded by the next natural
    /// cycle; they are never retried or shown to the user.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Capture(_) | Self::Transport(_) | Self::Protocol(_) | Self::Rejected(_)
        )
    }

    /// Whether the failure must be surfaced to the user.
    pub fn is_user_visible(&self) -> bool {
        !self.is_transient()
    }

    /// Catalog code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Permission {
                capability: Capability::Camera,
                ..
            } => ErrorCode::CameraPermissionDenied,
            Self::Permission {
                capability: Capability::Fullscreen,
                ..
            } => ErrorCode::FullscreenDenied,
            Self::Capture(_) => ErrorCode::CameraUnavailable,
            Self::Transport(_) => ErrorCode::ServiceUnreachable,
            Self::Protocol(_) => ErrorCode::ServiceProtocolError,
            Self::Rejected(_) => ErrorCode::ServiceRejected,
            Self::MissingSessionIds => ErrorCode::SessionIdsMissing,
            Self::Storage(_) => ErrorCode::SessionStorageError,
            Self::Platform(_) => ErrorCode::InternalError,
            Self::Config(ConfigError::Read { .. }) => ErrorCode::ConfigReadError,
            Self::Config(ConfigError::Parse { .. }) => ErrorCode::ConfigParseError,
            Self::Config(ConfigError::Env(_)) => ErrorCode::ConfigEnvError,
        }
    }
}
