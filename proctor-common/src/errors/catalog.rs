//! Error catalog for the proctor.
//!
//! Every user-visible failure carries a stable `PRC-Exxx` code with a
//! message template and remediation steps.
//!
//! Codes are grouped by hundreds:
//!
//! - `E0xx` config file and `PROCTOR_*` overrides
//! - `E1xx` camera and fullscreen permissions
//! - `E2xx` detection service and transport
//! - `E3xx` session identifiers, phases and storage
//! - `E5xx` bugs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // Config (E001-E099)
    /// Config file exists but is unreadable
    ConfigReadError,
    /// Config file is not valid TOML
    ConfigParseError,
    /// A `PROCTOR_*` override failed to parse
    ConfigEnvError,

    // Permission (E100-E199)
    /// Camera access was denied
    CameraPermissionDenied,
    /// No frames could be captured from the camera
    CameraUnavailable,
    /// Fullscreen mode could not be entered
    FullscreenDenied,

    // Service (E200-E299)
    /// Detection service could not be reached
    ServiceUnreachable,
    /// Detection service returned an unexpected payload
    ServiceProtocolError,
    /// Detection service reported a failure
    ServiceRejected,

    // Session (E300-E399)
    /// Student or exam identifier missing
    SessionIdsMissing,
    /// Operation is not valid in the current exam phase
    SessionInvalidPhase,
    /// Session storage could not be read or written
    SessionStorageError,

    // Internal (E500-E599)
    /// Internal error
    InternalError,
}

impl ErrorCode {
    /// All error codes, in catalog order.
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigEnvError,
            Self::CameraPermissionDenied,
            Self::CameraUnavailable,
            Self::FullscreenDenied,
            Self::ServiceUnreachable,
            Self::ServiceProtocolError,
            Self::ServiceRejected,
            Self::SessionIdsMissing,
            Self::SessionInvalidPhase,
            Self::SessionStorageError,
            Self::InternalError,
        ]
    }

    /// Numeric part of the code.
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigReadError => 1,
            Self::ConfigParseError => 2,
            Self::ConfigEnvError => 3,
            Self::CameraPermissionDenied => 100,
            Self::CameraUnavailable => 101,
            Self::FullscreenDenied => 102,
            Self::ServiceUnreachable => 200,
            Self::ServiceProtocolError => 201,
            Self::ServiceRejected => 202,
            Self::SessionIdsMissing => 300,
            Self::SessionInvalidPhase => 301,
            Self::SessionStorageError => 302,
            Self::InternalError => 500,
        }
    }

    /// Code string, e.g. `PRC-E300`.
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("PRC-E{:03}", self.code_number())
    }

    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Permission,
            200..=299 => ErrorCategory::Service,
            300..=399 => ErrorCategory::Session,
            _ => ErrorCategory::Internal,
        }
    }

    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigReadError => "Could not read the proctor config file",
            Self::ConfigParseError => "Proctor config file is not valid TOML",
            Self::ConfigEnvError => "A PROCTOR_* override could not be parsed",
            Self::CameraPermissionDenied => {
                "Unable to access webcam. Please ensure you have granted camera permissions."
            }
            Self::CameraUnavailable => "No camera frames are available",
            Self::FullscreenDenied => "Fullscreen mode could not be entered",
            Self::ServiceUnreachable => "Detection service could not be reached",
            Self::ServiceProtocolError => "Detection service returned an unexpected response",
            Self::ServiceRejected => "Detection service reported a failure",
            Self::SessionIdsMissing => "Student ID or Exam ID not found",
            Self::SessionInvalidPhase => "Operation is not allowed in the current exam phase",
            Self::SessionStorageError => "Session storage could not be accessed",
            Self::InternalError => "Internal error",
        }
    }

    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigReadError => &[
                "Check that the file passed with --config exists and is readable",
                "Run `proctor config` to see which file is being loaded",
            ],
            Self::ConfigParseError => &["Fix the TOML syntax error reported above"],
            Self::ConfigEnvError => &["Unset or correct the PROCTOR_* variable named above"],
            Self::CameraPermissionDenied => &[
                "Grant camera access to the exam application",
                "Close other applications that hold the camera",
            ],
            Self::CameraUnavailable => &[
                "Check the configured frame directory contains .jpg files",
                "Reconnect the camera and restart the exam",
            ],
            Self::FullscreenDenied => &["Allow fullscreen for the exam window"],
            Self::ServiceUnreachable => &[
                "Check that the detection service is running",
                "Verify PROCTOR_SERVICE_URL points at it",
            ],
            Self::ServiceProtocolError => &["Check the detection service version"],
            Self::ServiceRejected => &["See the service error message above"],
            Self::SessionIdsMissing => &[
                "Enter the student and exam identifiers before starting",
                "Pass --student-id and --exam-id",
            ],
            Self::SessionInvalidPhase => &[],
            Self::SessionStorageError => &[
                "Check permissions on the session state file",
                "Set PROCTOR_STATE_FILE to a writable location",
            ],
            Self::InternalError => &["Re-run with --verbose and report the log"],
        }
    }

    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Coarse grouping used for log fields and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Config,
    Permission,
    Service,
    Session,
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Permission => "Permission",
            Self::Service => "Service",
            Self::Session => "Session",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Everything known about a code, ready for display or JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "PRC-E300")
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Multi-line form with numbered remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);
        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }
        output
    }

    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}
