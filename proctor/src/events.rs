//! Session notice broadcast.
//!
//! Everything the exam UI must show (warnings, status changes, errors) is
//! published as a JSON line on the [`EventBus`]. The CLI prints the lines
//! to stdout.

use crate::clock::ClockDisplay;
use crate::session::{EndReason, Phase};
use chrono::Utc;
use proctor_common::{Capability, ViolationKind};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

/// Notice published to the exam UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SessionNotice {
    PhaseChanged {
        phase: Phase,
    },
    PageChanged {
        page: u32,
        total_pages: u32,
    },
    TimeWarning {
        minutes_left: u32,
    },
    ClockDisplay {
        display: ClockDisplay,
        remaining: String,
    },
    TabSwitchWarning {
        count: u32,
        max_reached: bool,
    },
    FullscreenWarning {
        count: u32,
    },
    WarningDismissed,
    ProxyViolationReported,
    IdentityStatus {
        verified: bool,
    },
    MonitoringStatus {
        tracked_person_id: Option<String>,
        active: Vec<ViolationKind>,
    },
    CameraUnavailable {
        message: String,
    },
    PermissionDenied {
        capability: Capability,
        message: String,
    },
    Submitted {
        answers: usize,
        tab_switches: u32,
        fullscreen_exits: u32,
    },
    Ended {
        reason: EndReason,
        submission_failed: bool,
    },
    Error {
        code: String,
        message: String,
    },
}

impl SessionNotice {
    /// Event name used in the JSON line.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PhaseChanged { .. } => "phase_changed",
            Self::PageChanged { .. } => "page_changed",
            Self::TimeWarning { .. } => "time_warning",
            Self::ClockDisplay { .. } => "clock_display",
            Self::TabSwitchWarning { .. } => "tab_switch_warning",
            Self::FullscreenWarning { .. } => "fullscreen_warning",
            Self::WarningDismissed => "warning_dismissed",
            Self::ProxyViolationReported => "proxy_violation_reported",
            Self::IdentityStatus { .. } => "identity_status",
            Self::MonitoringStatus { .. } => "monitoring_status",
            Self::CameraUnavailable { .. } => "camera_unavailable",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Submitted { .. } => "submitted",
            Self::Ended { .. } => "ended",
            Self::Error { .. } => "error",
        }
    }
}

/// Broadcast channel for session notices (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// Create a bus. The buffer is clamped to at least `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Publish a notice. Having no subscribers is not an error.
    pub fn emit(&self, notice: &SessionNotice) {
        let payload = json!({
            "event": notice.name(),
            "data": notice,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("Failed to serialize notice {}: {}", notice.name(), err),
        }
    }
}
