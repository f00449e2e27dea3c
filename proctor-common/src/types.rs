//! Common types used across proctor components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifiers of the monitored session, entered once before the exam.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIds {
    pub student_id: String,
    pub exam_id: String,
}

impl SessionIds {
    pub fn new(student_id: impl Into<String>, exam_id: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            exam_id: exam_id.into(),
        }
    }
}

impl fmt::Display for SessionIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.student_id, self.exam_id)
    }
}

/// Kind of integrity violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Page hidden or window focus lost and regained.
    TabSwitch,
    /// Fullscreen mode was left while the exam was running.
    FullscreenExit,
    MultipleFaces,
    LookingAway,
    HeadTurning,
    /// A phone or other device is visible in the frame.
    DeviceDetected,
    /// The tracked person left the camera view.
    PersonDisappeared,
    IdentityMismatch,
    MultiplePeople,
    /// Face verification against the reference images failed.
    ProxyDetected,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 10] = [
        ViolationKind::TabSwitch,
        ViolationKind::FullscreenExit,
        ViolationKind::MultipleFaces,
        ViolationKind::LookingAway,
        ViolationKind::HeadTurning,
        ViolationKind::DeviceDetected,
        ViolationKind::PersonDisappeared,
        ViolationKind::IdentityMismatch,
        ViolationKind::MultiplePeople,
        ViolationKind::ProxyDetected,
    ];

    /// Wire name used by the detection service.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TabSwitch => "tab_switch",
            Self::FullscreenExit => "fullscreen_exit",
            Self::MultipleFaces => "multiple_faces",
            Self::LookingAway => "looking_away",
            Self::HeadTurning => "head_turning",
            Self::DeviceDetected => "device_detected",
            Self::PersonDisappeared => "person_disappeared",
            Self::IdentityMismatch => "identity_mismatch",
            Self::MultiplePeople => "multiple_people",
            Self::ProxyDetected => "proxy_detected",
        }
    }

    /// Human-readable indicator text shown next to the camera preview.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::TabSwitch => "Tab Switch Detected",
            Self::FullscreenExit => "Fullscreen Exit Detected",
            Self::MultipleFaces => "Multiple Faces Detected",
            Self::LookingAway => "Looking Away Detected",
            Self::HeadTurning => "Head Rotation Detected",
            Self::DeviceDetected => "Device Detected",
            Self::PersonDisappeared => "Person Left Camera View",
            Self::IdentityMismatch => "Identity Mismatch Detected",
            Self::MultiplePeople => "Multiple People Detected",
            Self::ProxyDetected => "Security Violation Reported",
        }
    }

    /// Whether the authoritative count for this kind lives in a local counter
    /// rather than in the server-side event list.
    pub const fn is_locally_counted(&self) -> bool {
        matches!(self, Self::TabSwitch | Self::FullscreenExit)
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViolationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown violation type '{s}'"))
    }
}

/// A single detected rule infraction. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationEvent {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    pub timestamp: DateTime<Utc>,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub details: String,
}

impl ViolationEvent {
    /// Create an event stamped now with full confidence.
    pub fn new(kind: ViolationKind, details: impl Into<String>) -> Self {
        Self::at(kind, details, Utc::now())
    }

    pub fn at(kind: ViolationKind, details: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            timestamp,
            confidence: 1.0,
            details: details.into(),
        }
    }

    /// Replace the confidence, clamped into `[0, 1]`. Non-finite values become 0.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }
}

/// Per-frame boolean violation flags returned by the detection service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionFlags {
    #[serde(default)]
    pub multiple_faces: bool,
    #[serde(default)]
    pub looking_away: bool,
    #[serde(default)]
    pub head_turning: bool,
    #[serde(default)]
    pub device_detected: bool,
    #[serde(default)]
    pub person_disappeared: bool,
    #[serde(default)]
    pub identity_mismatch: bool,
    #[serde(default)]
    pub multiple_people: bool,
}

impl DetectionFlags {
    /// Violation kinds whose flag is set, in a stable order.
    pub fn active(&self) -> Vec<ViolationKind> {
        [
            (self.multiple_faces, ViolationKind::MultipleFaces),
            (self.head_turning, ViolationKind::HeadTurning),
            (self.looking_away, ViolationKind::LookingAway),
            (self.device_detected, ViolationKind::DeviceDetected),
            (self.person_disappeared, ViolationKind::PersonDisappeared),
            (self.identity_mismatch, ViolationKind::IdentityMismatch),
            (self.multiple_people, ViolationKind::MultiplePeople),
        ]
        .into_iter()
        .filter_map(|(set, kind)| set.then_some(kind))
        .collect()
    }

    pub fn any(&self) -> bool {
        !self.active().is_empty()
    }
}

/// Outcome of identity verification for one analyzed frame.
///
/// `Unknown` means verification has not been evaluated, which is distinct
/// from an evaluated failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityVerification {
    #[default]
    Unknown,
    Verified,
    Failed,
}

impl From<Option<bool>> for IdentityVerification {
    fn from(value: Option<bool>) -> Self {
        match value {
            None => Self::Unknown,
            Some(true) => Self::Verified,
            Some(false) => Self::Failed,
        }
    }
}

/// Snapshot of one analyzed frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionResult {
    pub flags: DetectionFlags,
    /// Whether face verification ran on this frame.
    pub verification_triggered: bool,
    pub identity: IdentityVerification,
    pub person_tracked: bool,
    /// Opaque identifier of the tracked person, if any.
    pub tracked_person_id: Option<String>,
    pub message: String,
}

/// Locally counted violations carried across the submission boundary.
///
/// `None` means the counter was never persisted, so the event list is the
/// only source for that kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationCounters {
    pub tab_switches: Option<u32>,
    pub fullscreen_exits: Option<u32>,
}

impl ViolationCounters {
    pub fn new(tab_switches: u32, fullscreen_exits: u32) -> Self {
        Self {
            tab_switches: Some(tab_switches),
            fullscreen_exits: Some(fullscreen_exits),
        }
    }

    /// Counter value for a locally counted kind.
    pub fn for_kind(&self, kind: ViolationKind) -> Option<u32> {
        match kind {
            ViolationKind::TabSwitch => self.tab_switches,
            ViolationKind::FullscreenExit => self.fullscreen_exits,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_kind_round_trips_through_wire_name() {
        for kind in ViolationKind::ALL {
            assert_eq!(kind.as_str().parse::<ViolationKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert!("teleport".parse::<ViolationKind>().is_err());
    }

    #[test]
    fn only_tab_and_fullscreen_are_locally_counted() {
        let local: Vec<_> = ViolationKind::ALL
            .into_iter()
            .filter(ViolationKind::is_locally_counted)
            .collect();
        assert_eq!(
            local,
            vec![ViolationKind::TabSwitch, ViolationKind::FullscreenExit]
        );
    }

    #[test]
    fn confidence_is_clamped() {
        let ev = ViolationEvent::new(ViolationKind::LookingAway, "x").with_confidence(1.7);
        assert_eq!(ev.confidence, 1.0);
        let ev = ev.with_confidence(-0.2);
        assert_eq!(ev.confidence, 0.0);
        let ev = ev.with_confidence(f64::NAN);
        assert_eq!(ev.confidence, 0.0);
    }

    #[test]
    fn event_serializes_kind_as_type() {
        let ev = ViolationEvent::new(ViolationKind::ProxyDetected, "mismatch");
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "proxy_detected");
        assert_eq!(value["details"], "mismatch");
    }

    #[test]
    fn active_flags_are_listed() {
        let flags = DetectionFlags {
            device_detected: true,
            multiple_people: true,
            ..Default::default()
        };
        assert_eq!(
            flags.active(),
            vec![ViolationKind::DeviceDetected, ViolationKind::MultiplePeople]
        );
        assert!(flags.any());
        assert!(!DetectionFlags::default().any());
    }

    #[test]
    fn identity_from_nullable_bool() {
        assert_eq!(IdentityVerification::from(None), IdentityVerification::Unknown);
        assert_eq!(
            IdentityVerification::from(Some(true)),
            IdentityVerification::Verified
        );
        assert_eq!(
            IdentityVerification::from(Some(false)),
            IdentityVerification::Failed
        );
    }

    #[test]
    fn counters_only_answer_for_local_kinds() {
        let counters = ViolationCounters::new(3, 1);
        assert_eq!(counters.for_kind(ViolationKind::TabSwitch), Some(3));
        assert_eq!(counters.for_kind(ViolationKind::FullscreenExit), Some(1));
        assert_eq!(counters.for_kind(ViolationKind::MultipleFaces), None);
    }
}
