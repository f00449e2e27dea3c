//! Detection service protocol definitions.
//!
//! Defines the JSON structures exchanged with the frame-analysis and
//! violation-record endpoints.

use crate::types::{
    DetectionFlags, DetectionResult, IdentityVerification, SessionIds, ViolationEvent,
    ViolationKind,
};
use serde::{Deserialize, Serialize};

/// Body of `POST /hybrid_analyze`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeFrameRequest {
    /// Frame as a `data:image/jpeg;base64,...` URL.
    pub image: String,
    pub student_id: String,
    pub exam_id: String,
}

impl AnalyzeFrameRequest {
    pub fn new(image: String, ids: &SessionIds) -> Self {
        Self {
            image,
            student_id: ids.student_id.clone(),
            exam_id: ids.exam_id.clone(),
        }
    }
}

/// Identity-verification block of an analysis response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    #[serde(default)]
    pub person_tracked: bool,
    #[serde(default)]
    pub face_verification_triggered: bool,
    /// `null` until verification has been evaluated.
    #[serde(default)]
    pub identity_verified: Option<bool>,
    #[serde(default)]
    pub message: String,
}

/// Axis-aligned box in frame pixel coordinates: `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub bbox: [f64; 4],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl BoundingBox {
    pub fn width(&self) -> f64 {
        (self.bbox[2] - self.bbox[0]).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.bbox[3] - self.bbox[1]).max(0.0)
    }
}

/// Boxes for overlay rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionBoxes {
    #[serde(default)]
    pub persons: Vec<BoundingBox>,
    #[serde(default)]
    pub faces: Vec<BoundingBox>,
}

/// Response of `POST /hybrid_analyze`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzeFrameResponse {
    pub success: bool,
    #[serde(default)]
    pub violations: DetectionFlags,
    #[serde(default)]
    pub verification: VerificationReport,
    #[serde(default)]
    pub tracked_person_id: Option<String>,
    #[serde(default)]
    pub detection_boxes: Option<DetectionBoxes>,
}

impl AnalyzeFrameResponse {
    /// Collapse the wire shape into a [`DetectionResult`].
    pub fn to_result(&self) -> DetectionResult {
        DetectionResult {
            flags: self.violations,
            verification_triggered: self.verification.face_verification_triggered,
            identity: IdentityVerification::from(self.verification.identity_verified),
            person_tracked: self.verification.person_tracked,
            tracked_person_id: self.tracked_person_id.clone(),
            message: self.verification.message.clone(),
        }
    }
}

/// Body of `POST /report_violation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportViolationRequest {
    pub student_id: String,
    pub exam_id: String,
    pub violation_type: ViolationKind,
    #[serde(default)]
    pub details: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl ReportViolationRequest {
    pub fn from_event(ids: &SessionIds, event: &ViolationEvent) -> Self {
        Self {
            student_id: ids.student_id.clone(),
            exam_id: ids.exam_id.clone(),
            violation_type: event.kind,
            details: event.details.clone(),
            confidence: event.confidence,
        }
    }
}

/// Response of `GET /get_violations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetViolationsResponse {
    pub success: bool,
    #[serde(default)]
    pub violations: Vec<RecordedViolation>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A stored violation as returned by the service.
///
/// Kept separate from [`ViolationEvent`] because stored rows may carry
/// types this client does not know and timestamps without an offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedViolation {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    pub timestamp: String,
    #[serde(default)]
    pub details: String,
}

impl RecordedViolation {
    /// Convert into a typed event. Returns `None` for unknown types or
    /// unparseable timestamps.
    pub fn to_event(&self) -> Option<ViolationEvent> {
        let kind = self.kind.parse::<ViolationKind>().ok()?;
        let timestamp = parse_timestamp(&self.timestamp)?;
        Some(ViolationEvent::at(kind, self.details.clone(), timestamp).with_confidence(self.confidence))
    }
}

/// Parse an RFC 3339 timestamp, or a naive ISO 8601 one interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&chrono::Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
