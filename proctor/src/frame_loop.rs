//! Remote frame analysis loop.
//!
//! Each cycle captures one frame, submits it to the detection service and
//! folds the response into the latest analysis state. Cycles run
//! back-to-back with no request in flight concurrently; a failed capture
//! waits briefly before the next attempt. Failed requests are logged and
//! superseded by the next cycle.
//!
//! Proxy (identity mismatch) violations go through a single-report latch:
//! one report per failure episode, re-armed by a successful verification.

use crate::capture::FrameSource;
use crate::service::DetectionService;
use proctor_common::{
    AnalyzeFrameRequest, AnalyzeFrameResponse, DetectionBoxes, DetectionFlags, DetectionResult,
    IdentityVerification, ProctorError, SessionIds, ViolationEvent, ViolationKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const PROXY_DETAILS: &str = "Identity mismatch detected during hybrid verification";

// ── Proxy latch ──────────────────────────────────────────────────────────

/// What the latch did with one analysis result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchDecision {
    /// First failure of an episode; report it.
    Report,
    /// Failure while already reported.
    Suppressed,
    /// Verification succeeded; the latch is re-armed.
    Cleared,
    /// Verification did not run or was not evaluated.
    Unchanged,
}

/// Single-report latch for proxy violations.
#[derive(Debug, Default, Clone)]
pub struct ProxyLatch {
    reported: bool,
}

impl ProxyLatch {
    pub fn observe(&mut self, result: &DetectionResult) -> LatchDecision {
        if !result.verification_triggered {
            return LatchDecision::Unchanged;
        }
        match result.identity {
            IdentityVerification::Failed if self.reported => LatchDecision::Suppressed,
            IdentityVerification::Failed => {
                self.reported = true;
                LatchDecision::Report
            }
            IdentityVerification::Verified => {
                self.reported = false;
                LatchDecision::Cleared
            }
            IdentityVerification::Unknown => LatchDecision::Unchanged,
        }
    }

    pub fn is_reported(&self) -> bool {
        self.reported
    }
}

// ── Analysis state ───────────────────────────────────────────────────────

/// Update published by the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameLoopEvent {
    /// Violation flags or the tracked person changed.
    Monitoring {
        flags: DetectionFlags,
        tracked_person_id: Option<String>,
    },
    /// First failed verification of an episode.
    ProxyDetected(ViolationEvent),
    IdentityVerified,
}

/// Counters for one loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub analyzed: u64,
    pub capture_failures: u64,
    pub service_failures: u64,
    pub proxy_reports: u64,
}

/// Result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Analyzed,
    CaptureFailed,
    ServiceFailed,
}

/// Latest analysis state. Each response replaces the previous one.
#[derive(Debug, Default, Clone)]
pub struct FrameAnalysis {
    flags: DetectionFlags,
    tracked_person_id: Option<String>,
    identity: IdentityVerification,
    boxes: DetectionBoxes,
    message: String,
    latch: ProxyLatch,
    stats: LoopStats,
}

impl FrameAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one successful response into the state.
    pub fn apply(&mut self, response: &AnalyzeFrameResponse) -> Vec<FrameLoopEvent> {
        let result = response.to_result();
        let mut events = Vec::new();
        self.stats.analyzed += 1;

        match self.latch.observe(&result) {
            LatchDecision::Report => {
                self.stats.proxy_reports += 1;
                warn!(message = %result.message, "Identity verification failed; reporting proxy");
                events.push(FrameLoopEvent::ProxyDetected(ViolationEvent::new(
                    ViolationKind::ProxyDetected,
                    PROXY_DETAILS,
                )));
            }
            LatchDecision::Suppressed => {
                debug!("Identity still unverified; proxy already reported");
            }
            LatchDecision::Cleared => events.push(FrameLoopEvent::IdentityVerified),
            LatchDecision::Unchanged => {}
        }

        if result.verification_triggered && result.identity != IdentityVerification::Unknown {
            self.identity = result.identity;
        }

        let changed = result.flags != self.flags || result.tracked_person_id != self.tracked_person_id;
        self.flags = result.flags;
        self.tracked_person_id = result.tracked_person_id.clone();
        self.boxes = response.detection_boxes.clone().unwrap_or_default();
        self.message = result.message;

        if changed {
            let active = self.flags.active();
            if !active.is_empty() {
                debug!(?active, "Frame violations active");
            }
            events.push(FrameLoopEvent::Monitoring {
                flags: self.flags,
                tracked_person_id: self.tracked_person_id.clone(),
            });
        }
        events
    }

    pub fn flags(&self) -> DetectionFlags {
        self.flags
    }

    pub fn tracked_person_id(&self) -> Option<&str> {
        self.tracked_person_id.as_deref()
    }

    /// Last evaluated verification outcome.
    pub fn identity(&self) -> IdentityVerification {
        self.identity
    }

    pub fn boxes(&self) -> &DetectionBoxes {
        &self.boxes
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn latch(&self) -> &ProxyLatch {
        &self.latch
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }
}

// ── Loop ─────────────────────────────────────────────────────────────────

/// Capture-analyze loop for one session.
pub struct RemoteFrameAnalysisLoop<S, F> {
    ids: SessionIds,
    service: Arc<S>,
    source: F,
    analysis: FrameAnalysis,
    events: mpsc::UnboundedSender<FrameLoopEvent>,
    capture_retry: Duration,
}

impl<S: DetectionService, F: FrameSource> RemoteFrameAnalysisLoop<S, F> {
    pub fn new(
        ids: SessionIds,
        service: Arc<S>,
        source: F,
        capture_retry: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<FrameLoopEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                ids,
                service,
                source,
                analysis: FrameAnalysis::new(),
                events,
                capture_retry,
            },
            rx,
        )
    }

    pub fn analysis(&self) -> &FrameAnalysis {
        &self.analysis
    }

    pub fn source(&self) -> &F {
        &self.source
    }

    /// Capture, submit and apply one frame.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.analysis.stats.cycles += 1;

        let frame = match self.source.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                self.analysis.stats.capture_failures += 1;
                debug!("Frame capture failed: {e}");
                return CycleOutcome::CaptureFailed;
            }
        };

        let request = AnalyzeFrameRequest::new(frame.to_data_url(), &self.ids);
        let response = match self.service.analyze_frame(request).await {
            Ok(response) => response,
            Err(e) => {
                self.analysis.stats.service_failures += 1;
                warn!("Frame analysis failed: {e}");
                return CycleOutcome::ServiceFailed;
            }
        };

        for event in self.analysis.apply(&response) {
            let _ = self.events.send(event);
        }
        CycleOutcome::Analyzed
    }

    /// Open the frame source and spawn the loop.
    ///
    /// A denied source is returned as an error and the loop never starts.
    pub fn start(mut self) -> Result<FrameLoopHandle, ProctorError> {
        self.source.open()?;
        let (stop_tx, stop_rx) = oneshot::channel();
        info!(session = %self.ids, "Frame analysis loop started");
        let task = tokio::spawn(self.run(stop_rx));
        Ok(FrameLoopHandle {
            stop: Some(stop_tx),
            task: Some(task),
        })
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) -> LoopStats {
        loop {
            let outcome = tokio::select! {
                biased;
                _ = &mut stop => break,
                outcome = self.run_cycle() => outcome,
            };

            // A failed cycle has no round trip to pace it.
            if outcome != CycleOutcome::Analyzed {
                tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    _ = tokio::time::sleep(self.capture_retry) => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        }

        self.source.stop();
        let stats = self.analysis.stats();
        info!(
            cycles = stats.cycles,
            analyzed = stats.analyzed,
            capture_failures = stats.capture_failures,
            service_failures = stats.service_failures,
            proxy_reports = stats.proxy_reports,
            "Frame analysis loop stopped"
        );
        stats
    }
}

/// Handle to a running loop. Dropping it aborts the loop.
pub struct FrameLoopHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<LoopStats>>,
}

impl FrameLoopHandle {
    /// Stop the loop and release the frame source. A response still in
    /// flight is discarded.
    pub async fn stop(mut self) -> LoopStats {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!("Frame analysis task failed: {e}");
                LoopStats::default()
            }),
            None => LoopStats::default(),
        }
    }
}

impl Drop for FrameLoopHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctor_common::VerificationReport;

    fn verification(identity: Option<bool>) -> AnalyzeFrameResponse {
        AnalyzeFrameResponse {
            success: true,
            verification: VerificationReport {
                person_tracked: true,
                face_verification_triggered: true,
                identity_verified: identity,
                message: String::new(),
            },
            tracked_person_id: Some("person_1".into()),
            ..Default::default()
        }
    }

    fn proxy_reports(events: &[FrameLoopEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, FrameLoopEvent::ProxyDetected(_)))
            .count()
    }

    #[test]
    fn latch_reports_once_per_failure_episode() {
        let mut analysis = FrameAnalysis::new();
        let mut total = 0;
        for identity in [Some(false), Some(false), Some(true), Some(false)] {
            total += proxy_reports(&analysis.apply(&verification(identity)));
        }
        assert_eq!(total, 2);
        assert_eq!(analysis.stats().proxy_reports, 2);
        assert!(analysis.latch().is_reported());
    }

    #[test]
    fn untriggered_or_unknown_verification_leaves_latch_alone() {
        let mut latch = ProxyLatch::default();
        let mut result = DetectionResult {
            verification_triggered: true,
            identity: IdentityVerification::Failed,
            ..Default::default()
        };
        assert_eq!(latch.observe(&result), LatchDecision::Report);

        result.verification_triggered = false;
        result.identity = IdentityVerification::Verified;
        assert_eq!(latch.observe(&result), LatchDecision::Unchanged);
        assert!(latch.is_reported());

        result.verification_triggered = true;
        result.identity = IdentityVerification::Unknown;
        assert_eq!(latch.observe(&result), LatchDecision::Unchanged);
        assert!(latch.is_reported());

        result.identity = IdentityVerification::Failed;
        assert_eq!(latch.observe(&result), LatchDecision::Suppressed);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut latch = ProxyLatch::default();
        let verified = DetectionResult {
            verification_triggered: true,
            identity: IdentityVerification::Verified,
            ..Default::default()
        };
        assert_eq!(latch.observe(&verified), LatchDecision::Cleared);
        assert_eq!(latch.observe(&verified), LatchDecision::Cleared);
        assert!(!latch.is_reported());
    }

    #[test]
    fn monitoring_update_only_on_change() {
        let mut analysis = FrameAnalysis::new();
        let mut response = AnalyzeFrameResponse {
            success: true,
            tracked_person_id: Some("person_1".into()),
            ..Default::default()
        };
        let events = analysis.apply(&response);
        assert!(matches!(events.as_slice(), [FrameLoopEvent::Monitoring { .. }]));
        assert!(analysis.apply(&response).is_empty());

        response.violations.looking_away = true;
        let events = analysis.apply(&response);
        assert_eq!(
            events,
            vec![FrameLoopEvent::Monitoring {
                flags: DetectionFlags {
                    looking_away: true,
                    ..Default::default()
                },
                tracked_person_id: Some("person_1".into()),
            }]
        );
        assert_eq!(analysis.tracked_person_id(), Some("person_1"));
        assert_eq!(analysis.stats().analyzed, 3);
    }

    #[test]
    fn later_response_replaces_boxes() {
        let mut analysis = FrameAnalysis::new();
        let mut response = AnalyzeFrameResponse {
            success: true,
            detection_boxes: Some(DetectionBoxes {
                persons: vec![proctor_common::BoundingBox {
                    bbox: [0.0, 0.0, 10.0, 10.0],
                    confidence: Some(0.9),
                }],
                faces: vec![],
            }),
            ..Default::default()
        };
        analysis.apply(&response);
        assert_eq!(analysis.boxes().persons.len(), 1);
        response.detection_boxes = None;
        analysis.apply(&response);
        assert!(analysis.boxes().persons.is_empty());
    }
}
