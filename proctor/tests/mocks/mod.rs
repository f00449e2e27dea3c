//! Test doubles for the detection service and the camera.

#![allow(dead_code)]

use proctor::capture::{Frame, FrameSource};
use proctor::service::DetectionService;
use proctor_common::{
    AnalyzeFrameRequest, AnalyzeFrameResponse, Capability, ProctorError, RecordedViolation,
    ReportViolationRequest, SessionIds, VerificationReport, ViolationKind,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Analysis response with a triggered verification.
pub fn verification(identity: Option<bool>) -> AnalyzeFrameResponse {
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

/// In-memory detection service.
///
/// Scripted analysis responses are served in order; once exhausted every
/// frame gets a plain successful response.
#[derive(Default)]
pub struct FakeService {
    latency: Duration,
    always_fail: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    responses: Mutex<VecDeque<Result<AnalyzeFrameResponse, ProctorError>>>,
    requests: Mutex<Vec<AnalyzeFrameRequest>>,
    reports: Mutex<Vec<ReportViolationRequest>>,
    records: Mutex<Vec<RecordedViolation>>,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every analysis by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Refuse every analysis immediately, like a service that is down.
    pub fn unreachable(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn with_responses(
        self,
        responses: impl IntoIterator<Item = Result<AnalyzeFrameResponse, ProctorError>>,
    ) -> Self {
        self.responses
            .lock()
            .unwrap()
            .extend(responses);
        self
    }

    pub fn with_records(self, records: Vec<RecordedViolation>) -> Self {
        *self.records.lock().unwrap() = records;
        self
    }

    pub fn analyzed(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Most analysis requests ever outstanding at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<AnalyzeFrameRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn reports(&self) -> Vec<ReportViolationRequest> {
        self.reports.lock().unwrap().clone()
    }

    pub fn reported(&self, kind: ViolationKind) -> usize {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.violation_type == kind)
            .count()
    }
}

impl DetectionService for FakeService {
    async fn analyze_frame(
        &self,
        request: AnalyzeFrameRequest,
    ) -> Result<AnalyzeFrameResponse, ProctorError> {
        if self.always_fail {
            return Err(ProctorError::Transport("connection refused".into()));
        }
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _done = InFlight(&self.in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.requests.lock().unwrap().push(request);
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(AnalyzeFrameResponse {
                success: true,
                ..Default::default()
            })
        })
    }

    async fn report_violation(&self, request: ReportViolationRequest) -> Result<(), ProctorError> {
        self.reports.lock().unwrap().push(request);
        Ok(())
    }

    async fn fetch_violations(
        &self,
        _ids: &SessionIds,
    ) -> Result<Vec<RecordedViolation>, ProctorError> {
        Ok(self.records.lock().unwrap().clone())
    }
}

/// Decrements the in-flight count even when the request is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Camera double. Counts stop calls through a shared counter so tests can
/// observe the release after the source moved into the loop.
pub struct ScriptedFrames {
    deny: bool,
    failures: usize,
    open: bool,
    stops: Arc<AtomicUsize>,
}

impl ScriptedFrames {
    pub fn new() -> Self {
        Self {
            deny: false,
            failures: 0,
            open: false,
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::new()
        }
    }

    /// Fail the first `n` captures.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.failures = n;
        self
    }

    pub fn stop_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.stops)
    }
}

impl FrameSource for ScriptedFrames {
    fn open(&mut self) -> Result<(), ProctorError> {
        if self.deny {
            return Err(ProctorError::permission(Capability::Camera, "NotAllowedError"));
        }
        self.open = true;
        Ok(())
    }

    async fn capture(&mut self) -> Result<Frame, ProctorError> {
        if !self.open {
            return Err(ProctorError::Capture("not open".into()));
        }
        if self.failures > 0 {
            self.failures -= 1;
            return Err(ProctorError::Capture("video not ready".into()));
        }
        Ok(Frame::new(vec![0xff, 0xd8, 0xff, 0xe0]))
    }

    fn stop(&mut self) {
        if self.open {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
