//! Exam session state machine.
//!
//! ```text
//! RULES --accept_rules--> RUNNING --submit / time up / tab limit--> SUBMITTING --> ENDED
//!   |                        |
//!   +------ manual_end ------+------------------------------------------------> ENDED
//! ```
//!
//! The controller owns the countdown clock and the integrity detector while
//! the exam runs. Every transition out of RUNNING releases both, so no
//! timer or listener outlives the phase that created it. Leaving RUNNING is
//! guarded by a phase check, which makes submission single-shot no matter
//! how many triggers race for it.

use crate::clock::{ClockDisplay, ClockEvent, CountdownClock};
use crate::detector::{DetectorEvent, DetectorPolicy, IntegrityEventDetector, Platform, PlatformSignal};
use crate::events::{EventBus, SessionNotice};
use proctor_common::config::ExamConfig;
use proctor_common::{Capability, ErrorCode, ProctorError, SessionStore, ViolationEvent};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Exam phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Rules,
    Running,
    Submitting,
    Ended,
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Submitted,
    TimeUp,
    MaxTabSwitches,
    Abandoned,
}

/// What started a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitTrigger {
    User,
    TimeUp,
    MaxTabSwitches,
}

impl SubmitTrigger {
    pub fn end_reason(self) -> EndReason {
        match self {
            Self::User => EndReason::Submitted,
            Self::TimeUp => EndReason::TimeUp,
            Self::MaxTabSwitches => EndReason::MaxTabSwitches,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("{operation} is not allowed in phase {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::SessionInvalidPhase
    }
}

/// Per-session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub duration_minutes: u32,
    pub total_pages: u32,
    pub detector: DetectorPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_minutes: 60,
            total_pages: 4,
            detector: DetectorPolicy::default(),
        }
    }
}

impl From<&ExamConfig> for SessionConfig {
    fn from(exam: &ExamConfig) -> Self {
        Self {
            duration_minutes: exam.duration_minutes,
            total_pages: exam.total_pages,
            detector: DetectorPolicy::from(exam),
        }
    }
}

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub phase: Phase,
    pub elapsed_secs: u64,
    pub tab_switch_count: u32,
    pub fullscreen_exit_count: u32,
    pub answers: BTreeMap<String, String>,
    /// 0 while on the rules page, then 1-based question page.
    pub current_page: u32,
}

/// Snapshot handed to the submission side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub trigger: SubmitTrigger,
    pub answers: BTreeMap<String, String>,
    pub tab_switch_count: u32,
    pub fullscreen_exit_count: u32,
    pub elapsed_secs: u64,
}

/// Destination of a submission.
pub trait SubmissionSink: Send + Sync {
    /// Called once the rules are accepted, before anything is counted.
    fn begin(&self) -> impl Future<Output = Result<(), ProctorError>> + Send {
        async { Ok(()) }
    }

    fn persist(
        &self,
        submission: &Submission,
    ) -> impl Future<Output = Result<(), ProctorError>> + Send;
}

/// Persists answers and local counters into the session store, where the
/// report reads them back.
pub struct StoreSink<S: ?Sized> {
    store: Arc<S>,
}

impl<S: SessionStore + ?Sized> StoreSink<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: SessionStore + ?Sized> SubmissionSink for StoreSink<S> {
    /// A new session never inherits the counters of an earlier one.
    async fn begin(&self) -> Result<(), ProctorError> {
        self.store.clear_session()?;
        debug!("Cleared stored answers and counters");
        Ok(())
    }

    async fn persist(&self, submission: &Submission) -> Result<(), ProctorError> {
        self.store.save_answers(&submission.answers)?;
        self.store
            .save_counters(submission.tab_switch_count, submission.fullscreen_exit_count)?;
        info!(
            answers = submission.answers.len(),
            tab_switches = submission.tab_switch_count,
            fullscreen_exits = submission.fullscreen_exit_count,
            "Submission persisted"
        );
        Ok(())
    }
}

/// Drives one exam session.
pub struct SessionController<P: Platform> {
    config: SessionConfig,
    state: SessionState,
    platform: Option<P>,
    clock: Option<CountdownClock>,
    detector: Option<IntegrityEventDetector<P>>,
    notices: EventBus,
    display: ClockDisplay,
    trigger: Option<SubmitTrigger>,
    end_reason: Option<EndReason>,
    submission_failed: bool,
}

impl<P: Platform> SessionController<P> {
    pub fn new(config: SessionConfig, platform: P, notices: EventBus) -> Self {
        Self {
            config,
            state: SessionState {
                phase: Phase::Rules,
                elapsed_secs: 0,
                tab_switch_count: 0,
                fullscreen_exit_count: 0,
                answers: BTreeMap::new(),
                current_page: 0,
            },
            platform: Some(platform),
            clock: None,
            detector: None,
            notices,
            display: ClockDisplay::Normal,
            trigger: None,
            end_reason: None,
            submission_failed: false,
        }
    }

    fn require(&self, phase: Phase, operation: &'static str) -> Result<(), SessionError> {
        if self.state.phase == phase {
            Ok(())
        } else {
            Err(SessionError::InvalidPhase {
                operation,
                phase: self.state.phase,
            })
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!(from = ?self.state.phase, to = ?phase, "Session phase change");
        self.state.phase = phase;
        self.notices.emit(&SessionNotice::PhaseChanged { phase });
    }

    // ── RULES ────────────────────────────────────────────────────────────

    /// Start the exam: enter fullscreen, start the clock and attach the
    /// detector. A refused fullscreen request is surfaced but not fatal.
    pub fn accept_rules(&mut self, now: Instant) -> Result<(), SessionError> {
        self.require(Phase::Rules, "accept_rules")?;
        let mut platform = self.platform.take().ok_or(SessionError::InvalidPhase {
            operation: "accept_rules",
            phase: self.state.phase,
        })?;

        if let Err(e) = platform.request_fullscreen() {
            warn!("Fullscreen request failed: {e}");
            self.notices.emit(&SessionNotice::PermissionDenied {
                capability: Capability::Fullscreen,
                message: e.to_string(),
            });
        }

        let clock = CountdownClock::new(self.config.duration_minutes);
        self.display = clock.display();
        self.notices.emit(&SessionNotice::ClockDisplay {
            display: self.display,
            remaining: clock.format_remaining(),
        });
        self.clock = Some(clock);
        self.detector = Some(IntegrityEventDetector::attach(
            platform,
            self.config.detector,
            now,
        ));
        self.state.current_page = 1;

        info!(
            duration_minutes = self.config.duration_minutes,
            pages = self.config.total_pages,
            "Exam started"
        );
        self.set_phase(Phase::Running);
        self.notices.emit(&SessionNotice::PageChanged {
            page: 1,
            total_pages: self.config.total_pages,
        });
        Ok(())
    }

    // ── RUNNING ──────────────────────────────────────────────────────────

    pub fn record_answer(
        &mut self,
        question_id: impl Into<String>,
        answer: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.require(Phase::Running, "record_answer")?;
        self.state.answers.insert(question_id.into(), answer.into());
        Ok(())
    }

    /// Move to the next question page. Stays put on the last page.
    pub fn next_page(&mut self) -> Result<u32, SessionError> {
        self.require(Phase::Running, "next_page")?;
        if self.state.current_page < self.config.total_pages {
            self.state.current_page += 1;
            self.page_changed();
        }
        Ok(self.state.current_page)
    }

    /// Move to the previous question page. Never returns to the rules.
    pub fn prev_page(&mut self) -> Result<u32, SessionError> {
        self.require(Phase::Running, "prev_page")?;
        if self.state.current_page > 1 {
            self.state.current_page -= 1;
            self.page_changed();
        }
        Ok(self.state.current_page)
    }

    fn page_changed(&self) {
        self.notices.emit(&SessionNotice::PageChanged {
            page: self.state.current_page,
            total_pages: self.config.total_pages,
        });
    }

    /// Feed a platform signal. Returns the violation to report, if any.
    /// Signals outside RUNNING are ignored.
    pub fn handle_signal(&mut self, signal: &PlatformSignal, now: Instant) -> Option<ViolationEvent> {
        if self.state.phase != Phase::Running {
            debug!(?signal, phase = ?self.state.phase, "Ignoring signal outside running exam");
            return None;
        }
        let detector = self.detector.as_mut()?;
        let max = detector.policy().max_tab_switches;

        match detector.handle(signal, now)? {
            DetectorEvent::TabSwitch {
                count, violation, ..
            } => {
                self.state.tab_switch_count = count;
                self.notices.emit(&SessionNotice::TabSwitchWarning {
                    count,
                    max_reached: count >= max,
                });
                Some(violation)
            }
            DetectorEvent::FullscreenExit { count, violation } => {
                self.state.fullscreen_exit_count = count;
                self.notices.emit(&SessionNotice::FullscreenWarning { count });
                Some(violation)
            }
            DetectorEvent::Suppressed(_) => None,
        }
    }

    /// Advance the clock by one second. Returns a submission when time ran
    /// out.
    pub fn tick(&mut self) -> Option<Submission> {
        if self.state.phase != Phase::Running {
            return None;
        }
        let clock = self.clock.as_mut()?;
        let event = clock.tick();
        self.state.elapsed_secs = clock.elapsed_secs();

        let display = clock.display();
        if display != self.display {
            self.display = display;
            self.notices.emit(&SessionNotice::ClockDisplay {
                display,
                remaining: clock.format_remaining(),
            });
        }

        match event {
            Some(ClockEvent::Warning { minutes_left }) => {
                info!(minutes_left, "Time warning");
                self.notices.emit(&SessionNotice::TimeWarning { minutes_left });
                None
            }
            Some(ClockEvent::TimeUp) => self.time_up(),
            None => None,
        }
    }

    /// Deadline of the pending automatic termination.
    pub fn termination_deadline(&self) -> Option<Instant> {
        if self.state.phase != Phase::Running {
            return None;
        }
        self.detector.as_ref()?.termination_deadline()
    }

    /// Fire the automatic termination if it is due.
    pub fn poll_termination(&mut self, now: Instant) -> Option<Submission> {
        if self.state.phase != Phase::Running {
            return None;
        }
        if self.detector.as_mut()?.poll_termination(now) {
            self.max_violations_reached()
        } else {
            None
        }
    }

    pub fn submit(&mut self) -> Option<Submission> {
        self.begin_submit(SubmitTrigger::User)
    }

    pub fn time_up(&mut self) -> Option<Submission> {
        self.begin_submit(SubmitTrigger::TimeUp)
    }

    pub fn max_violations_reached(&mut self) -> Option<Submission> {
        warn!(
            tab_switches = self.state.tab_switch_count,
            "Exam terminated after too many tab switches"
        );
        self.begin_submit(SubmitTrigger::MaxTabSwitches)
    }

    /// Dismiss the tab-switch warning. Refused once the limit is reached.
    pub fn dismiss_tab_warning(&mut self) -> bool {
        if self.state.phase != Phase::Running {
            return false;
        }
        if self.state.tab_switch_count >= self.config.detector.max_tab_switches {
            debug!("Tab-switch warning cannot be dismissed at the limit");
            return false;
        }
        self.notices.emit(&SessionNotice::WarningDismissed);
        true
    }

    /// Dismiss the fullscreen warning and ask for fullscreen again.
    pub fn return_to_exam(&mut self) -> Result<(), SessionError> {
        self.require(Phase::Running, "return_to_exam")?;
        self.notices.emit(&SessionNotice::WarningDismissed);
        if let Some(detector) = self.detector.as_mut() {
            if let Err(e) = detector.platform_mut().request_fullscreen() {
                warn!("Fullscreen re-request failed: {e}");
                self.notices.emit(&SessionNotice::PermissionDenied {
                    capability: Capability::Fullscreen,
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }

    // ── SUBMITTING ───────────────────────────────────────────────────────

    fn begin_submit(&mut self, trigger: SubmitTrigger) -> Option<Submission> {
        if self.state.phase != Phase::Running {
            debug!(?trigger, phase = ?self.state.phase, "Submission already handled");
            return None;
        }
        self.release();
        self.trigger = Some(trigger);
        self.set_phase(Phase::Submitting);
        info!(?trigger, answers = self.state.answers.len(), "Submitting exam");

        Some(Submission {
            trigger,
            answers: self.state.answers.clone(),
            tab_switch_count: self.state.tab_switch_count,
            fullscreen_exit_count: self.state.fullscreen_exit_count,
            elapsed_secs: self.state.elapsed_secs,
        })
    }

    /// Record the outcome of the submission side effect and end the
    /// session. A failed side effect is logged and the session still ends.
    pub fn finish_submission(
        &mut self,
        result: Result<(), ProctorError>,
    ) -> Result<EndReason, SessionError> {
        self.require(Phase::Submitting, "finish_submission")?;
        match result {
            Ok(()) => self.notices.emit(&SessionNotice::Submitted {
                answers: self.state.answers.len(),
                tab_switches: self.state.tab_switch_count,
                fullscreen_exits: self.state.fullscreen_exit_count,
            }),
            Err(e) => {
                error!("Error submitting exam: {e}");
                self.submission_failed = true;
                self.notices.emit(&SessionNotice::Error {
                    code: e.code().code_string(),
                    message: e.to_string(),
                });
            }
        }
        let reason = self
            .trigger
            .map(SubmitTrigger::end_reason)
            .unwrap_or(EndReason::Submitted);
        self.end(reason);
        Ok(reason)
    }

    /// Run the side effect for `submission` and end the session.
    pub async fn complete_submission<K: SubmissionSink>(
        &mut self,
        submission: &Submission,
        sink: &K,
    ) -> Result<EndReason, SessionError> {
        self.require(Phase::Submitting, "complete_submission")?;
        let result = sink.persist(submission).await;
        self.finish_submission(result)
    }

    // ── ENDED ────────────────────────────────────────────────────────────

    /// Abandon the session without submitting. Answers and counters are
    /// discarded; violations already reported stay recorded remotely.
    pub fn manual_end(&mut self) -> Result<(), SessionError> {
        match self.state.phase {
            Phase::Rules | Phase::Running => {
                info!(phase = ?self.state.phase, "Exam ended manually");
                self.end(EndReason::Abandoned);
                Ok(())
            }
            Phase::Submitting => Err(SessionError::InvalidPhase {
                operation: "manual_end",
                phase: Phase::Submitting,
            }),
            Phase::Ended => Ok(()),
        }
    }

    fn end(&mut self, reason: EndReason) {
        self.release();
        self.end_reason = Some(reason);
        self.set_phase(Phase::Ended);
        self.notices.emit(&SessionNotice::Ended {
            reason,
            submission_failed: self.submission_failed,
        });
    }

    /// Stop the clock and detach the detector. Idempotent.
    fn release(&mut self) {
        if let Some(clock) = self.clock.as_mut() {
            clock.stop();
        }
        if let Some(detector) = self.detector.as_mut() {
            detector.detach();
        }
    }

    /// Release every resource, whatever the phase.
    pub fn teardown(&mut self) {
        self.release();
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn clock(&self) -> Option<&CountdownClock> {
        self.clock.as_ref()
    }

    pub fn detector(&self) -> Option<&IntegrityEventDetector<P>> {
        self.detector.as_ref()
    }

    /// Remaining seconds; the full duration before the exam starts.
    pub fn remaining_secs(&self) -> u64 {
        match &self.clock {
            Some(clock) => clock.remaining_secs(),
            None => u64::from(self.config.duration_minutes) * 60,
        }
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn submission_failed(&self) -> bool {
        self.submission_failed
    }

    pub fn notices(&self) -> &EventBus {
        &self.notices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{SignalClass, VirtualPlatform};
    use proctor_common::{MemoryStore, StoreKey, ViolationCounters};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn controller(config: SessionConfig) -> SessionController<VirtualPlatform> {
        SessionController::new(config, VirtualPlatform::new(), EventBus::default())
    }

    fn started(config: SessionConfig) -> (SessionController<VirtualPlatform>, Instant) {
        let mut c = controller(config);
        let now = Instant::now();
        c.accept_rules(now).unwrap();
        (c, now)
    }

    struct CountingSink {
        calls: AtomicU32,
        fail: bool,
    }

    impl SubmissionSink for CountingSink {
        async fn persist(&self, _submission: &Submission) -> Result<(), ProctorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProctorError::Storage("disk full".into()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn rules_phase_rejects_exam_operations() {
        let mut c = controller(SessionConfig::default());
        assert_eq!(c.phase(), Phase::Rules);
        assert!(c.record_answer("q1", "a").is_err());
        assert!(c.next_page().is_err());
        assert!(c.submit().is_none());
        assert_eq!(c.tick(), None);
        assert_eq!(c.remaining_secs(), 3600);
    }

    #[test]
    fn accept_rules_starts_everything() {
        let (c, _) = started(SessionConfig::default());
        assert_eq!(c.phase(), Phase::Running);
        assert_eq!(c.state().current_page, 1);
        let detector = c.detector().unwrap();
        assert!(detector.platform().is_fullscreen());
        assert_eq!(detector.platform().subscriptions().len(), SignalClass::ALL.len());
        assert!(!c.clock().unwrap().is_finished());
    }

    #[test]
    fn accept_rules_twice_is_rejected() {
        let (mut c, now) = started(SessionConfig::default());
        assert_eq!(
            c.accept_rules(now),
            Err(SessionError::InvalidPhase {
                operation: "accept_rules",
                phase: Phase::Running
            })
        );
    }

    #[test]
    fn fullscreen_denial_does_not_block_the_exam() {
        let mut c = SessionController::new(
            SessionConfig::default(),
            VirtualPlatform::new().deny_fullscreen(),
            EventBus::default(),
        );
        let mut rx = c.notices().subscribe();
        c.accept_rules(Instant::now()).unwrap();
        assert_eq!(c.phase(), Phase::Running);
        let first: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["event"], "permission_denied");
        assert_eq!(first["data"]["capability"], "fullscreen");
    }

    #[test]
    fn paging_is_clamped() {
        let (mut c, _) = started(SessionConfig {
            total_pages: 2,
            ..Default::default()
        });
        assert_eq!(c.prev_page().unwrap(), 1);
        assert_eq!(c.next_page().unwrap(), 2);
        assert_eq!(c.next_page().unwrap(), 2);
        assert_eq!(c.prev_page().unwrap(), 1);
    }

    #[test]
    fn hour_exam_times_out_after_3600_ticks() {
        let (mut c, _) = started(SessionConfig::default());
        let mut warnings = Vec::new();
        let mut rx = c.notices().subscribe();
        let mut submission = None;
        for tick in 1..=3600u64 {
            if let Some(s) = c.tick() {
                assert_eq!(tick, 3600);
                submission = Some(s);
            }
            assert_eq!(c.state().elapsed_secs + c.remaining_secs(), 3600);
            while let Ok(line) = rx.try_recv() {
                let v: serde_json::Value = serde_json::from_str(&line).unwrap();
                if v["event"] == "time_warning" {
                    warnings.push(v["data"]["minutes_left"].as_u64().unwrap());
                }
            }
        }
        assert_eq!(warnings, vec![30, 10, 5]);
        let submission = submission.unwrap();
        assert_eq!(submission.trigger, SubmitTrigger::TimeUp);
        assert_eq!(c.phase(), Phase::Submitting);

        assert_eq!(c.finish_submission(Ok(())), Ok(EndReason::TimeUp));
        assert_eq!(c.phase(), Phase::Ended);
        assert_eq!(c.tick(), None);
    }

    #[test]
    fn tab_limit_schedules_termination_once() {
        let (mut c, t0) = started(SessionConfig::default());
        let hidden = PlatformSignal::Visibility { hidden: true };
        for _ in 0..14 {
            assert!(c.handle_signal(&hidden, t0).is_some());
        }
        assert_eq!(c.termination_deadline(), None);
        assert!(c.dismiss_tab_warning());

        c.handle_signal(&hidden, t0);
        let deadline = c.termination_deadline().unwrap();
        assert_eq!(deadline, t0 + Duration::from_secs(3));
        assert!(!c.dismiss_tab_warning());

        c.handle_signal(&hidden, t0 + Duration::from_secs(1));
        assert_eq!(c.termination_deadline(), Some(deadline));
        assert_eq!(c.state().tab_switch_count, 16);

        assert!(c.poll_termination(t0 + Duration::from_secs(2)).is_none());
        let submission = c.poll_termination(deadline).unwrap();
        assert_eq!(submission.trigger, SubmitTrigger::MaxTabSwitches);
        assert_eq!(submission.tab_switch_count, 16);
        assert_eq!(c.finish_submission(Ok(())), Ok(EndReason::MaxTabSwitches));
    }

    #[test]
    fn warning_dismissal_only_while_running() {
        let mut c = controller(SessionConfig::default());
        let mut notices = c.notices().subscribe();
        assert!(!c.dismiss_tab_warning());
        assert!(notices.try_recv().is_err());

        c.manual_end().unwrap();
        while notices.try_recv().is_ok() {}
        assert!(!c.dismiss_tab_warning());
        assert!(notices.try_recv().is_err());
    }

    #[test]
    fn fullscreen_exits_never_end_the_exam() {
        let (mut c, t0) = started(SessionConfig::default());
        for _ in 0..50 {
            c.handle_signal(&PlatformSignal::Fullscreen { active: false }, t0);
            c.return_to_exam().unwrap();
        }
        assert_eq!(c.state().fullscreen_exit_count, 50);
        assert_eq!(c.termination_deadline(), None);
        assert_eq!(c.phase(), Phase::Running);
        // Initial request plus one per return.
        assert_eq!(c.detector().unwrap().platform().fullscreen_requests(), 51);
    }

    #[test]
    fn submission_is_single_shot() {
        let (mut c, t0) = started(SessionConfig {
            detector: DetectorPolicy {
                max_tab_switches: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        c.record_answer("q1", "b").unwrap();
        c.handle_signal(&PlatformSignal::Visibility { hidden: true }, t0);

        let first = c.submit();
        assert!(first.is_some());
        assert!(c.submit().is_none());
        assert!(c.time_up().is_none());
        assert!(c.poll_termination(t0 + Duration::from_secs(10)).is_none());
        assert!(c.record_answer("q2", "c").is_err());
        assert_eq!(c.manual_end(), Err(SessionError::InvalidPhase {
            operation: "manual_end",
            phase: Phase::Submitting,
        }));

        assert_eq!(c.finish_submission(Ok(())), Ok(EndReason::Submitted));
        assert!(c.finish_submission(Ok(())).is_err());
        assert!(c.submit().is_none());
    }

    #[tokio::test]
    async fn double_submit_runs_side_effect_once() {
        let (mut c, _) = started(SessionConfig::default());
        let sink = CountingSink {
            calls: AtomicU32::new(0),
            fail: false,
        };
        for _ in 0..3 {
            if let Some(submission) = c.submit() {
                c.complete_submission(&submission, &sink).await.unwrap();
            }
        }
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.end_reason(), Some(EndReason::Submitted));
    }

    #[tokio::test]
    async fn failed_side_effect_still_ends_session() {
        let (mut c, _) = started(SessionConfig::default());
        let sink = CountingSink {
            calls: AtomicU32::new(0),
            fail: true,
        };
        let submission = c.submit().unwrap();
        let reason = c.complete_submission(&submission, &sink).await.unwrap();
        assert_eq!(reason, EndReason::Submitted);
        assert_eq!(c.phase(), Phase::Ended);
        assert!(c.submission_failed());
    }

    #[tokio::test]
    async fn store_sink_persists_answers_and_counters() {
        let store = Arc::new(MemoryStore::new());
        let sink = StoreSink::new(Arc::clone(&store));
        let (mut c, t0) = started(SessionConfig::default());
        c.record_answer("q1", "a").unwrap();
        c.handle_signal(&PlatformSignal::Visibility { hidden: true }, t0);
        c.handle_signal(&PlatformSignal::Fullscreen { active: false }, t0);

        let submission = c.submit().unwrap();
        c.complete_submission(&submission, &sink).await.unwrap();
        assert_eq!(store.load_counters().unwrap(), ViolationCounters::new(1, 1));
        assert_eq!(
            store.get(StoreKey::Answers).unwrap().as_deref(),
            Some(r#"{"q1":"a"}"#)
        );
    }

    #[tokio::test]
    async fn store_sink_begin_clears_the_previous_session() {
        let store = Arc::new(MemoryStore::new());
        store.save_counters(5, 2).unwrap();
        store.set(StoreKey::Answers, r#"{"q1":"old"}"#).unwrap();

        StoreSink::new(Arc::clone(&store)).begin().await.unwrap();
        assert_eq!(store.load_counters().unwrap(), ViolationCounters::default());
        assert_eq!(store.get(StoreKey::Answers).unwrap(), None);
    }

    #[test]
    fn ended_session_ignores_signals() {
        let (mut c, t0) = started(SessionConfig::default());
        c.handle_signal(&PlatformSignal::Visibility { hidden: true }, t0);
        c.manual_end().unwrap();
        assert_eq!(c.end_reason(), Some(EndReason::Abandoned));
        assert!(
            c.handle_signal(&PlatformSignal::Visibility { hidden: true }, t0)
                .is_none()
        );
        assert_eq!(c.state().tab_switch_count, 1);
        let detector = c.detector().unwrap();
        assert!(!detector.is_attached());
        assert!(detector.platform().subscriptions().is_empty());
        assert!(!detector.platform().is_fullscreen());
        assert!(c.clock().unwrap().is_finished());
        assert_eq!(c.manual_end(), Ok(()));
    }

    #[test]
    fn manual_end_from_rules() {
        let mut c = controller(SessionConfig::default());
        c.manual_end().unwrap();
        assert_eq!(c.phase(), Phase::Ended);
        assert!(c.accept_rules(Instant::now()).is_err());
    }
}
