//! Session event loop.
//!
//! A single task owns the [`SessionController`] and serializes everything
//! that can change it: clock ticks, platform signals and user commands,
//! frame analysis updates and the automatic termination deadline. Nothing
//! else mutates session state, so transitions never interleave.

use crate::capture::FrameSource;
use crate::clock::TICK;
use crate::detector::{Platform, PlatformSignal};
use crate::events::SessionNotice;
use crate::frame_loop::{FrameLoopEvent, FrameLoopHandle, LoopStats, RemoteFrameAnalysisLoop};
use crate::reporter::ViolationReporter;
use crate::service::DetectionService;
use crate::session::{
    EndReason, Phase, SessionController, SessionState, Submission, SubmissionSink,
};
use proctor_common::{ErrorCode, ProctorError, SessionIds, ViolationEvent};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, info, warn};

/// User action on the exam UI.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    AcceptRules,
    Answer { question_id: String, text: String },
    Next,
    Prev,
    Submit,
    End,
    DismissWarning,
    ReturnToExam,
}

/// One line of input: a platform signal or a command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Input {
    Signal(PlatformSignal),
    Command(Command),
}

impl Input {
    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// How a session run finished.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub end_reason: Option<EndReason>,
    pub submission_failed: bool,
    pub state: SessionState,
    /// Focus-gap switches that followed a hidden page and may have counted
    /// one excursion twice.
    pub suspected_double_counts: u32,
    pub frame_stats: Option<LoopStats>,
}

/// Owns a session and everything that feeds it.
pub struct ExamRuntime<P: Platform, S: DetectionService, F: FrameSource, K: SubmissionSink> {
    controller: SessionController<P>,
    ids: Option<SessionIds>,
    service: Arc<S>,
    reporter: ViolationReporter<S>,
    frames: Option<F>,
    sink: K,
    capture_retry: Duration,
    ticker: Option<Interval>,
    frame_loop: Option<FrameLoopHandle>,
    frame_events: Option<mpsc::UnboundedReceiver<FrameLoopEvent>>,
    frame_stats: Option<LoopStats>,
}

impl<P, S, F, K> ExamRuntime<P, S, F, K>
where
    P: Platform,
    S: DetectionService,
    F: FrameSource,
    K: SubmissionSink,
{
    pub fn new(
        controller: SessionController<P>,
        service: Arc<S>,
        ids: Option<SessionIds>,
        frames: Option<F>,
        sink: K,
    ) -> Self {
        let reporter = ViolationReporter::new(Arc::clone(&service), ids.clone());
        Self {
            controller,
            ids,
            service,
            reporter,
            frames,
            sink,
            capture_retry: Duration::from_millis(50),
            ticker: None,
            frame_loop: None,
            frame_events: None,
            frame_stats: None,
        }
    }

    pub fn with_capture_retry(mut self, retry: Duration) -> Self {
        self.capture_retry = retry;
        self
    }

    /// Run until the session ends. Closing `inputs` abandons the session.
    pub async fn run(mut self, mut inputs: mpsc::Receiver<Input>) -> SessionOutcome {
        while self.controller.phase() != Phase::Ended {
            let deadline = self.controller.termination_deadline();
            tokio::select! {
                biased;
                _ = sleep_until_some(deadline) => {
                    if let Some(submission) = self.controller.poll_termination(Instant::now()) {
                        self.complete(submission).await;
                    }
                }
                _ = next_tick(&mut self.ticker) => {
                    if let Some(submission) = self.controller.tick() {
                        self.complete(submission).await;
                    }
                }
                event = recv_some(&mut self.frame_events) => match event {
                    Some(event) => self.on_frame_event(event),
                    None => self.frame_events = None,
                },
                input = inputs.recv() => match input {
                    Some(input) => self.on_input(input).await,
                    None => {
                        info!("Input closed; abandoning session");
                        if let Err(e) = self.controller.manual_end() {
                            debug!("Abandon ignored: {e}");
                        }
                    }
                },
            }
        }

        self.stop_monitoring().await;
        self.controller.teardown();
        SessionOutcome {
            end_reason: self.controller.end_reason(),
            submission_failed: self.controller.submission_failed(),
            state: self.controller.state().clone(),
            suspected_double_counts: self
                .controller
                .detector()
                .map_or(0, |d| d.suspected_double_counts()),
            frame_stats: self.frame_stats,
        }
    }

    async fn on_input(&mut self, input: Input) {
        match input {
            Input::Signal(signal) => {
                if let Some(violation) = self.controller.handle_signal(&signal, Instant::now()) {
                    self.report(&violation);
                }
            }
            Input::Command(command) => self.on_command(command).await,
        }
    }

    async fn on_command(&mut self, command: Command) {
        debug!(?command, "Command");
        let result = match command {
            Command::AcceptRules => match self.controller.accept_rules(Instant::now()) {
                Ok(()) => {
                    if let Err(e) = self.sink.begin().await {
                        warn!("Stale session data not cleared: {e}");
                    }
                    self.start_monitoring();
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Command::Answer { question_id, text } => self.controller.record_answer(question_id, text),
            Command::Next => self.controller.next_page().map(|_| ()),
            Command::Prev => self.controller.prev_page().map(|_| ()),
            Command::Submit => {
                if let Some(submission) = self.controller.submit() {
                    self.complete(submission).await;
                }
                Ok(())
            }
            Command::End => self.controller.manual_end(),
            Command::DismissWarning => {
                self.controller.dismiss_tab_warning();
                Ok(())
            }
            Command::ReturnToExam => self.controller.return_to_exam(),
        };

        if let Err(e) = result {
            warn!("{e}");
            self.controller.notices().emit(&SessionNotice::Error {
                code: e.code().code_string(),
                message: e.to_string(),
            });
        }
    }

    fn start_monitoring(&mut self) {
        let mut ticker = interval_at(Instant::now() + TICK, TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);

        let Some(ids) = self.ids.clone() else {
            let err = ProctorError::MissingSessionIds;
            warn!("Frame analysis disabled: {err}");
            self.controller.notices().emit(&SessionNotice::Error {
                code: err.code().code_string(),
                message: err.to_string(),
            });
            return;
        };
        let Some(source) = self.frames.take() else {
            self.controller.notices().emit(&SessionNotice::CameraUnavailable {
                message: ErrorCode::CameraUnavailable.message().to_string(),
            });
            return;
        };

        let (frame_loop, events) = RemoteFrameAnalysisLoop::new(
            ids,
            Arc::clone(&self.service),
            source,
            self.capture_retry,
        );
        match frame_loop.start() {
            Ok(handle) => {
                self.frame_loop = Some(handle);
                self.frame_events = Some(events);
            }
            Err(e) => {
                warn!("Camera unavailable: {e}");
                self.controller.notices().emit(&SessionNotice::CameraUnavailable {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn stop_monitoring(&mut self) {
        self.ticker = None;
        self.frame_events = None;
        if let Some(handle) = self.frame_loop.take() {
            self.frame_stats = Some(handle.stop().await);
        }
    }

    fn on_frame_event(&mut self, event: FrameLoopEvent) {
        if self.controller.phase() != Phase::Running {
            return;
        }
        let notices = self.controller.notices().clone();
        match event {
            FrameLoopEvent::Monitoring {
                flags,
                tracked_person_id,
            } => notices.emit(&SessionNotice::MonitoringStatus {
                tracked_person_id,
                active: flags.active(),
            }),
            FrameLoopEvent::ProxyDetected(violation) => {
                self.report(&violation);
                notices.emit(&SessionNotice::IdentityStatus { verified: false });
                notices.emit(&SessionNotice::ProxyViolationReported);
            }
            FrameLoopEvent::IdentityVerified => {
                notices.emit(&SessionNotice::IdentityStatus { verified: true });
            }
        }
    }

    fn report(&self, violation: &ViolationEvent) {
        if let Err(e) = self.reporter.report(violation) {
            debug!(kind = %violation.kind, "Violation not reported: {e}");
        }
    }

    /// Stop monitoring, run the submission side effect and end the session.
    async fn complete(&mut self, submission: Submission) {
        self.stop_monitoring().await;
        if let Err(e) = self
            .controller
            .complete_submission(&submission, &self.sink)
            .await
        {
            warn!("Submission not completed: {e}");
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_some<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signals_and_commands() {
        assert_eq!(
            Input::parse_line(r#"{"signal":"fullscreen","active":false}"#).unwrap(),
            Input::Signal(PlatformSignal::Fullscreen { active: false })
        );
        assert_eq!(
            Input::parse_line(r#" {"command":"accept_rules"} "#).unwrap(),
            Input::Command(Command::AcceptRules)
        );
        assert_eq!(
            Input::parse_line(r#"{"command":"answer","question_id":"q1","text":"b"}"#).unwrap(),
            Input::Command(Command::Answer {
                question_id: "q1".into(),
                text: "b".into()
            })
        );
        assert!(Input::parse_line(r#"{"command":"cheat"}"#).is_err());
        assert!(Input::parse_line("not json").is_err());
    }
}
