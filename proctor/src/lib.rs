//! Exam integrity monitor.
//!
//! Runs one exam session: a countdown clock, detection of tab switches and
//! fullscreen exits, a camera frame analysis loop against the remote
//! detection service, and the session state machine that ties them
//! together. Violations are reported to the service as they happen and
//! summarized after the exam.

#![forbid(unsafe_code)]

pub mod aggregate;
pub mod capture;
pub mod clock;
pub mod detector;
pub mod events;
pub mod frame_loop;
pub mod reporter;
pub mod runtime;
pub mod service;
pub mod session;

pub use aggregate::{ViolationSummary, aggregate, render_table};
pub use capture::{DirectoryFrameSource, Frame, FrameSource};
pub use clock::{ClockDisplay, ClockEvent, CountdownClock, WarningThreshold};
pub use detector::{
    DetectorEvent, DetectorPolicy, IntegrityEventDetector, Platform, PlatformSignal, SignalClass,
    VirtualPlatform,
};
pub use events::{EventBus, SessionNotice};
pub use frame_loop::{FrameAnalysis, FrameLoopEvent, ProxyLatch, RemoteFrameAnalysisLoop};
pub use reporter::ViolationReporter;
pub use runtime::{Command, ExamRuntime, Input, SessionOutcome};
pub use service::{DetectionService, HttpDetectionClient};
pub use session::{
    EndReason, Phase, SessionConfig, SessionController, SessionError, StoreSink, Submission,
    SubmissionSink,
};
