//! Shared types, wire protocol and configuration for the exam proctor.
//!
//! This crate holds everything the monitoring engine and the `proctor`
//! binary agree on: violation and detection types, the JSON shapes of the
//! detection service, configuration loading, the error catalog, logging
//! setup, and the session-scoped key/value store.

pub mod config;
pub mod errors;
pub mod logging;
pub mod protocol;
pub mod store;
pub mod types;

pub use config::{
    ConfigError, ConfigSource, ConfigWarning, EnvError, EnvParser, EnvProblem, LoadedConfig,
    ProctorConfig, Severity, Sourced,
};
pub use errors::{Capability, ErrorCategory, ErrorCode, ErrorEntry, ProctorError};
pub use logging::{LogConfig, LogFormat, LoggingError, LoggingGuards, init_logging};
pub use protocol::{
    AnalyzeFrameRequest, AnalyzeFrameResponse, BoundingBox, DetectionBoxes, GetViolationsResponse,
    RecordedViolation, ReportViolationRequest, VerificationReport,
};
pub use store::{FileStore, MemoryStore, SessionStore, StoreKey};
pub use types::{
    DetectionFlags, DetectionResult, IdentityVerification, SessionIds, ViolationCounters,
    ViolationEvent, ViolationKind,
};
