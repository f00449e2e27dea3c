//! Configuration system for the proctor.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `PROCTOR_*` environment variables. Each value remembers where it came
//! from so `proctor config` can explain the effective setup.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser, EnvProblem};
pub use source::{ConfigSource, Sourced};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid environment configuration: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Proctor configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProctorConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub exam: ExamConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the detection service.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout in seconds. 0 disables the timeout.
    #[serde(default)]
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: 0,
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamConfig {
    /// Exam length in minutes.
    #[serde(default = "default_duration_minutes")]
    pub duration_minutes: u32,
    /// Number of question pages.
    #[serde(default = "default_total_pages")]
    pub total_pages: u32,
    /// Tab switches at which the session is terminated.
    #[serde(default = "default_max_tab_switches")]
    pub max_tab_switches: u32,
    /// Delay between reaching the tab-switch limit and forced submission.
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,
    /// Minimum blur-to-focus gap counted as a tab switch.
    #[serde(default = "default_focus_gap_ms")]
    pub focus_gap_ms: u64,
}

impl Default for ExamConfig {
    fn default() -> Self {
        Self {
            duration_minutes: default_duration_minutes(),
            total_pages: default_total_pages(),
            max_tab_switches: default_max_tab_switches(),
            termination_grace_ms: default_termination_grace_ms(),
            focus_gap_ms: default_focus_gap_ms(),
        }
    }
}

impl ExamConfig {
    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn focus_gap(&self) -> Duration {
        Duration::from_millis(self.focus_gap_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Directory of JPEG frames replayed as the camera.
    #[serde(default)]
    pub frame_dir: Option<PathBuf>,
    /// JPEG quality hint for encoders that re-compress frames.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: f64,
    /// Pause after a failed cycle (capture or analysis) before the next one.
    #[serde(default = "default_capture_retry_ms")]
    pub capture_retry_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_dir: None,
            jpeg_quality: default_jpeg_quality(),
            capture_retry_ms: default_capture_retry_ms(),
        }
    }
}

impl CaptureConfig {
    pub fn capture_retry(&self) -> Duration {
        Duration::from_millis(self.capture_retry_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Session-scoped key/value file. Defaults under the user data dir.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the state file location.
    pub fn state_file(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("proctor")
                .join("session.json")
        })
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_duration_minutes() -> u32 {
    60
}

fn default_total_pages() -> u32 {
    4
}

fn default_max_tab_switches() -> u32 {
    15
}

fn default_termination_grace_ms() -> u64 {
    3000
}

fn default_focus_gap_ms() -> u64 {
    200
}

fn default_jpeg_quality() -> f64 {
    0.8
}

fn default_capture_retry_ms() -> u64 {
    50
}

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// A validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigWarning {
    pub field: &'static str,
    pub message: String,
    pub severity: Severity,
}

/// Configuration plus the source of every overridable value.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ProctorConfig,
    pub path: Option<PathBuf>,
    pub sources: BTreeMap<&'static str, ConfigSource>,
}

impl ProctorConfig {
    /// Default config file path (`$XDG_CONFIG_HOME/proctor/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("proctor").join("config.toml"))
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load defaults, then `path` (or the default path if it exists), then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        let (config, from_file) = match &file {
            Some(p) => {
                debug!(path = %p.display(), "Loading proctor config");
                (Self::from_file(p)?, true)
            }
            None => (Self::default(), false),
        };

        let mut loaded = LoadedConfig {
            config,
            path: file,
            sources: BTreeMap::new(),
        };
        let base = if from_file {
            ConfigSource::File
        } else {
            ConfigSource::Default
        };
        for key in OVERRIDABLE_KEYS {
            loaded.sources.insert(key, base);
        }

        let mut parser = EnvParser::new();
        loaded.apply_env(&mut parser);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        Ok(loaded)
    }

    /// Check for values that would make a session unusable.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut findings = Vec::new();

        if self.exam.duration_minutes == 0 {
            findings.push(ConfigWarning {
                field: "exam.duration_minutes",
                message: "exam duration is zero; the session ends on the first tick".into(),
                severity: Severity::Error,
            });
        }
        if self.exam.max_tab_switches == 0 {
            findings.push(ConfigWarning {
                field: "exam.max_tab_switches",
                message: "tab-switch limit of zero terminates on the first switch".into(),
                severity: Severity::Warning,
            });
        }
        if self.exam.total_pages == 0 {
            findings.push(ConfigWarning {
                field: "exam.total_pages",
                message: "no question pages configured".into(),
                severity: Severity::Error,
            });
        }
        if !(self.service.base_url.starts_with("http://")
            || self.service.base_url.starts_with("https://"))
        {
            findings.push(ConfigWarning {
                field: "service.base_url",
                message: format!("'{}' is not an http(s) URL", self.service.base_url),
                severity: Severity::Error,
            });
        }
        if !(0.0..=1.0).contains(&self.capture.jpeg_quality) {
            findings.push(ConfigWarning {
                field: "capture.jpeg_quality",
                message: "JPEG quality must be within 0.0..=1.0".into(),
                severity: Severity::Warning,
            });
        }

        findings
    }
}

const OVERRIDABLE_KEYS: [&str; 10] = [
    "general.log_level",
    "service.base_url",
    "service.request_timeout_secs",
    "exam.duration_minutes",
    "exam.max_tab_switches",
    "exam.termination_grace_ms",
    "exam.focus_gap_ms",
    "capture.frame_dir",
    "capture.capture_retry_ms",
    "storage.state_file",
];

impl LoadedConfig {
    /// Apply `PROCTOR_*` overrides on top of the current values.
    pub fn apply_env(&mut self, parser: &mut EnvParser) {
        let cfg = &mut self.config;

        let level = parser.get_log_level("LOG_LEVEL", &cfg.general.log_level);
        if level.is_from_env() {
            cfg.general.log_level = level.value;
            self.sources.insert("general.log_level", ConfigSource::Environment);
        }

        let url = parser.get_string("SERVICE_URL", &cfg.service.base_url);
        if url.is_from_env() {
            cfg.service.base_url = url.value.trim_end_matches('/').to_string();
            self.sources.insert("service.base_url", ConfigSource::Environment);
        }

        let timeout = parser.get_duration(
            "REQUEST_TIMEOUT",
            Duration::from_secs(cfg.service.request_timeout_secs),
        );
        if timeout.is_from_env() {
            cfg.service.request_timeout_secs = timeout.value.as_secs();
            self.sources
                .insert("service.request_timeout_secs", ConfigSource::Environment);
        }

        let duration = parser.get_u32_range("EXAM_MINUTES", cfg.exam.duration_minutes, 1, 24 * 60);
        if duration.is_from_env() {
            cfg.exam.duration_minutes = duration.value;
            self.sources.insert("exam.duration_minutes", ConfigSource::Environment);
        }

        let max_switches =
            parser.get_u32_range("MAX_TAB_SWITCHES", cfg.exam.max_tab_switches, 1, 1000);
        if max_switches.is_from_env() {
            cfg.exam.max_tab_switches = max_switches.value;
            self.sources.insert("exam.max_tab_switches", ConfigSource::Environment);
        }

        let grace = parser.get_duration("TERMINATION_GRACE", cfg.exam.termination_grace());
        if grace.is_from_env() {
            cfg.exam.termination_grace_ms = grace.value.as_millis() as u64;
            self.sources.insert("exam.termination_grace_ms", ConfigSource::Environment);
        }

        let gap = parser.get_duration("FOCUS_GAP", cfg.exam.focus_gap());
        if gap.is_from_env() {
            cfg.exam.focus_gap_ms = gap.value.as_millis() as u64;
            self.sources.insert("exam.focus_gap_ms", ConfigSource::Environment);
        }

        let frames = parser.get_optional_path("FRAME_DIR");
        if frames.is_from_env() {
            cfg.capture.frame_dir = frames.value;
            self.sources.insert("capture.frame_dir", ConfigSource::Environment);
        }

        let retry = parser.get_duration("CAPTURE_RETRY", cfg.capture.capture_retry());
        if retry.is_from_env() {
            cfg.capture.capture_retry_ms = retry.value.as_millis() as u64;
            self.sources.insert("capture.capture_retry_ms", ConfigSource::Environment);
        }

        let state = parser.get_optional_path("STATE_FILE");
        if state.is_from_env() {
            cfg.storage.state_file = state.value;
            self.sources.insert("storage.state_file", ConfigSource::Environment);
        }
    }

    /// Record a command-line override for `key`.
    pub fn mark_cli(&mut self, key: &'static str) {
        self.sources.insert(key, ConfigSource::CommandLine);
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
