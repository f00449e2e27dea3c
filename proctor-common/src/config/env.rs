//! `PROCTOR_*` environment overrides.
//!
//! Every lookup returns a [`Sourced`] value. Unparseable values fall back to
//! the supplied default and leave an [`EnvError`] behind, so a caller can
//! report every bad variable in one pass instead of stopping at the first.

use super::source::Sourced;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const PREFIX: &str = "PROCTOR_";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// A `PROCTOR_*` variable that could not be used.
#[derive(Debug, Error)]
#[error("{var}='{value}': {problem}")]
pub struct EnvError {
    pub var: String,
    pub value: String,
    pub problem: EnvProblem,
}

/// What was wrong with an override.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvProblem {
    #[error("not a whole number")]
    NotANumber,
    #[error("outside {min}..={max}")]
    OutOfRange { min: u32, max: u32 },
    #[error("not a duration (try 3s, 250ms or 1m 30s)")]
    NotADuration,
    #[error("unknown log level (expected one of {})", LOG_LEVELS.join(", "))]
    UnknownLogLevel,
}

/// Reads overrides and collects the ones that failed to parse.
#[derive(Debug, Default)]
pub struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Plain string override.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        self.parse(name, default.to_string(), |raw| Ok(raw.to_string()))
    }

    /// Log level, normalized to lower case.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        self.parse(name, default.to_string(), |raw| {
            let level = raw.trim().to_ascii_lowercase();
            if LOG_LEVELS.contains(&level.as_str()) {
                Ok(level)
            } else {
                Err(EnvProblem::UnknownLogLevel)
            }
        })
    }

    /// Integer override bounded to `min..=max`.
    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        self.parse(name, default, |raw| {
            let n: u32 = raw.trim().parse().map_err(|_| EnvProblem::NotANumber)?;
            if (min..=max).contains(&n) {
                Ok(n)
            } else {
                Err(EnvProblem::OutOfRange { min, max })
            }
        })
    }

    /// Human-readable duration such as `3s` or `1m 30s`.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        self.parse(name, default, |raw| {
            humantime::parse_duration(raw.trim()).map_err(|_| EnvProblem::NotADuration)
        })
    }

    /// Optional path. An empty value explicitly clears the setting.
    pub fn get_optional_path(&mut self, name: &str) -> Sourced<Option<PathBuf>> {
        self.parse(name, None, |raw| {
            Ok((!raw.is_empty()).then(|| expand_home(raw)))
        })
    }

    fn parse<T>(
        &mut self,
        name: &str,
        default: T,
        convert: impl FnOnce(&str) -> Result<T, EnvProblem>,
    ) -> Sourced<T> {
        let var = format!("{PREFIX}{name}");
        let Ok(raw) = std::env::var(&var) else {
            return Sourced::default_value(default);
        };
        match convert(&raw) {
            Ok(value) => Sourced::from_env(value, var),
            Err(problem) => {
                self.errors.push(EnvError {
                    var,
                    value: raw,
                    problem,
                });
                Sourced::default_value(default)
            }
        }
    }
}

/// Resolve a leading `~/` against the home directory.
pub fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    }
}
