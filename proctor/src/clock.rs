//! Exam countdown clock.
//!
//! The clock is a plain state machine advanced one second per [`CountdownClock::tick`].
//! [`CountdownClock::run`] drives it from a tokio interval for callers that
//! want callbacks instead of polling.

use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info};

/// Clock resolution.
pub const TICK: Duration = Duration::from_secs(1);

/// Remaining-time thresholds that produce a one-shot warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningThreshold {
    ThirtyMinutes,
    TenMinutes,
    FiveMinutes,
}

impl WarningThreshold {
    /// Thresholds from the largest remaining time to the smallest.
    pub const ALL: [WarningThreshold; 3] = [
        WarningThreshold::ThirtyMinutes,
        WarningThreshold::TenMinutes,
        WarningThreshold::FiveMinutes,
    ];

    pub const fn remaining_secs(&self) -> u64 {
        match self {
            Self::ThirtyMinutes => 1800,
            Self::TenMinutes => 600,
            Self::FiveMinutes => 300,
        }
    }

    pub const fn minutes_left(&self) -> u32 {
        match self {
            Self::ThirtyMinutes => 30,
            Self::TenMinutes => 10,
            Self::FiveMinutes => 5,
        }
    }
}

/// What a tick produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    Warning { minutes_left: u32 },
    TimeUp,
}

/// Urgency band of the remaining time, used to color the countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockDisplay {
    Normal,
    Caution,
    Warning,
    Critical,
}

impl ClockDisplay {
    pub fn for_remaining(remaining_secs: u64) -> Self {
        match remaining_secs {
            0..=300 => Self::Critical,
            301..=600 => Self::Warning,
            601..=1800 => Self::Caution,
            _ => Self::Normal,
        }
    }
}

/// Countdown over a fixed exam duration.
///
/// `elapsed + remaining == total` holds at every observable point.
#[derive(Debug, Clone)]
pub struct CountdownClock {
    total_secs: u64,
    remaining_secs: u64,
    crossed: BTreeSet<WarningThreshold>,
    finished: bool,
}

impl CountdownClock {
    pub fn new(duration_minutes: u32) -> Self {
        let total_secs = u64::from(duration_minutes) * 60;
        // A threshold the exam starts at or below can never be crossed.
        let crossed = WarningThreshold::ALL
            .into_iter()
            .filter(|t| t.remaining_secs() >= total_secs)
            .collect();
        Self {
            total_secs,
            remaining_secs: total_secs,
            crossed,
            finished: false,
        }
    }

    /// Advance by one second.
    ///
    /// Returns at most one event. Nothing happens once the clock finished or
    /// was stopped.
    pub fn tick(&mut self) -> Option<ClockEvent> {
        if self.finished {
            return None;
        }

        self.remaining_secs = self.remaining_secs.saturating_sub(1);
        if self.remaining_secs == 0 {
            self.finished = true;
            info!(total_secs = self.total_secs, "Exam time is up");
            return Some(ClockEvent::TimeUp);
        }

        let remaining = self.remaining_secs;
        let threshold = WarningThreshold::ALL
            .into_iter()
            .find(|t| !self.crossed.contains(t) && remaining <= t.remaining_secs())?;
        self.crossed.insert(threshold);
        debug!(?threshold, remaining, "Time warning threshold crossed");
        Some(ClockEvent::Warning {
            minutes_left: threshold.minutes_left(),
        })
    }

    /// Stop without producing a time-up event. Idempotent.
    pub fn stop(&mut self) {
        if !self.finished {
            debug!(remaining = self.remaining_secs, "Countdown stopped");
        }
        self.finished = true;
    }

    pub fn total_secs(&self) -> u64 {
        self.total_secs
    }

    pub fn remaining_secs(&self) -> u64 {
        self.remaining_secs
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.total_secs - self.remaining_secs
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn has_crossed(&self, threshold: WarningThreshold) -> bool {
        self.crossed.contains(&threshold)
    }

    pub fn display(&self) -> ClockDisplay {
        ClockDisplay::for_remaining(self.remaining_secs)
    }

    /// Fraction of the exam already elapsed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_secs == 0 {
            return 1.0;
        }
        self.elapsed_secs() as f64 / self.total_secs as f64
    }

    pub fn format_remaining(&self) -> String {
        format_remaining(self.remaining_secs)
    }

    /// Drive the clock from a one-second interval until time is up or it is
    /// stopped.
    pub async fn run<W, T>(mut self, mut on_warning: W, on_time_up: T) -> Self
    where
        W: FnMut(u32),
        T: FnOnce(),
    {
        let mut ticker = interval_at(Instant::now() + TICK, TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.finished {
            ticker.tick().await;
            match self.tick() {
                Some(ClockEvent::Warning { minutes_left }) => on_warning(minutes_left),
                Some(ClockEvent::TimeUp) => {
                    on_time_up();
                    break;
                }
                None => {}
            }
        }
        self
    }
}

/// `H:MM:SS` when at least an hour remains, `M:SS` otherwise.
pub fn format_remaining(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}
