//! Integrity event detection from platform signals.
//!
//! The detector turns raw signals (visibility, focus, fullscreen and
//! clipboard) into counted [`ViolationEvent`]s and schedules automatic
//! termination once the tab-switch limit is reached. It is sans-IO: the
//! caller feeds signals with the time they were observed and polls the
//! termination deadline.

use proctor_common::config::ExamConfig;
use proctor_common::{ProctorError, ViolationEvent, ViolationKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const TAB_SWITCH_DETAILS: &str = "User switched tab or window";
pub const FULLSCREEN_EXIT_DETAILS: &str = "User exited fullscreen mode";

// ── Signals ──────────────────────────────────────────────────────────────

/// Raw platform signal observed by the exam window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum PlatformSignal {
    Visibility { hidden: bool },
    Blur,
    Focus,
    Fullscreen { active: bool },
    Copy,
    Cut,
    Paste,
    ContextMenu,
}

/// Listener groups a detector subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalClass {
    Visibility,
    Focus,
    Fullscreen,
    Clipboard,
}

impl SignalClass {
    pub const ALL: [SignalClass; 4] = [
        SignalClass::Visibility,
        SignalClass::Focus,
        SignalClass::Fullscreen,
        SignalClass::Clipboard,
    ];
}

impl PlatformSignal {
    pub fn class(&self) -> SignalClass {
        match self {
            Self::Visibility { .. } => SignalClass::Visibility,
            Self::Blur | Self::Focus => SignalClass::Focus,
            Self::Fullscreen { .. } => SignalClass::Fullscreen,
            Self::Copy | Self::Cut | Self::Paste | Self::ContextMenu => SignalClass::Clipboard,
        }
    }
}

/// Host window the detector listens on.
pub trait Platform: Send {
    fn subscribe(&mut self, class: SignalClass) -> Result<(), ProctorError>;
    fn unsubscribe(&mut self, class: SignalClass);
    fn is_fullscreen(&self) -> bool;
    fn request_fullscreen(&mut self) -> Result<(), ProctorError>;
    fn exit_fullscreen(&mut self);

    /// Let the platform track state carried by a signal it delivered.
    fn observe(&mut self, _signal: &PlatformSignal) {}
}

// ── Policy ───────────────────────────────────────────────────────────────

/// Thresholds for counting and termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorPolicy {
    /// Tab-switch count at which termination is scheduled.
    pub max_tab_switches: u32,
    /// Blur-to-focus gap above which a focus return counts as a switch.
    pub focus_gap: Duration,
    /// Delay between reaching the limit and terminating.
    pub termination_grace: Duration,
}

impl Default for DetectorPolicy {
    fn default() -> Self {
        Self {
            max_tab_switches: 15,
            focus_gap: Duration::from_millis(200),
            termination_grace: Duration::from_secs(3),
        }
    }
}

impl From<&ExamConfig> for DetectorPolicy {
    fn from(exam: &ExamConfig) -> Self {
        Self {
            max_tab_switches: exam.max_tab_switches,
            focus_gap: exam.focus_gap(),
            termination_grace: exam.termination_grace(),
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────

/// Which signal path counted a tab switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchTrigger {
    VisibilityHidden,
    FocusGap,
}

/// Detector output for one signal.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    TabSwitch {
        count: u32,
        trigger: SwitchTrigger,
        violation: ViolationEvent,
        /// Set only on the switch that scheduled termination.
        termination_scheduled: bool,
    },
    FullscreenExit {
        count: u32,
        violation: ViolationEvent,
    },
    /// Clipboard or context-menu action that was blocked.
    Suppressed(PlatformSignal),
}

impl DetectorEvent {
    pub fn violation(&self) -> Option<&ViolationEvent> {
        match self {
            Self::TabSwitch { violation, .. } | Self::FullscreenExit { violation, .. } => {
                Some(violation)
            }
            Self::Suppressed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Idle,
    Pending { deadline: Instant },
    Fired,
    Cancelled,
}

// ── Detector ─────────────────────────────────────────────────────────────

/// Attached detector. Listeners are released on [`detach`](Self::detach) or
/// drop, whichever comes first.
pub struct IntegrityEventDetector<P: Platform> {
    platform: P,
    policy: DetectorPolicy,
    subscribed: Vec<SignalClass>,
    tab_switches: u32,
    fullscreen_exits: u32,
    last_focus_change: Instant,
    last_hidden: Option<Instant>,
    suspected_double_counts: u32,
    termination: Termination,
    attached: bool,
}

impl<P: Platform> IntegrityEventDetector<P> {
    /// Subscribe to every signal class. A class that fails to subscribe is
    /// logged and skipped; the others stay active.
    pub fn attach(mut platform: P, policy: DetectorPolicy, now: Instant) -> Self {
        let mut subscribed = Vec::with_capacity(SignalClass::ALL.len());
        for class in SignalClass::ALL {
            match platform.subscribe(class) {
                Ok(()) => subscribed.push(class),
                Err(e) => warn!(?class, "Signal subscription failed: {e}"),
            }
        }
        debug!(?subscribed, "Integrity detector attached");

        Self {
            platform,
            policy,
            subscribed,
            tab_switches: 0,
            fullscreen_exits: 0,
            last_focus_change: now,
            last_hidden: None,
            suspected_double_counts: 0,
            termination: Termination::Idle,
            attached: true,
        }
    }

    /// Process one signal observed at `now`.
    pub fn handle(&mut self, signal: &PlatformSignal, now: Instant) -> Option<DetectorEvent> {
        if !self.attached || !self.subscribed.contains(&signal.class()) {
            return None;
        }
        self.platform.observe(signal);

        match *signal {
            PlatformSignal::Visibility { hidden: true } => {
                self.last_hidden = Some(now);
                Some(self.count_switch(SwitchTrigger::VisibilityHidden, now))
            }
            PlatformSignal::Visibility { hidden: false } => None,
            PlatformSignal::Blur => {
                self.last_focus_change = now;
                None
            }
            PlatformSignal::Focus => {
                let left_at = self.last_focus_change;
                self.last_focus_change = now;
                if now.saturating_duration_since(left_at) <= self.policy.focus_gap {
                    return None;
                }
                // Both paths fire for one real excursion when the page was
                // hidden between blur and focus.
                if self.last_hidden.is_some_and(|hidden| hidden >= left_at) {
                    self.suspected_double_counts += 1;
                    debug!(
                        double_count = true,
                        count = self.tab_switches + 1,
                        "Focus gap follows a hidden page; possible double count"
                    );
                }
                Some(self.count_switch(SwitchTrigger::FocusGap, now))
            }
            PlatformSignal::Fullscreen { active: false } => {
                self.fullscreen_exits = self.fullscreen_exits.saturating_add(1);
                info!(count = self.fullscreen_exits, "Fullscreen exit detected");
                Some(DetectorEvent::FullscreenExit {
                    count: self.fullscreen_exits,
                    violation: ViolationEvent::new(
                        ViolationKind::FullscreenExit,
                        FULLSCREEN_EXIT_DETAILS,
                    ),
                })
            }
            PlatformSignal::Fullscreen { active: true } => None,
            PlatformSignal::Copy
            | PlatformSignal::Cut
            | PlatformSignal::Paste
            | PlatformSignal::ContextMenu => {
                debug!(?signal, "Blocked clipboard action");
                Some(DetectorEvent::Suppressed(*signal))
            }
        }
    }

    fn count_switch(&mut self, trigger: SwitchTrigger, now: Instant) -> DetectorEvent {
        self.tab_switches = self.tab_switches.saturating_add(1);
        let count = self.tab_switches;

        let termination_scheduled = count >= self.policy.max_tab_switches
            && self.termination == Termination::Idle;
        if termination_scheduled {
            let deadline = now + self.policy.termination_grace;
            self.termination = Termination::Pending { deadline };
            warn!(
                count,
                grace_ms = self.policy.termination_grace.as_millis() as u64,
                "Tab switch limit reached; scheduling termination"
            );
        } else {
            info!(count, ?trigger, "Tab switch detected");
        }

        DetectorEvent::TabSwitch {
            count,
            trigger,
            violation: ViolationEvent::new(ViolationKind::TabSwitch, TAB_SWITCH_DETAILS),
            termination_scheduled,
        }
    }

    /// Deadline of the pending automatic termination, if any.
    pub fn termination_deadline(&self) -> Option<Instant> {
        match self.termination {
            Termination::Pending { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Returns `true` exactly once, when the pending termination is due.
    pub fn poll_termination(&mut self, now: Instant) -> bool {
        match self.termination {
            Termination::Pending { deadline } if now >= deadline => {
                self.termination = Termination::Fired;
                info!(count = self.tab_switches, "Automatic termination due");
                true
            }
            _ => false,
        }
    }

    pub fn tab_switch_count(&self) -> u32 {
        self.tab_switches
    }

    pub fn fullscreen_exit_count(&self) -> u32 {
        self.fullscreen_exits
    }

    pub fn suspected_double_counts(&self) -> u32 {
        self.suspected_double_counts
    }

    pub fn policy(&self) -> &DetectorPolicy {
        &self.policy
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_subscribed(&self, class: SignalClass) -> bool {
        self.subscribed.contains(&class)
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Release every listener, cancel a pending termination and leave
    /// fullscreen. Idempotent.
    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        for class in self.subscribed.drain(..) {
            self.platform.unsubscribe(class);
        }
        if let Termination::Pending { .. } = self.termination {
            debug!("Cancelling pending termination");
            self.termination = Termination::Cancelled;
        }
        if self.platform.is_fullscreen() {
            self.platform.exit_fullscreen();
        }
        debug!(
            tab_switches = self.tab_switches,
            fullscreen_exits = self.fullscreen_exits,
            "Integrity detector detached"
        );
    }
}

impl<P: Platform> Drop for IntegrityEventDetector<P> {
    fn drop(&mut self) {
        self.detach();
    }
}

// ── Virtual platform ─────────────────────────────────────────────────────

/// Platform whose signals arrive from outside (stdin, tests). Tracks
/// subscriptions and fullscreen state from the signals it observes.
#[derive(Debug, Default)]
pub struct VirtualPlatform {
    subscribed: Vec<SignalClass>,
    fullscreen: bool,
    deny_fullscreen: bool,
    unavailable: Vec<SignalClass>,
    fullscreen_requests: u32,
    fullscreen_exits_requested: u32,
}

impl VirtualPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse fullscreen requests.
    pub fn deny_fullscreen(mut self) -> Self {
        self.deny_fullscreen = true;
        self
    }

    /// Make subscribing to `class` fail.
    pub fn without(mut self, class: SignalClass) -> Self {
        self.unavailable.push(class);
        self
    }

    pub fn subscriptions(&self) -> &[SignalClass] {
        &self.subscribed
    }

    pub fn fullscreen_requests(&self) -> u32 {
        self.fullscreen_requests
    }

    pub fn fullscreen_exits_requested(&self) -> u32 {
        self.fullscreen_exits_requested
    }
}

impl Platform for VirtualPlatform {
    fn subscribe(&mut self, class: SignalClass) -> Result<(), ProctorError> {
        if self.unavailable.contains(&class) {
            return Err(ProctorError::Platform(format!("{class:?} listener")));
        }
        if !self.subscribed.contains(&class) {
            self.subscribed.push(class);
        }
        Ok(())
    }

    fn unsubscribe(&mut self, class: SignalClass) {
        self.subscribed.retain(|c| *c != class);
    }

    fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    fn request_fullscreen(&mut self) -> Result<(), ProctorError> {
        self.fullscreen_requests += 1;
        if self.deny_fullscreen {
            return Err(ProctorError::permission(
                proctor_common::Capability::Fullscreen,
                "request rejected",
            ));
        }
        self.fullscreen = true;
        Ok(())
    }

    fn exit_fullscreen(&mut self) {
        self.fullscreen_exits_requested += 1;
        self.fullscreen = false;
    }

    fn observe(&mut self, signal: &PlatformSignal) {
        if let PlatformSignal::Fullscreen { active } = signal {
            self.fullscreen = *active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn attach() -> (IntegrityEventDetector<VirtualPlatform>, Instant) {
        let now = Instant::now();
        (
            IntegrityEventDetector::attach(VirtualPlatform::new(), DetectorPolicy::default(), now),
            now,
        )
    }

    #[test]
    fn hidden_page_counts_and_visible_does_not() {
        let (mut det, t0) = attach();
        let ev = det
            .handle(&PlatformSignal::Visibility { hidden: true }, t0)
            .unwrap();
        assert!(matches!(
            ev,
            DetectorEvent::TabSwitch {
                count: 1,
                trigger: SwitchTrigger::VisibilityHidden,
                termination_scheduled: false,
                ..
            }
        ));
        assert_eq!(ev.violation().unwrap().kind, ViolationKind::TabSwitch);
        assert!(
            det.handle(&PlatformSignal::Visibility { hidden: false }, t0)
                .is_none()
        );
        assert_eq!(det.tab_switch_count(), 1);
    }

    #[test]
    fn short_focus_gap_is_ignored() {
        let (mut det, t0) = attach();
        det.handle(&PlatformSignal::Blur, t0);
        assert!(det.handle(&PlatformSignal::Focus, t0 + 200 * MS).is_none());
        det.handle(&PlatformSignal::Blur, t0 + 300 * MS);
        let ev = det.handle(&PlatformSignal::Focus, t0 + 501 * MS).unwrap();
        assert!(matches!(
            ev,
            DetectorEvent::TabSwitch {
                trigger: SwitchTrigger::FocusGap,
                count: 1,
                ..
            }
        ));
    }

    #[test]
    fn focus_without_blur_measures_from_attach() {
        let (mut det, t0) = attach();
        assert!(det.handle(&PlatformSignal::Focus, t0 + 50 * MS).is_none());
        assert!(det.handle(&PlatformSignal::Focus, t0 + 400 * MS).is_some());
    }

    #[test]
    fn hidden_excursion_counts_twice_and_is_flagged() {
        let (mut det, t0) = attach();
        det.handle(&PlatformSignal::Blur, t0);
        det.handle(&PlatformSignal::Visibility { hidden: true }, t0 + 10 * MS);
        det.handle(&PlatformSignal::Visibility { hidden: false }, t0 + 900 * MS);
        det.handle(&PlatformSignal::Focus, t0 + 1000 * MS);
        assert_eq!(det.tab_switch_count(), 2);
        assert_eq!(det.suspected_double_counts(), 1);
    }

    #[test]
    fn limit_schedules_termination_once() {
        let (mut det, t0) = attach();
        for i in 1..=14 {
            let ev = det
                .handle(&PlatformSignal::Visibility { hidden: true }, t0)
                .unwrap();
            assert!(matches!(
                ev,
                DetectorEvent::TabSwitch { count, termination_scheduled: false, .. } if count == i
            ));
        }
        assert_eq!(det.termination_deadline(), None);

        let ev = det
            .handle(&PlatformSignal::Visibility { hidden: true }, t0)
            .unwrap();
        assert!(matches!(
            ev,
            DetectorEvent::TabSwitch {
                count: 15,
                termination_scheduled: true,
                ..
            }
        ));
        assert_eq!(det.termination_deadline(), Some(t0 + Duration::from_secs(3)));

        let ev = det
            .handle(&PlatformSignal::Visibility { hidden: true }, t0 + MS)
            .unwrap();
        assert!(matches!(
            ev,
            DetectorEvent::TabSwitch {
                count: 16,
                termination_scheduled: false,
                ..
            }
        ));
        assert_eq!(det.termination_deadline(), Some(t0 + Duration::from_secs(3)));

        assert!(!det.poll_termination(t0 + Duration::from_millis(2999)));
        assert!(det.poll_termination(t0 + Duration::from_secs(3)));
        assert!(!det.poll_termination(t0 + Duration::from_secs(4)));
    }

    #[test]
    fn fullscreen_exits_count_but_never_terminate() {
        let (mut det, t0) = attach();
        for i in 1..=40 {
            let ev = det
                .handle(&PlatformSignal::Fullscreen { active: false }, t0)
                .unwrap();
            assert!(matches!(ev, DetectorEvent::FullscreenExit { count, .. } if count == i));
        }
        assert!(
            det.handle(&PlatformSignal::Fullscreen { active: true }, t0)
                .is_none()
        );
        assert_eq!(det.termination_deadline(), None);
        assert_eq!(det.tab_switch_count(), 0);
    }

    #[test]
    fn clipboard_actions_are_suppressed() {
        let (mut det, t0) = attach();
        for signal in [
            PlatformSignal::Copy,
            PlatformSignal::Cut,
            PlatformSignal::Paste,
            PlatformSignal::ContextMenu,
        ] {
            assert_eq!(det.handle(&signal, t0), Some(DetectorEvent::Suppressed(signal)));
        }
        assert_eq!(det.tab_switch_count(), 0);
    }

    #[test]
    fn failed_subscription_leaves_other_classes_active() {
        let platform = VirtualPlatform::new().without(SignalClass::Focus);
        let t0 = Instant::now();
        let mut det = IntegrityEventDetector::attach(platform, DetectorPolicy::default(), t0);
        assert!(!det.is_subscribed(SignalClass::Focus));
        assert!(det.is_subscribed(SignalClass::Visibility));
        assert!(det.handle(&PlatformSignal::Focus, t0 + Duration::from_secs(5)).is_none());
        assert!(
            det.handle(&PlatformSignal::Visibility { hidden: true }, t0)
                .is_some()
        );
    }

    #[test]
    fn detach_releases_everything_and_cancels_termination() {
        let policy = DetectorPolicy {
            max_tab_switches: 1,
            ..Default::default()
        };
        let t0 = Instant::now();
        let mut platform = VirtualPlatform::new();
        platform.request_fullscreen().unwrap();
        let mut det = IntegrityEventDetector::attach(platform, policy, t0);
        assert_eq!(det.platform().subscriptions().len(), 4);

        det.handle(&PlatformSignal::Visibility { hidden: true }, t0);
        assert!(det.termination_deadline().is_some());

        det.detach();
        det.detach();
        assert!(det.platform().subscriptions().is_empty());
        assert!(!det.platform().is_fullscreen());
        assert_eq!(det.platform().fullscreen_exits_requested(), 1);
        assert_eq!(det.termination_deadline(), None);
        assert!(!det.poll_termination(t0 + Duration::from_secs(10)));
        assert!(
            det.handle(&PlatformSignal::Visibility { hidden: true }, t0)
                .is_none()
        );
    }

    #[test]
    fn signals_deserialize_from_json_lines() {
        let signal: PlatformSignal =
            serde_json::from_str(r#"{"signal":"visibility","hidden":true}"#).unwrap();
        assert_eq!(signal, PlatformSignal::Visibility { hidden: true });
        let signal: PlatformSignal = serde_json::from_str(r#"{"signal":"context_menu"}"#).unwrap();
        assert_eq!(signal.class(), SignalClass::Clipboard);
    }
}
