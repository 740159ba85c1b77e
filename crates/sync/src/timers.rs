//! Deadline registry keyed by timer purpose
//!
//! The engine never holds raw timer handles. Each purpose has at most one
//! deadline; arming a purpose replaces its previous deadline, and whole groups
//! can be cancelled at once by [`TimerScope`].

use crate::debounce::Control;
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerPurpose {
    // Connection lifecycle
    Reconnect,
    FallbackStart,
    FallbackPoll,
    StatePoll,
    StartupPoll,
    Liveness,
    PendingSync,

    // User intents awaiting device confirmation
    MuteRetry,
    MuteInFlight,
    StandbyRetry,
    StandbyInFlight,
    TubeSaveRetry,
    TubeSaveInFlight,
    TubeAddRetry,
    TubeAddInFlight,
    TubeDeleteRetry,
    TubeDeleteInFlight,

    // Presentation helpers
    Debounce(Control),
    DeleteConfirmExpiry,
    TubesSnapshot,
    ManualTubeRefresh,
    NoticeExpiry,
}

/// Groups of timers that are cancelled together
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerScope {
    /// Tied to the channel lifecycle; cancelled on backgrounding and channel replacement
    Connection,
    /// Tracks device-side confirmation; survives reconnects
    Intent,
    Interface,
}

impl TimerPurpose {
    pub fn scope(&self) -> TimerScope {
        match self {
            TimerPurpose::Reconnect
            | TimerPurpose::FallbackStart
            | TimerPurpose::FallbackPoll
            | TimerPurpose::StatePoll
            | TimerPurpose::StartupPoll
            | TimerPurpose::Liveness
            | TimerPurpose::PendingSync => TimerScope::Connection,
            TimerPurpose::MuteRetry
            | TimerPurpose::MuteInFlight
            | TimerPurpose::StandbyRetry
            | TimerPurpose::StandbyInFlight
            | TimerPurpose::TubeSaveRetry
            | TimerPurpose::TubeSaveInFlight
            | TimerPurpose::TubeAddRetry
            | TimerPurpose::TubeAddInFlight
            | TimerPurpose::TubeDeleteRetry
            | TimerPurpose::TubeDeleteInFlight => TimerScope::Intent,
            TimerPurpose::Debounce(_)
            | TimerPurpose::DeleteConfirmExpiry
            | TimerPurpose::TubesSnapshot
            | TimerPurpose::ManualTubeRefresh
            | TimerPurpose::NoticeExpiry => TimerScope::Interface,
        }
    }
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    deadlines: BTreeMap<TimerPurpose, Instant>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer
    pub fn arm(&mut self, purpose: TimerPurpose, at: Instant) {
        self.deadlines.insert(purpose, at);
    }

    /// Arm only if the purpose is not already pending. Returns whether it was armed.
    pub fn arm_if_idle(&mut self, purpose: TimerPurpose, at: Instant) -> bool {
        if self.deadlines.contains_key(&purpose) {
            return false;
        }
        self.deadlines.insert(purpose, at);
        true
    }

    pub fn cancel(&mut self, purpose: TimerPurpose) -> bool {
        self.deadlines.remove(&purpose).is_some()
    }

    pub fn cancel_scope(&mut self, scope: TimerScope) {
        self.deadlines.retain(|purpose, _| purpose.scope() != scope);
    }

    pub fn is_armed(&self, purpose: TimerPurpose) -> bool {
        self.deadlines.contains_key(&purpose)
    }

    pub fn deadline(&self, purpose: TimerPurpose) -> Option<Instant> {
        self.deadlines.get(&purpose).copied()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return the earliest timer due at `now`
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerPurpose> {
        let (purpose, _) = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .min_by_key(|(_, at)| **at)?;
        let purpose = *purpose;
        self.deadlines.remove(&purpose);
        Some(purpose)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rearm_replaces_deadline() {
        let now = Instant::now();
        let mut timers = TimerRegistry::new();
        timers.arm(TimerPurpose::Reconnect, now + Duration::from_millis(100));
        timers.arm(TimerPurpose::Reconnect, now + Duration::from_millis(300));

        assert_eq!(timers.len(), 1);
        assert_eq!(timers.pop_expired(now + Duration::from_millis(200)), None);
        assert_eq!(
            timers.pop_expired(now + Duration::from_millis(300)),
            Some(TimerPurpose::Reconnect)
        );
        assert!(timers.is_empty());
    }

    #[test]
    fn test_arm_if_idle() {
        let now = Instant::now();
        let mut timers = TimerRegistry::new();
        assert!(timers.arm_if_idle(TimerPurpose::FallbackStart, now));
        assert!(!timers.arm_if_idle(TimerPurpose::FallbackStart, now + Duration::from_secs(1)));
        assert_eq!(timers.deadline(TimerPurpose::FallbackStart), Some(now));
    }

    #[test]
    fn test_expired_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerRegistry::new();
        timers.arm(TimerPurpose::Liveness, now + Duration::from_millis(30));
        timers.arm(TimerPurpose::MuteRetry, now + Duration::from_millis(10));
        timers.arm(TimerPurpose::Debounce(Control::Volume), now + Duration::from_millis(20));

        let later = now + Duration::from_millis(50);
        assert_eq!(timers.pop_expired(later), Some(TimerPurpose::MuteRetry));
        assert_eq!(
            timers.pop_expired(later),
            Some(TimerPurpose::Debounce(Control::Volume))
        );
        assert_eq!(timers.pop_expired(later), Some(TimerPurpose::Liveness));
        assert_eq!(timers.pop_expired(later), None);
    }

    #[test]
    fn test_cancel_scope_keeps_intent_timers() {
        let now = Instant::now();
        let mut timers = TimerRegistry::new();
        timers.arm(TimerPurpose::Reconnect, now);
        timers.arm(TimerPurpose::Liveness, now);
        timers.arm(TimerPurpose::StandbyRetry, now);

        timers.cancel_scope(TimerScope::Connection);

        assert!(!timers.is_armed(TimerPurpose::Reconnect));
        assert!(!timers.is_armed(TimerPurpose::Liveness));
        assert!(timers.is_armed(TimerPurpose::StandbyRetry));
        assert_eq!(timers.next_deadline(), Some(now));
    }
}
