//! Optimistic intents and their reconciliation against authoritative reports
//!
//! Mutating actions record a [`PendingIntent`] with a single retry credit,
//! transmit immediately, and arm a short retry timer plus a longer in-flight
//! timer. Only an authoritative report equal to the target resolves an intent
//! successfully; the in-flight deadline or an `ERR` line abandons it.

use crate::engine::SyncEngine;
use crate::timers::{TimerPurpose, TimerScope};
use preamp_core::{ms, AmpPowerState, Command, TubeRecord};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A user-initiated change awaiting device confirmation
#[derive(Clone, Debug, PartialEq)]
pub struct PendingIntent<T> {
    pub target: T,
    pub retries_remaining: u8,
    pub deadline: Instant,
    pub created_at: Instant,
}

impl<T> PendingIntent<T> {
    pub fn new(target: T, now: Instant, hold: Duration) -> Self {
        Self {
            target,
            retries_remaining: 1,
            deadline: now + hold,
            created_at: now,
        }
    }

    /// Consume the retry credit; `false` once it is spent
    pub fn take_retry(&mut self) -> bool {
        if self.retries_remaining == 0 {
            return false;
        }
        self.retries_remaining -= 1;
        true
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// A pending `SET TUBE` with its grace window for stale reports
#[derive(Clone, Debug, PartialEq)]
pub struct PendingTubeSave {
    pub intent: PendingIntent<TubeRecord>,
    /// Non-matching reports for this tube are ignored until then
    pub ignore_until: Instant,
    /// Set once the bridge reported `DONE SAVE` for this tube
    pub acknowledged: bool,
}

#[derive(Debug, Default)]
pub struct PendingIntents {
    pub(crate) mute: Option<PendingIntent<bool>>,
    pub(crate) mute_in_flight: bool,
    pub(crate) standby: Option<PendingIntent<bool>>,
    pub(crate) standby_in_flight: bool,
    pub(crate) tube_save: Option<PendingTubeSave>,
    pub(crate) tube_add: Option<PendingIntent<TubeRecord>>,
    pub(crate) tube_delete: Option<PendingIntent<u32>>,
}

impl PendingIntents {
    pub fn mute_target(&self) -> Option<bool> {
        self.mute.as_ref().map(|intent| intent.target)
    }

    pub fn mute_in_flight(&self) -> bool {
        self.mute_in_flight
    }

    /// `true` when heading to standby, `false` when heading to operate
    pub fn standby_target(&self) -> Option<bool> {
        self.standby.as_ref().map(|intent| intent.target)
    }

    pub fn standby_in_flight(&self) -> bool {
        self.standby_in_flight
    }

    pub fn tube_save(&self) -> Option<&PendingTubeSave> {
        self.tube_save.as_ref()
    }

    pub fn tube_add_target(&self) -> Option<TubeRecord> {
        self.tube_add.as_ref().map(|intent| intent.target)
    }

    pub fn tube_delete_target(&self) -> Option<u32> {
        self.tube_delete.as_ref().map(|intent| intent.target)
    }

    pub fn is_empty(&self) -> bool {
        self.mute.is_none()
            && self.standby.is_none()
            && self.tube_save.is_none()
            && self.tube_add.is_none()
            && self.tube_delete.is_none()
    }
}

impl SyncEngine {
    pub fn toggle_mute(&mut self, now: Instant) {
        let target = !self.store.state().muted.unwrap_or(false);
        self.send_mute_command(target, now);
    }

    pub fn send_mute_command(&mut self, target: bool, now: Instant) {
        let hold = ms(self.config.mute_in_flight_ms);
        self.intents.mute = Some(PendingIntent::new(target, now, hold));
        self.intents.mute_in_flight = true;
        self.send_command(Command::SetMute(target));
        self.timers
            .arm(TimerPurpose::MuteRetry, now + ms(self.config.mute_retry_ms));
        self.timers.arm(TimerPurpose::MuteInFlight, now + hold);
    }

    pub(crate) fn on_mute_retry(&mut self) {
        let confirmed = self.store.state().muted;
        let Some(intent) = self.intents.mute.as_mut() else {
            return;
        };
        if confirmed == Some(intent.target) {
            self.clear_mute_intent();
            return;
        }
        if intent.take_retry() {
            let target = intent.target;
            debug!("Mute not confirmed, resending SET MUTE {}", u8::from(target));
            self.send_command(Command::SetMute(target));
        }
    }

    pub(crate) fn on_mute_in_flight_expired(&mut self) {
        if self.intents.mute.is_some() {
            debug!("Mute intent abandoned without confirmation");
        }
        self.clear_mute_intent();
    }

    /// Any authoritative `MUTE` report ends in-flight status; a match resolves the intent
    pub(crate) fn reconcile_mute(&mut self, muted: bool) {
        self.intents.mute_in_flight = false;
        if self.intents.mute_target() == Some(muted) {
            self.clear_mute_intent();
        }
    }

    fn clear_mute_intent(&mut self) {
        self.intents.mute = None;
        self.intents.mute_in_flight = false;
        self.timers.cancel(TimerPurpose::MuteRetry);
        self.timers.cancel(TimerPurpose::MuteInFlight);
    }

    /// Flip between standby and operate. Ignored while a transition is in
    /// flight; from any other power state only the state is re-read.
    pub fn toggle_standby(&mut self, now: Instant) {
        if self.intents.standby_in_flight {
            debug!("Standby change already in flight, ignoring toggle");
            return;
        }
        match self.store.amp_power_state() {
            Some(AmpPowerState::Standby) => self.send_standby_command(false, now),
            Some(AmpPowerState::Operate) => self.send_standby_command(true, now),
            _ => self.send_command(Command::GetState),
        }
    }

    /// `standby = true` puts the amplifier in standby, `false` brings it to operate
    pub fn send_standby_command(&mut self, standby: bool, now: Instant) {
        let hold = ms(self.config.standby_in_flight_ms);
        self.intents.standby = Some(PendingIntent::new(standby, now, hold));
        self.intents.standby_in_flight = true;
        self.send_command(Command::SetStandby(standby));
        self.timers.arm(
            TimerPurpose::StandbyRetry,
            now + ms(self.config.standby_retry_ms),
        );
        self.timers.arm(TimerPurpose::StandbyInFlight, now + hold);
    }

    pub(crate) fn on_standby_retry(&mut self) {
        let current = self.store.amp_power_state();
        let Some(intent) = self.intents.standby.as_mut() else {
            return;
        };
        let expected = AmpPowerState::for_standby_target(intent.target);
        if current == Some(expected) {
            self.clear_standby_intent();
            return;
        }
        if !intent.target && current.is_some_and(|amp| amp.is_transitional()) {
            debug!("Amplifier already transitioning, skipping standby resend");
            return;
        }
        if intent.take_retry() {
            let target = intent.target;
            debug!("Standby not confirmed, resending SET STBY {}", u8::from(target));
            self.send_command(Command::SetStandby(target));
        }
    }

    pub(crate) fn on_standby_in_flight_expired(&mut self) {
        if self.intents.standby.is_some() {
            warn!("Standby intent abandoned without confirmation");
        }
        self.clear_standby_intent();
    }

    pub(crate) fn reconcile_amp(&mut self, amp: AmpPowerState) {
        match self.intents.standby_target() {
            Some(target) if AmpPowerState::for_standby_target(target) == amp => {
                self.clear_standby_intent();
            }
            Some(_) => self.intents.standby_in_flight = true,
            None => self.clear_standby_intent(),
        }
    }

    fn clear_standby_intent(&mut self) {
        self.intents.standby = None;
        self.intents.standby_in_flight = false;
        self.timers.cancel(TimerPurpose::StandbyRetry);
        self.timers.cancel(TimerPurpose::StandbyInFlight);
    }

    pub(crate) fn begin_tube_save(&mut self, record: TubeRecord, now: Instant) {
        let hold = ms(self.config.tube_in_flight_ms);
        self.intents.tube_save = Some(PendingTubeSave {
            intent: PendingIntent::new(record, now, hold),
            ignore_until: now + ms(self.config.tube_save_grace_ms),
            acknowledged: false,
        });
        self.send_command(Command::SetTube(record));
        self.timers
            .arm(TimerPurpose::TubeSaveRetry, now + ms(self.config.tube_retry_ms));
        self.timers.arm(TimerPurpose::TubeSaveInFlight, now + hold);
    }

    pub(crate) fn on_tube_save_retry(&mut self, now: Instant) {
        let grace = ms(self.config.tube_save_grace_ms);
        let Some(save) = self.intents.tube_save.as_mut() else {
            return;
        };
        let target = save.intent.target;
        if self.store.tube(target.num) == Some(&target) {
            self.clear_tube_save();
            return;
        }
        if save.acknowledged {
            return;
        }
        if save.intent.take_retry() {
            save.ignore_until = now + grace;
            debug!("Tube {} save not confirmed, resending", target.num);
            self.send_command(Command::SetTube(target));
        }
    }

    pub(crate) fn on_tube_save_in_flight_expired(&mut self) {
        self.clear_tube_save();
    }

    /// `DONE SAVE` for `num`: the save is not resent anymore and its grace window restarts
    pub(crate) fn acknowledge_tube_save(&mut self, num: u32, now: Instant) {
        let grace = ms(self.config.tube_save_grace_ms);
        if let Some(save) = self.intents.tube_save.as_mut() {
            if save.intent.target.num == num {
                save.acknowledged = true;
                save.ignore_until = now + grace;
            }
        }
    }

    fn clear_tube_save(&mut self) {
        self.intents.tube_save = None;
        self.timers.cancel(TimerPurpose::TubeSaveRetry);
        self.timers.cancel(TimerPurpose::TubeSaveInFlight);
    }

    pub(crate) fn begin_tube_add(&mut self, record: TubeRecord, now: Instant) {
        let hold = ms(self.config.tube_in_flight_ms);
        self.intents.tube_add = Some(PendingIntent::new(record, now, hold));
        self.send_command(Command::AddTube(record));
        self.timers
            .arm(TimerPurpose::TubeAddRetry, now + ms(self.config.tube_retry_ms));
        self.timers.arm(TimerPurpose::TubeAddInFlight, now + hold);
    }

    pub(crate) fn on_tube_add_retry(&mut self) {
        let Some(intent) = self.intents.tube_add.as_mut() else {
            return;
        };
        let target = intent.target;
        if self.store.has_tube(target.num) {
            self.clear_tube_add();
            return;
        }
        if intent.take_retry() {
            debug!("Tube {} add not confirmed, resending", target.num);
            self.send_command(Command::AddTube(target));
        }
    }

    pub(crate) fn on_tube_add_in_flight_expired(&mut self) {
        self.clear_tube_add();
    }

    fn clear_tube_add(&mut self) {
        self.intents.tube_add = None;
        self.timers.cancel(TimerPurpose::TubeAddRetry);
        self.timers.cancel(TimerPurpose::TubeAddInFlight);
    }

    pub(crate) fn begin_tube_delete(&mut self, num: u32, now: Instant) {
        let hold = ms(self.config.tube_in_flight_ms);
        self.intents.tube_delete = Some(PendingIntent::new(num, now, hold));
        self.send_command(Command::DeleteTube(num));
        self.timers.arm(
            TimerPurpose::TubeDeleteRetry,
            now + ms(self.config.tube_retry_ms),
        );
        self.timers.arm(TimerPurpose::TubeDeleteInFlight, now + hold);
    }

    pub(crate) fn on_tube_delete_retry(&mut self) {
        let Some(intent) = self.intents.tube_delete.as_mut() else {
            return;
        };
        let num = intent.target;
        if !self.store.has_tube(num) {
            self.clear_tube_delete();
            return;
        }
        if intent.take_retry() {
            debug!("Tube {} delete not confirmed, resending", num);
            self.send_command(Command::DeleteTube(num));
        }
    }

    pub(crate) fn on_tube_delete_in_flight_expired(&mut self) {
        self.clear_tube_delete();
    }

    fn clear_tube_delete(&mut self) {
        self.intents.tube_delete = None;
        self.timers.cancel(TimerPurpose::TubeDeleteRetry);
        self.timers.cancel(TimerPurpose::TubeDeleteInFlight);
    }

    /// Whether an inbound tube report may be applied. Reports for a tube with a
    /// pending save that do not match the saved values are dropped during the
    /// grace window.
    pub(crate) fn filter_tube_report(&self, record: &TubeRecord, now: Instant) -> bool {
        match &self.intents.tube_save {
            Some(save)
                if save.intent.target.num == record.num
                    && save.intent.target != *record
                    && now < save.ignore_until =>
            {
                debug!("Ignoring stale report for tube {} during save", record.num);
                false
            }
            _ => true,
        }
    }

    /// Resolve tube intents against the live tube store
    pub(crate) fn reconcile_tubes(&mut self) {
        if let Some(save) = &self.intents.tube_save {
            let target = save.intent.target;
            if self.store.tube(target.num) == Some(&target) {
                debug!("Tube {} save confirmed", target.num);
                self.clear_tube_save();
            }
        }
        if let Some(num) = self.intents.tube_add_target().map(|t| t.num) {
            if self.store.has_tube(num) {
                debug!("Tube {} add confirmed", num);
                self.clear_tube_add();
            }
        }
        if let Some(num) = self.intents.tube_delete_target() {
            if !self.store.has_tube(num) {
                debug!("Tube {} delete confirmed", num);
                self.clear_tube_delete();
            }
        }
    }

    /// Drop every pending intent without success
    pub(crate) fn clear_all_intents(&mut self) {
        self.intents = PendingIntents::default();
        self.timers.cancel_scope(TimerScope::Intent);
    }

    /// `ERR` abandons every intent, including an armed delete confirmation
    /// and a manual tube refresh
    pub(crate) fn on_protocol_error(&mut self, line: String, now: Instant) {
        info!("Bridge reported error: {}", line);
        self.clear_all_intents();
        self.disarm_delete();
        self.tubes.manual_refresh_pending = false;
        self.timers.cancel(TimerPurpose::ManualTubeRefresh);
        let clear_after = self.config.notice_clear_ms;
        self.set_notice(line, Some(clear_after), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_retry_credit() {
        let now = Instant::now();
        let mut intent = PendingIntent::new(true, now, Duration::from_millis(100));
        assert!(intent.take_retry());
        assert!(!intent.take_retry());
        assert_eq!(intent.retries_remaining, 0);
    }

    #[test]
    fn test_expiry() {
        let now = Instant::now();
        let intent = PendingIntent::new(7u32, now, Duration::from_millis(100));
        assert!(!intent.is_expired(now + Duration::from_millis(99)));
        assert!(intent.is_expired(now + Duration::from_millis(100)));
        assert_eq!(intent.created_at, now);
    }
}
