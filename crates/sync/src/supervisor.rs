//! Connection lifecycle: persistent channel first, HTTP polling as fallback
//!
//! Every channel gets a fresh [`ChannelId`]; events carrying any other id are
//! from a replaced channel and are dropped before touching state.

use crate::engine::{ActiveChannel, ChannelPhase, ConnectionStatus, SyncEngine};
use crate::timers::{TimerPurpose, TimerRegistry, TimerScope};
use preamp_core::{ms, parse_line, ChannelId, PolledSnapshot, GOING_AWAY_CLOSE_CODE};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    FallbackPolling,
}

/// Prefixes of the lines the fallback endpoints return
const POLLED_LINE_PREFIXES: [&str; 3] = ["STATE ", "SELECTOR_LABELS", "AMP_STATES"];

impl SyncEngine {
    pub fn connection_state(&self) -> ConnectionState {
        match self.channel.as_ref().map(|channel| channel.phase) {
            Some(ChannelPhase::Open) => ConnectionState::Connected,
            _ if self.timers.is_armed(TimerPurpose::FallbackPoll) => {
                ConnectionState::FallbackPolling
            }
            Some(ChannelPhase::Connecting) => ConnectionState::Connecting,
            None => ConnectionState::Disconnected,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub(crate) fn channel_is_open(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.phase == ChannelPhase::Open)
    }

    fn is_current(&self, id: ChannelId) -> bool {
        self.channel.as_ref().is_some_and(|channel| channel.id == id)
    }

    /// Open the first channel and schedule the startup poll
    pub fn start(&mut self, now: Instant) {
        info!("Starting sync engine");
        self.connect();
        self.timers.arm(
            TimerPurpose::StartupPoll,
            now + ms(self.config.startup_poll_delay_ms),
        );
    }

    /// Open a new channel unless one is already connecting or open
    pub fn connect(&mut self) {
        if self.channel.is_some() {
            return;
        }
        let id = self.last_channel_id.next();
        self.last_channel_id = id;
        info!("Opening channel {}", id);
        let handle = self.channels.open(id);
        self.channel = Some(ActiveChannel {
            id,
            phase: ChannelPhase::Connecting,
            handle,
        });
        self.status = ConnectionStatus::Connecting;
    }

    /// Drop the current channel, whatever its state, and open a new one
    pub fn force_reconnect(&mut self) {
        self.timers.cancel(TimerPurpose::Reconnect);
        self.timers.cancel(TimerPurpose::FallbackStart);
        self.timers.cancel(TimerPurpose::Liveness);
        if let Some(mut old) = self.channel.take() {
            debug!("Replacing channel {}", old.id);
            old.handle.close();
        }
        self.connect();
    }

    pub(crate) fn on_channel_open(&mut self, id: ChannelId, now: Instant) {
        if !self.is_current(id) {
            debug!("Ignoring open of stale channel {}", id);
            return;
        }
        if let Some(channel) = self.channel.as_mut() {
            channel.phase = ChannelPhase::Open;
        }
        info!("Channel {} connected", id);
        self.status = ConnectionStatus::Connected;
        self.last_message_at = Some(now);
        self.meta_poll_countdown = 0;
        self.suspend_close = false;

        for purpose in [
            TimerPurpose::Reconnect,
            TimerPurpose::FallbackStart,
            TimerPurpose::FallbackPoll,
            TimerPurpose::StartupPoll,
            TimerPurpose::StatePoll,
        ] {
            self.timers.cancel(purpose);
        }
        self.timers.arm(
            TimerPurpose::Liveness,
            now + ms(self.config.liveness_check_interval_ms),
        );

        self.flush_queue();
        self.request_full_sync(0, "channel open", now);
    }

    pub(crate) fn on_channel_line(&mut self, id: ChannelId, line: &str, now: Instant) {
        if !self.is_current(id) {
            trace!("Dropping line from stale channel {}", id);
            return;
        }
        let text = line.trim();
        if text.is_empty() {
            return;
        }
        self.last_message_at = Some(now);
        debug!("<- {}", text);
        match parse_line(text) {
            Some(message) => self.handle_message(message, now),
            None => trace!("Ignoring unrecognized line: {}", text),
        }
    }

    pub(crate) fn on_channel_error(&mut self, id: ChannelId) {
        if !self.is_current(id) {
            return;
        }
        warn!("Channel {} reported an error", id);
        self.timers.cancel(TimerPurpose::Liveness);
        self.status = ConnectionStatus::Error;
    }

    pub(crate) fn on_channel_closed(&mut self, id: ChannelId, code: Option<u16>, now: Instant) {
        if !self.is_current(id) {
            debug!("Ignoring close of stale channel {}", id);
            return;
        }
        self.channel = None;
        self.status = ConnectionStatus::Disconnected;
        self.timers.cancel(TimerPurpose::Liveness);

        let intentional = self.suspend_close || !self.visible;
        let channel_only = code == Some(GOING_AWAY_CLOSE_CODE);
        info!(
            "Channel {} closed (code {:?}, intentional: {})",
            id, code, intentional
        );

        if !intentional && !channel_only {
            self.timers.arm_if_idle(
                TimerPurpose::FallbackStart,
                now + ms(self.config.fallback_grace_ms),
            );
        }
        if !intentional {
            self.timers.arm_if_idle(
                TimerPurpose::Reconnect,
                now + ms(self.config.reconnect_delay_ms),
            );
        }
        self.suspend_close = false;
    }

    /// A channel still connecting when the grace period ends does not hold off polling
    pub(crate) fn on_fallback_grace_elapsed(&mut self, now: Instant) {
        if self.channel_is_open() || !self.visible {
            return;
        }
        info!("Channel still down, starting fallback polling");
        self.poll_state();
        self.timers.arm_if_idle(
            TimerPurpose::FallbackPoll,
            now + ms(self.config.fallback_poll_interval_ms),
        );
    }

    /// One fallback poll; metadata is included on every Nth poll
    pub(crate) fn poll_state(&mut self) {
        if self.channel_is_open() || !self.visible || self.poll_in_flight {
            return;
        }
        let include_meta = self.meta_poll_countdown == 0;
        self.meta_poll_countdown = if include_meta {
            self.config.fallback_meta_poll_every.max(1) - 1
        } else {
            self.meta_poll_countdown - 1
        };
        self.poll_in_flight = true;
        trace!("Polling bridge over HTTP (metadata: {})", include_meta);
        self.fallback.fetch_snapshot(include_meta);
    }

    pub(crate) fn on_poll_completed(&mut self, snapshot: Option<PolledSnapshot>, now: Instant) {
        self.poll_in_flight = false;
        let Some(snapshot) = snapshot else {
            debug!("Fallback poll failed");
            return;
        };

        for body in [&snapshot.state, &snapshot.labels, &snapshot.amp_states]
            .into_iter()
            .flatten()
        {
            for line in body.lines().map(str::trim) {
                if !POLLED_LINE_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
                    continue;
                }
                if let Some(message) = parse_line(line) {
                    self.handle_message(message, now);
                }
            }
        }
        if let Some(tubes) = snapshot.tubes.as_deref() {
            if !tubes.trim().is_empty() {
                self.on_tubes_text(tubes, now);
            }
        }
    }

    pub(crate) fn on_command_posted(&mut self, line: String, delivered: bool, now: Instant) {
        if delivered {
            self.timers.arm(
                TimerPurpose::StatePoll,
                now + ms(self.config.post_command_poll_delay_ms),
            );
            return;
        }
        warn!("HTTP post of '{}' failed, queueing for the channel", line);
        self.queue.enqueue(&line);
        self.connect();
    }

    /// Idle past the first threshold: refresh state. Past the second: replace the channel.
    pub(crate) fn check_liveness(&mut self, now: Instant) {
        if !self.channel_is_open() {
            return;
        }
        let idle = self
            .last_message_at
            .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));

        if idle >= ms(self.config.liveness_reconnect_idle_ms) {
            warn!("Channel silent for {:?}, reconnecting", idle);
            self.force_reconnect();
            return;
        }
        if idle >= ms(self.config.liveness_refresh_idle_ms) {
            self.request_state_only("idle channel", now);
        }
        self.timers.arm(
            TimerPurpose::Liveness,
            now + ms(self.config.liveness_check_interval_ms),
        );
    }

    /// Foregrounding never trusts the existing channel; forced reconnects are rate-limited
    fn sync_on_resume(&mut self, now: Instant) {
        if !self.visible {
            return;
        }
        let min_interval = ms(self.config.resume_reconnect_min_interval_ms);
        if let Some(last) = self.last_resume_kick {
            if now.saturating_duration_since(last) < min_interval {
                debug!("Resume reconnect suppressed");
                return;
            }
        }
        self.last_resume_kick = Some(now);
        if self.channel.is_some() {
            self.force_reconnect();
        } else {
            self.timers.cancel(TimerPurpose::Reconnect);
            self.connect();
        }
    }

    pub fn resume(&mut self, now: Instant) {
        self.visible = true;
        self.suspend_close = false;
        self.sync_on_resume(now);
    }

    pub fn set_visible(&mut self, visible: bool, now: Instant) {
        if !visible {
            debug!("Hidden, stopping polling and reconnection");
            self.visible = false;
            for purpose in [
                TimerPurpose::FallbackPoll,
                TimerPurpose::FallbackStart,
                TimerPurpose::Reconnect,
                TimerPurpose::StartupPoll,
                TimerPurpose::StatePoll,
            ] {
                self.timers.cancel(purpose);
            }
            return;
        }
        self.visible = true;
        self.suspend_close = false;
        self.sync_on_resume(now);
    }

    /// Background the client: close the channel intentionally and stop every
    /// connection timer. Intent timers keep running.
    pub fn suspend(&mut self) {
        info!("Suspending");
        self.suspend_close = true;
        self.timers.cancel_scope(TimerScope::Connection);
        if let Some(mut channel) = self.channel.take() {
            channel.handle.close();
        }
        self.status = ConnectionStatus::Disconnected;
    }

    pub fn shutdown(&mut self) {
        info!("Shutting down sync engine");
        self.suspend_close = true;
        self.timers = TimerRegistry::new();
        if let Some(mut channel) = self.channel.take() {
            channel.handle.close();
        }
        self.status = ConnectionStatus::Disconnected;
    }
}
