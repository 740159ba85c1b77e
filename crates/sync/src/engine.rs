//! The synchronization engine
//!
//! [`SyncEngine`] owns every piece of mutable client state: the active
//! channel, the outbound queue, debounce windows, pending intents, the device
//! store and the tube editor. It is driven from outside by three kinds of
//! calls, all taking the current time explicitly:
//!
//! - [`SyncEngine::handle_event`] for transport events,
//! - [`SyncEngine::apply_intent`] (or the individual operations) for user input,
//! - [`SyncEngine::fire_due_timers`] once [`SyncEngine::next_deadline`] passes.
//!
//! Nothing in here blocks or spawns; the engine is single-threaded and
//! transport-agnostic.

use crate::debounce::{Control, DebounceScheduler};
use crate::queue::CommandQueue;
use crate::reconcile::PendingIntents;
use crate::store::DeviceStore;
use crate::timers::{TimerPurpose, TimerRegistry};
use crate::tubes::{TubeDraft, TubeSync};
use crate::view::EngineView;
use preamp_core::{
    ms, Ack, ChannelFactory, ChannelId, Command, ControlChannel, EditorError, FallbackClient,
    InboundMessage, StateUpdate, SyncConfig, TransportEvent,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Something the user asked for, as delivered by a front end
#[derive(Clone, Debug, PartialEq)]
pub enum UserIntent {
    SetControl(Control, i32),
    SelectInput(u8),
    ToggleMute,
    ToggleStandby,
    RefreshAll,
    RefreshTubes,
    SelectTube(u32),
    EditTube(TubeDraft),
    LoadTube,
    SaveTube,
    AddTube,
    DeleteTube,
    SetVisible(bool),
    Suspend,
    Resume,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChannelPhase {
    Connecting,
    Open,
}

pub(crate) struct ActiveChannel {
    pub(crate) id: ChannelId,
    pub(crate) phase: ChannelPhase,
    pub(crate) handle: Box<dyn ControlChannel>,
}

/// Short status text shown next to the connection indicator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionStatus::Idle => "Idle",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Error => "Error",
        };
        f.write_str(text)
    }
}

pub struct SyncEngine {
    pub(crate) config: SyncConfig,
    pub(crate) channels: Box<dyn ChannelFactory>,
    pub(crate) fallback: Box<dyn FallbackClient>,

    pub(crate) channel: Option<ActiveChannel>,
    pub(crate) last_channel_id: ChannelId,
    pub(crate) status: ConnectionStatus,
    pub(crate) visible: bool,
    pub(crate) suspend_close: bool,
    pub(crate) last_message_at: Option<Instant>,
    pub(crate) last_resume_kick: Option<Instant>,
    pub(crate) poll_in_flight: bool,
    pub(crate) meta_poll_countdown: u32,
    pub(crate) sync_cooldown_until: Option<Instant>,

    pub(crate) timers: TimerRegistry,
    pub(crate) queue: CommandQueue,
    pub(crate) debounce: DebounceScheduler,
    /// Last user value per control until the device reports that key
    pub(crate) overlay: BTreeMap<Control, i32>,

    pub(crate) store: DeviceStore,
    pub(crate) intents: PendingIntents,
    pub(crate) tubes: TubeSync,
    pub(crate) notice: Option<String>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        channels: Box<dyn ChannelFactory>,
        fallback: Box<dyn FallbackClient>,
    ) -> Self {
        Self {
            queue: CommandQueue::new(config.queue_capacity),
            debounce: DebounceScheduler::new(&config),
            config,
            channels,
            fallback,
            channel: None,
            last_channel_id: ChannelId(0),
            status: ConnectionStatus::Idle,
            visible: true,
            suspend_close: false,
            last_message_at: None,
            last_resume_kick: None,
            poll_in_flight: false,
            meta_poll_countdown: 0,
            sync_cooldown_until: None,
            timers: TimerRegistry::new(),
            overlay: BTreeMap::new(),
            store: DeviceStore::new(),
            intents: PendingIntents::default(),
            tubes: TubeSync::default(),
            notice: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    pub fn intents(&self) -> &PendingIntents {
        &self.intents
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    pub fn queued_lines(&self) -> Vec<String> {
        self.queue.iter().map(str::to_string).collect()
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn view(&self) -> EngineView {
        EngineView::capture(self)
    }

    /// Dispatch a transport event to its handler
    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Opened(id) => self.on_channel_open(id, now),
            TransportEvent::Line(id, line) => self.on_channel_line(id, &line, now),
            TransportEvent::Error(id) => self.on_channel_error(id),
            TransportEvent::Closed { channel, code } => self.on_channel_closed(channel, code, now),
            TransportEvent::CommandPosted { line, delivered } => {
                self.on_command_posted(line, delivered, now)
            }
            TransportEvent::PollCompleted(snapshot) => self.on_poll_completed(snapshot, now),
        }
    }

    /// Dispatch a user intent. Editor validation failures are also posted as notices.
    pub fn apply_intent(&mut self, intent: UserIntent, now: Instant) -> Result<(), EditorError> {
        match intent {
            UserIntent::SetControl(control, value) => self.set_control(control, value, now),
            UserIntent::SelectInput(slot) => self.select_input(slot),
            UserIntent::ToggleMute => self.toggle_mute(now),
            UserIntent::ToggleStandby => self.toggle_standby(now),
            UserIntent::RefreshAll => self.request_full_sync(0, "refresh", now),
            UserIntent::RefreshTubes => self.refresh_tubes(now),
            UserIntent::SelectTube(num) => {
                self.select_tube(num, now);
            }
            UserIntent::EditTube(draft) => self.edit_tube(draft),
            UserIntent::LoadTube => self.load_tube(now)?,
            UserIntent::SaveTube => {
                self.save_tube(now)?;
            }
            UserIntent::AddTube => {
                self.add_tube(now)?;
            }
            UserIntent::DeleteTube => {
                self.delete_tube(now)?;
            }
            UserIntent::SetVisible(visible) => self.set_visible(visible, now),
            UserIntent::Suspend => self.suspend(),
            UserIntent::Resume => self.resume(now),
        }
        Ok(())
    }

    /// Run every timer whose deadline is at or before `now`
    pub fn fire_due_timers(&mut self, now: Instant) {
        while let Some(purpose) = self.timers.pop_expired(now) {
            trace!("Timer fired: {:?}", purpose);
            self.fire(purpose, now);
        }
    }

    fn fire(&mut self, purpose: TimerPurpose, now: Instant) {
        match purpose {
            TimerPurpose::Reconnect => self.connect(),
            TimerPurpose::FallbackStart => self.on_fallback_grace_elapsed(now),
            TimerPurpose::FallbackPoll => {
                self.poll_state();
                self.timers.arm(
                    TimerPurpose::FallbackPoll,
                    now + ms(self.config.fallback_poll_interval_ms),
                );
            }
            TimerPurpose::StatePoll => self.poll_state(),
            TimerPurpose::StartupPoll => {
                if self.visible && !self.channel_is_open() {
                    self.poll_state();
                }
            }
            TimerPurpose::Liveness => self.check_liveness(now),
            TimerPurpose::PendingSync => self.run_full_sync(now),
            TimerPurpose::Debounce(control) => {
                if let Some(command) = self.debounce.take(control) {
                    self.send_command(command);
                }
            }
            TimerPurpose::MuteRetry => self.on_mute_retry(),
            TimerPurpose::MuteInFlight => self.on_mute_in_flight_expired(),
            TimerPurpose::StandbyRetry => self.on_standby_retry(),
            TimerPurpose::StandbyInFlight => self.on_standby_in_flight_expired(),
            TimerPurpose::TubeSaveRetry => self.on_tube_save_retry(now),
            TimerPurpose::TubeSaveInFlight => self.on_tube_save_in_flight_expired(),
            TimerPurpose::TubeAddRetry => self.on_tube_add_retry(),
            TimerPurpose::TubeAddInFlight => self.on_tube_add_in_flight_expired(),
            TimerPurpose::TubeDeleteRetry => self.on_tube_delete_retry(),
            TimerPurpose::TubeDeleteInFlight => self.on_tube_delete_in_flight_expired(),
            TimerPurpose::DeleteConfirmExpiry => self.disarm_delete(),
            TimerPurpose::TubesSnapshot => self.request_tubes_snapshot(),
            TimerPurpose::ManualTubeRefresh => self.on_manual_refresh_timeout(now),
            TimerPurpose::NoticeExpiry => self.notice = None,
        }
    }

    /// Route one parsed inbound message
    pub(crate) fn handle_message(&mut self, message: InboundMessage, now: Instant) {
        match message {
            InboundMessage::State(update) => self.apply_state_update(&update),
            InboundMessage::SelectorLabels(labels) => self.store.replace_input_labels(labels),
            InboundMessage::AmpStates(labels) => self.store.replace_amp_state_labels(labels),
            InboundMessage::Tube(tube) => self.on_tube_record(tube, now),
            InboundMessage::TubesEnd => self.on_tubes_end(now),
            InboundMessage::Ack(ack) => self.on_ack(ack, now),
            InboundMessage::DoneSave { num } => self.on_done_save(num, now),
            InboundMessage::Error(line) => self.on_protocol_error(line, now),
        }
    }

    /// Merge an authoritative state line, then reconcile intents against it
    pub(crate) fn apply_state_update(&mut self, update: &StateUpdate) {
        self.store.apply_state(update);

        if update.volume.is_some() {
            self.overlay.remove(&Control::Volume);
        }
        if update.balance.is_some() {
            self.overlay.remove(&Control::Balance);
        }
        if update.brightness.is_some() {
            self.overlay.remove(&Control::Brightness);
        }
        if let Some(muted) = update.muted {
            self.reconcile_mute(muted);
        }
        if let Some(amp) = update.amp_power_state {
            self.reconcile_amp(amp);
        }
    }

    fn on_ack(&mut self, ack: Ack, now: Instant) {
        match ack {
            Ack::MuteStart | Ack::MuteDone | Ack::StandbyStart | Ack::StandbyDone => {
                debug!("Bridge ack: {:?}", ack);
            }
            Ack::Tube(line) | Ack::Add(line) => self.set_notice(line, None, now),
            Ack::Delete(line) => {
                self.set_notice(line, None, now);
                self.disarm_delete();
                self.timers.arm(
                    TimerPurpose::TubesSnapshot,
                    now + ms(self.config.delete_snapshot_delay_ms),
                );
            }
            Ack::Other(line) => debug!("Unhandled ack: {}", line),
        }
    }

    /// Send a line over the best available path.
    ///
    /// Open channel: sent directly. Channel still connecting: queued for the
    /// flush on open. No channel: posted over HTTP; a failed post is queued
    /// and triggers a connect.
    pub fn send_line(&mut self, line: &str) {
        let text = line.trim();
        if text.is_empty() {
            return;
        }

        match self.channel.as_mut() {
            Some(channel) if channel.phase == ChannelPhase::Open => {
                debug!("-> {} ({})", text, channel.id);
                if let Err(e) = channel.handle.send(text) {
                    warn!("Send on {} failed, queueing: {}", channel.id, e);
                    self.queue.enqueue(text);
                }
            }
            Some(_) => {
                debug!("Channel connecting, queueing: {}", text);
                self.queue.enqueue(text);
            }
            None => {
                debug!("-> {} (http)", text);
                self.fallback.post_command(text.to_string());
            }
        }
    }

    pub(crate) fn send_command(&mut self, command: Command) {
        self.send_line(&command.to_string());
    }

    /// Send every queued line over the open channel; failures go back in the queue
    pub(crate) fn flush_queue(&mut self) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        if channel.phase != ChannelPhase::Open || self.queue.is_empty() {
            return;
        }

        let pending = self.queue.drain();
        debug!("Flushing {} queued line(s) on {}", pending.len(), channel.id);
        for line in pending {
            if let Err(e) = channel.handle.send(&line) {
                warn!("Flush of '{}' failed: {}", line, e);
                self.queue.enqueue(&line);
            }
        }
    }

    /// Ask for state, labels, amp states and a tube snapshot.
    ///
    /// A non-zero delay defers the sync; a sync inside the cooldown of the
    /// previous one is pushed to the end of the cooldown.
    pub fn request_full_sync(&mut self, delay_ms: u64, reason: &str, now: Instant) {
        self.timers.cancel(TimerPurpose::PendingSync);
        debug!("Full sync requested ({})", reason);
        if delay_ms > 0 {
            self.timers.arm(TimerPurpose::PendingSync, now + ms(delay_ms));
            return;
        }
        self.run_full_sync(now);
    }

    pub(crate) fn run_full_sync(&mut self, now: Instant) {
        if let Some(until) = self.sync_cooldown_until {
            if now < until {
                self.timers.arm(TimerPurpose::PendingSync, until);
                return;
            }
        }
        self.sync_cooldown_until = Some(now + ms(self.config.full_sync_cooldown_ms));
        self.send_command(Command::GetState);
        self.send_command(Command::GetSelectorLabels);
        self.send_command(Command::GetAmpStates);
        self.request_tubes_snapshot();
    }

    /// Lightweight `GET STATE`, dropped while a sync cooldown is running
    pub fn request_state_only(&mut self, reason: &str, now: Instant) {
        if let Some(until) = self.sync_cooldown_until {
            if now < until {
                return;
            }
        }
        debug!("State refresh requested ({})", reason);
        self.sync_cooldown_until = Some(now + ms(self.config.state_sync_cooldown_ms));
        self.send_command(Command::GetState);
    }

    /// Volume, balance or brightness input; transmitted when the debounce window closes
    pub fn set_control(&mut self, control: Control, value: i32, now: Instant) {
        self.overlay.insert(control, value);
        let due = self.debounce.schedule(control, value, now);
        self.timers.arm(TimerPurpose::Debounce(control), due);
    }

    pub fn select_input(&mut self, slot: u8) {
        self.send_command(Command::SetInput(slot));
    }

    /// Show a transient message; with `clear_after_ms` it disappears on its own
    pub(crate) fn set_notice(&mut self, text: String, clear_after_ms: Option<u64>, now: Instant) {
        self.notice = Some(text);
        match clear_after_ms {
            Some(after) => self.timers.arm(TimerPurpose::NoticeExpiry, now + ms(after)),
            None => {
                self.timers.cancel(TimerPurpose::NoticeExpiry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use preamp_core::{PolledSnapshot, TransportError};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Wire {
        sent: Vec<String>,
        posted: Vec<String>,
    }

    struct FakeChannel {
        id: ChannelId,
        wire: Arc<Mutex<Wire>>,
    }

    impl ControlChannel for FakeChannel {
        fn id(&self) -> ChannelId {
            self.id
        }

        fn send(&mut self, line: &str) -> Result<(), TransportError> {
            self.wire.lock().unwrap().sent.push(line.to_string());
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct FakeFactory(Arc<Mutex<Wire>>);

    impl ChannelFactory for FakeFactory {
        fn open(&mut self, id: ChannelId) -> Box<dyn ControlChannel> {
            Box::new(FakeChannel {
                id,
                wire: self.0.clone(),
            })
        }
    }

    struct FakeFallback(Arc<Mutex<Wire>>);

    impl FallbackClient for FakeFallback {
        fn post_command(&mut self, line: String) {
            self.0.lock().unwrap().posted.push(line);
        }

        fn fetch_snapshot(&mut self, _include_meta: bool) {}
    }

    fn engine() -> (SyncEngine, Arc<Mutex<Wire>>) {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let engine = SyncEngine::new(
            SyncConfig::default(),
            Box::new(FakeFactory(wire.clone())),
            Box::new(FakeFallback(wire.clone())),
        );
        (engine, wire)
    }

    #[test]
    fn test_send_line_without_channel_posts_over_http() {
        let (mut engine, wire) = engine();
        engine.send_line("  GET STATE ");
        engine.send_line("   ");

        assert_eq!(wire.lock().unwrap().posted, vec!["GET STATE".to_string()]);
    }

    #[test]
    fn test_send_line_while_connecting_is_queued() {
        let (mut engine, wire) = engine();
        engine.connect();
        engine.send_line("SET VOL 10");
        engine.send_line("SET VOL 20");

        assert_eq!(engine.queued_lines(), vec!["SET VOL 20".to_string()]);
        assert!(wire.lock().unwrap().sent.is_empty());
    }

    #[test]
    fn test_full_sync_cooldown_defers_second_sync() {
        let (mut engine, wire) = engine();
        let now = Instant::now();
        engine.connect();
        engine.handle_event(TransportEvent::Opened(ChannelId(1)), now);
        wire.lock().unwrap().sent.clear();

        engine.request_full_sync(0, "test", now + Duration::from_millis(10));
        assert!(wire.lock().unwrap().sent.is_empty());
        assert_eq!(
            engine.timers().deadline(TimerPurpose::PendingSync),
            Some(now + Duration::from_millis(120))
        );

        engine.fire_due_timers(now + Duration::from_millis(120));
        assert_eq!(
            wire.lock().unwrap().sent,
            vec!["GET STATE", "GET SELECTOR_LABELS", "GET AMP_STATES", "GET TUBES"]
        );
    }

    #[test]
    fn test_state_only_dropped_inside_cooldown() {
        let (mut engine, wire) = engine();
        let now = Instant::now();
        engine.request_state_only("a", now);
        engine.request_state_only("b", now + Duration::from_millis(50));
        engine.request_state_only("c", now + Duration::from_millis(80));

        assert_eq!(wire.lock().unwrap().posted, vec!["GET STATE", "GET STATE"]);
    }

    #[test]
    fn test_notice_expires() {
        let (mut engine, _wire) = engine();
        let now = Instant::now();
        engine.set_notice("hello".to_string(), Some(100), now);
        engine.fire_due_timers(now + Duration::from_millis(99));
        assert_eq!(engine.notice(), Some("hello"));
        engine.fire_due_timers(now + Duration::from_millis(100));
        assert_eq!(engine.notice(), None);
    }

    #[test]
    fn test_poll_snapshot_applies_state() {
        let (mut engine, _wire) = engine();
        let now = Instant::now();
        engine.poll_in_flight = true;
        engine.handle_event(
            TransportEvent::PollCompleted(Some(PolledSnapshot {
                state: Some("STATE VOL=12 AMP=3".to_string()),
                ..Default::default()
            })),
            now,
        );

        assert_eq!(engine.store().state().volume, Some(12));
        assert!(!engine.poll_in_flight);
    }
}
