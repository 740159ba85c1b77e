use crate::debounce::Control;
use crate::engine::{ConnectionStatus, SyncEngine};
use crate::store::InputOption;
use crate::supervisor::ConnectionState;
use crate::tubes::TubeDraft;
use preamp_core::{AmpPowerState, TubeRecord};
use serde::Serialize;

/// Everything a front end needs to render, captured after each engine step.
///
/// Continuous controls show the last user value until the device reports
/// that key again; mute shows the pending target while a mute is unconfirmed.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EngineView {
    pub connection: ConnectionState,
    pub status: ConnectionStatus,
    pub volume: Option<i32>,
    pub balance: Option<i32>,
    pub brightness: Option<i32>,
    pub active_input: Option<String>,
    pub input_options: Vec<InputOption>,
    pub muted: Option<bool>,
    pub mute_pending: bool,
    pub amp_power_state: Option<AmpPowerState>,
    pub amp_state_label: String,
    pub standby_in_flight: bool,
    pub temperature_celsius: Option<f32>,
    pub tubes: Vec<TubeRecord>,
    pub selected_tube: Option<u32>,
    pub tube_draft: TubeDraft,
    pub editor_dirty: bool,
    pub delete_armed: Option<u32>,
    pub notice: Option<String>,
    pub queued_commands: usize,
}

impl EngineView {
    pub(crate) fn capture(engine: &SyncEngine) -> Self {
        let state = engine.store.state();
        let displayed = |control: Control, reported: Option<i32>| {
            engine.overlay.get(&control).copied().or(reported)
        };
        let mute_target = engine.intents.mute_target();

        Self {
            connection: engine.connection_state(),
            status: engine.status,
            volume: displayed(Control::Volume, state.volume),
            balance: displayed(Control::Balance, state.balance),
            brightness: displayed(Control::Brightness, state.brightness),
            active_input: state.active_input.clone(),
            input_options: engine.store.input_options(),
            muted: mute_target.or(state.muted),
            mute_pending: mute_target.is_some(),
            amp_power_state: state.amp_power_state,
            amp_state_label: engine.store.amp_state_label(),
            standby_in_flight: engine.intents.standby_in_flight(),
            temperature_celsius: state.temperature_celsius,
            tubes: engine.store.tubes(),
            selected_tube: engine.tubes.selected(),
            tube_draft: *engine.tubes.draft(),
            editor_dirty: engine.tubes.is_dirty(),
            delete_armed: engine.tubes.delete_armed(),
            notice: engine.notice.clone(),
            queued_commands: engine.queue.len(),
        }
    }
}
