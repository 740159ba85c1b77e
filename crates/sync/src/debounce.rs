use preamp_core::{Command, SyncConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Continuous controls that are rate-limited while the user drags them
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Control {
    Volume,
    Balance,
    Brightness,
}

impl Control {
    pub fn command(&self, value: i32) -> Command {
        match self {
            Control::Volume => Command::SetVolume(value),
            Control::Balance => Command::SetBalance(value),
            Control::Brightness => Command::SetBrightness(value),
        }
    }
}

/// Holds the latest value per control until its debounce window closes.
///
/// Every new value restarts the control's window; only the value present when
/// the window finally closes is transmitted.
#[derive(Debug)]
pub struct DebounceScheduler {
    delays: BTreeMap<Control, Duration>,
    pending: BTreeMap<Control, i32>,
}

impl DebounceScheduler {
    pub fn new(config: &SyncConfig) -> Self {
        let delays = BTreeMap::from([
            (Control::Volume, Duration::from_millis(config.debounce_volume_ms)),
            (Control::Balance, Duration::from_millis(config.debounce_balance_ms)),
            (Control::Brightness, Duration::from_millis(config.debounce_brightness_ms)),
        ]);
        Self {
            delays,
            pending: BTreeMap::new(),
        }
    }

    /// Record a value and return when the control's window now closes
    pub fn schedule(&mut self, control: Control, value: i32, now: Instant) -> Instant {
        self.pending.insert(control, value);
        now + self.delays.get(&control).copied().unwrap_or_default()
    }

    /// Close the control's window, yielding the command to transmit
    pub fn take(&mut self, control: Control) -> Option<Command> {
        self.pending.remove(&control).map(|value| control.command(value))
    }

    pub fn pending_value(&self, control: Control) -> Option<i32> {
        self.pending.get(&control).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_value_wins() {
        let config = SyncConfig::default();
        let mut debounce = DebounceScheduler::new(&config);
        let now = Instant::now();

        debounce.schedule(Control::Volume, 10, now);
        debounce.schedule(Control::Volume, 11, now + Duration::from_millis(5));
        let due = debounce.schedule(Control::Volume, 12, now + Duration::from_millis(10));

        assert_eq!(due, now + Duration::from_millis(35));
        assert_eq!(debounce.take(Control::Volume), Some(Command::SetVolume(12)));
        assert_eq!(debounce.take(Control::Volume), None);
    }

    #[test]
    fn test_controls_are_independent() {
        let config = SyncConfig::default();
        let mut debounce = DebounceScheduler::new(&config);
        let now = Instant::now();

        debounce.schedule(Control::Volume, 20, now);
        let due = debounce.schedule(Control::Brightness, 5, now);

        assert_eq!(due, now + Duration::from_millis(40));
        assert_eq!(debounce.pending_value(Control::Volume), Some(20));
        assert_eq!(debounce.take(Control::Brightness), Some(Command::SetBrightness(5)));
        assert_eq!(debounce.pending_value(Control::Volume), Some(20));
    }
}
