use serde::{Deserialize, Serialize};
use std::fmt;

/// Amplifier power state as reported in the `AMP=` field of a state line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmpPowerState {
    Startup,
    TransitionToOperate,
    TransitionToStandby,
    Operate,
    Standby,
    /// A code the client does not know about; still shown through the label table
    Unknown(u8),
}

impl AmpPowerState {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => AmpPowerState::Startup,
            1 => AmpPowerState::TransitionToOperate,
            2 => AmpPowerState::TransitionToStandby,
            3 => AmpPowerState::Operate,
            4 => AmpPowerState::Standby,
            other => AmpPowerState::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            AmpPowerState::Startup => 0,
            AmpPowerState::TransitionToOperate => 1,
            AmpPowerState::TransitionToStandby => 2,
            AmpPowerState::Operate => 3,
            AmpPowerState::Standby => 4,
            AmpPowerState::Unknown(code) => *code,
        }
    }

    /// Power state the amplifier settles in for a standby target
    /// (`true` = standby, `false` = operate)
    pub fn for_standby_target(standby: bool) -> Self {
        if standby {
            AmpPowerState::Standby
        } else {
            AmpPowerState::Operate
        }
    }

    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            AmpPowerState::TransitionToOperate | AmpPowerState::TransitionToStandby
        )
    }
}

/// A temperature report; the device sends `TEMP=NA` when the sensor has no reading
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum TemperatureReading {
    Celsius(f32),
    NotAvailable,
}

/// The fields carried by one `STATE` line. Absent keys are `None` and must
/// leave the corresponding device field untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub volume: Option<i32>,
    pub balance: Option<i32>,
    pub brightness: Option<i32>,
    pub active_input: Option<String>,
    pub muted: Option<bool>,
    pub amp_power_state: Option<AmpPowerState>,
    pub temperature: Option<TemperatureReading>,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        *self == StateUpdate::default()
    }
}

/// Latest authoritative values reported by the amplifier.
///
/// `None` means the device has not reported the field yet in this session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub volume: Option<i32>,
    pub balance: Option<i32>,
    pub brightness: Option<i32>,
    pub active_input: Option<String>,
    pub muted: Option<bool>,
    pub amp_power_state: Option<AmpPowerState>,
    pub temperature_celsius: Option<f32>,
}

impl DeviceState {
    /// Merge a state line field-by-field
    pub fn apply(&mut self, update: &StateUpdate) {
        if let Some(volume) = update.volume {
            self.volume = Some(volume);
        }
        if let Some(balance) = update.balance {
            self.balance = Some(balance);
        }
        if let Some(brightness) = update.brightness {
            self.brightness = Some(brightness);
        }
        if let Some(input) = &update.active_input {
            self.active_input = Some(input.clone());
        }
        if let Some(muted) = update.muted {
            self.muted = Some(muted);
        }
        if let Some(amp) = update.amp_power_state {
            self.amp_power_state = Some(amp);
        }
        match update.temperature {
            Some(TemperatureReading::Celsius(value)) => self.temperature_celsius = Some(value),
            Some(TemperatureReading::NotAvailable) => self.temperature_celsius = None,
            None => {}
        }
    }
}

/// Maintenance record for one tube socket, keyed by `num`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubeRecord {
    pub num: u32,
    pub active: bool,
    pub age_hours: u32,
    pub age_minutes: u32,
}

impl TubeRecord {
    pub fn active_flag(&self) -> char {
        if self.active {
            'Y'
        } else {
            'N'
        }
    }
}

impl fmt::Display for TubeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {}h {}m",
            self.num,
            self.active_flag(),
            self.age_hours,
            self.age_minutes
        )
    }
}

/// Normalize the many spellings of an active flag (`yes`, `y`, `1`, any case)
pub fn parse_active_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "yes" | "y" | "1")
}
