//! Line codec for the preamp bridge protocol
//!
//! Inbound lines are recognized by their leading token and turned into
//! [`InboundMessage`] values; outbound [`Command`]s render to the exact text
//! the bridge expects. Parsing is forgiving: unknown keys are skipped and
//! numeric fields take the first integer found in the value. A required
//! numeric field without any digits rejects the whole line.

use crate::models::{parse_active_flag, AmpPowerState, StateUpdate, TemperatureReading, TubeRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// Acknowledgments emitted by the bridge while it works on a command
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ack {
    MuteStart,
    MuteDone,
    StandbyStart,
    StandbyDone,
    Tube(String),
    Add(String),
    Delete(String),
    Other(String),
}

/// A parsed inbound line
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InboundMessage {
    State(StateUpdate),
    SelectorLabels(BTreeMap<u8, String>),
    AmpStates(BTreeMap<u8, String>),
    Tube(TubeRecord),
    TubesEnd,
    Ack(Ack),
    DoneSave { num: Option<u32> },
    Error(String),
}

/// Commands understood by the bridge
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    GetState,
    GetSelectorLabels,
    GetAmpStates,
    GetTubes,
    GetTube(u32),
    SetVolume(i32),
    SetBalance(i32),
    SetBrightness(i32),
    SetInput(u8),
    SetMute(bool),
    /// `true` puts the amplifier in standby, `false` brings it to operate
    SetStandby(bool),
    SetTube(TubeRecord),
    AddTube(TubeRecord),
    DeleteTube(u32),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::GetState => write!(f, "GET STATE"),
            Command::GetSelectorLabels => write!(f, "GET SELECTOR_LABELS"),
            Command::GetAmpStates => write!(f, "GET AMP_STATES"),
            Command::GetTubes => write!(f, "GET TUBES"),
            Command::GetTube(num) => write!(f, "GET TUBE {}", num),
            Command::SetVolume(value) => write!(f, "SET VOL {}", value),
            Command::SetBalance(value) => write!(f, "SET BAL {}", value),
            Command::SetBrightness(value) => write!(f, "SET BRI {}", value),
            Command::SetInput(slot) => write!(f, "SET INP {}", slot),
            Command::SetMute(muted) => write!(f, "SET MUTE {}", u8::from(*muted)),
            Command::SetStandby(standby) => write!(f, "SET STBY {}", u8::from(*standby)),
            Command::SetTube(tube) => write!(
                f,
                "SET TUBE {} ACT={} HOUR={} MIN={}",
                tube.num,
                tube.active_flag(),
                tube.age_hours,
                tube.age_minutes
            ),
            Command::AddTube(tube) => write!(
                f,
                "ADD TUBE NUM={} ACT={} HOUR={} MIN={}",
                tube.num,
                tube.active_flag(),
                tube.age_hours,
                tube.age_minutes
            ),
            Command::DeleteTube(num) => write!(f, "DEL TUBE {}", num),
        }
    }
}

/// Parse one inbound line. Returns `None` for blank, unknown or malformed lines.
pub fn parse_line(line: &str) -> Option<InboundMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line.starts_with("STATE ") {
        parse_state(line).map(InboundMessage::State)
    } else if line.starts_with("SELECTOR_LABELS") {
        Some(InboundMessage::SelectorLabels(parse_selector_labels(line)))
    } else if line.starts_with("AMP_STATES") {
        Some(InboundMessage::AmpStates(parse_amp_states(line)))
    } else if line.starts_with("TUBE ") {
        parse_tube(line).map(InboundMessage::Tube)
    } else if is_tubes_terminator(line) {
        Some(InboundMessage::TubesEnd)
    } else if line.starts_with("ACK") {
        Some(InboundMessage::Ack(parse_ack(line)))
    } else if line.starts_with("DONE SAVE") {
        Some(InboundMessage::DoneSave {
            num: tube_number(&key_values(line)),
        })
    } else if line.starts_with("ERR") {
        Some(InboundMessage::Error(line.to_string()))
    } else {
        tracing::trace!("Ignoring unrecognized line: {}", line);
        None
    }
}

/// Bulk snapshot terminator; the bridge uses both spellings
pub fn is_tubes_terminator(line: &str) -> bool {
    line == "TUBES_END" || line == "END TUBES"
}

/// Parse the `TUBE` lines of a multi-line body (e.g. `/api/tubes`)
pub fn parse_tubes_text(text: &str) -> Vec<TubeRecord> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("TUBE "))
        .filter_map(parse_tube)
        .collect()
}

/// Extract the first integer substring, keeping a directly preceding minus sign
pub fn first_integer(value: &str) -> Option<i64> {
    let bytes = value.as_bytes();
    let start = bytes.iter().position(u8::is_ascii_digit)?;
    let end = bytes[start..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map_or(bytes.len(), |offset| start + offset);
    let negative = start > 0 && bytes[start - 1] == b'-';
    let magnitude: i64 = value[start..end].parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

fn first_number(value: &str) -> Option<f32> {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let re = NUMBER.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid number regex"));
    re.find(value).and_then(|m| m.as_str().parse().ok())
}

/// `KEY=VALUE` tokens after the leading token, later duplicates win
fn key_values(line: &str) -> BTreeMap<&str, &str> {
    line.split_whitespace()
        .skip(1)
        .filter_map(|token| token.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn parse_state(line: &str) -> Option<StateUpdate> {
    let fields = key_values(line);
    let mut update = StateUpdate::default();

    for (key, value) in fields {
        match key {
            "VOL" => update.volume = Some(required_i32(key, value)?),
            "BAL" => update.balance = Some(required_i32(key, value)?),
            "BRI" => update.brightness = Some(required_i32(key, value)?),
            "INP" => update.active_input = Some(value.to_string()),
            "MUTE" => update.muted = Some(required_i32(key, value)? == 1),
            "AMP" => {
                let code = u8::try_from(required_i32(key, value)?).ok()?;
                update.amp_power_state = Some(AmpPowerState::from_code(code));
            }
            "TEMP" => {
                update.temperature = if value.eq_ignore_ascii_case("NA") {
                    Some(TemperatureReading::NotAvailable)
                } else {
                    match first_number(value) {
                        Some(celsius) => Some(TemperatureReading::Celsius(celsius)),
                        None => {
                            tracing::debug!("Rejecting state line, TEMP={} has no number", value);
                            return None;
                        }
                    }
                };
            }
            _ => {}
        }
    }

    Some(update)
}

fn required_i32(key: &str, value: &str) -> Option<i32> {
    let parsed = first_integer(value).and_then(|n| i32::try_from(n).ok());
    if parsed.is_none() {
        tracing::debug!("Rejecting line, {}={} has no integer", key, value);
    }
    parsed
}

fn parse_selector_labels(line: &str) -> BTreeMap<u8, String> {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    let re = LABEL.get_or_init(|| Regex::new(r#"INP(\d+)="([^"]*)""#).expect("valid label regex"));
    re.captures_iter(line)
        .filter_map(|caps| {
            let slot = caps[1].parse::<u8>().ok()?;
            Some((slot, caps[2].to_string()))
        })
        .collect()
}

fn parse_amp_states(line: &str) -> BTreeMap<u8, String> {
    static AMP_STATE: OnceLock<Regex> = OnceLock::new();
    let re = AMP_STATE
        .get_or_init(|| Regex::new(r#"(\d+)=("([^"]*)"|[^"\s]+)"#).expect("valid amp state regex"));
    re.captures_iter(line)
        .filter_map(|caps| {
            let code = caps[1].parse::<u8>().ok()?;
            let label = caps
                .get(3)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str().to_string())?;
            Some((code, label))
        })
        .collect()
}

fn parse_tube(line: &str) -> Option<TubeRecord> {
    let fields = key_values(line);
    let num = tube_number(&fields)?;

    let lookup = |keys: &[&str]| -> u32 {
        keys.iter()
            .find_map(|key| fields.get(key))
            .and_then(|value| first_integer(value))
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };

    Some(TubeRecord {
        num,
        active: fields.get("ACT").map_or(false, |value| parse_active_flag(value)),
        age_hours: lookup(&["HOUR", "HOURS"]),
        age_minutes: lookup(&["MIN", "MINS", "MINUTE", "MINUTES"]),
    })
}

/// `NUM=` as a tube number; numbering starts at 1
fn tube_number(fields: &BTreeMap<&str, &str>) -> Option<u32> {
    fields
        .get("NUM")
        .and_then(|value| first_integer(value))
        .and_then(|n| u32::try_from(n).ok())
        .filter(|num| *num >= 1)
}

fn parse_ack(line: &str) -> Ack {
    let rest = line.trim_start_matches("ACK").trim();
    if rest.starts_with("MUTE START") {
        Ack::MuteStart
    } else if rest.starts_with("MUTE DONE") {
        Ack::MuteDone
    } else if rest.starts_with("STBY START") {
        Ack::StandbyStart
    } else if rest.starts_with("STBY DONE") {
        Ack::StandbyDone
    } else if rest.starts_with("TUBE") {
        Ack::Tube(line.to_string())
    } else if rest.starts_with("ADD") {
        Ack::Add(line.to_string())
    } else if rest.starts_with("DEL") {
        Ack::Delete(line.to_string())
    } else {
        Ack::Other(line.to_string())
    }
}
