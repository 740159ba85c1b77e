use preamp_core::{AmpPowerState, DeviceState, StateUpdate, TubeRecord};
use serde::Serialize;
use std::collections::BTreeMap;

/// Slots shown before the bridge has sent any selector labels
const DEFAULT_INPUT_SLOTS: [u8; 4] = [1, 2, 3, 4];

/// One selectable input as presented to the user
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InputOption {
    pub slot: u8,
    pub label: String,
}

/// Authoritative device data, only ever written from parsed inbound lines
#[derive(Debug, Default)]
pub struct DeviceStore {
    state: DeviceState,
    input_labels: BTreeMap<u8, String>,
    amp_state_labels: BTreeMap<u8, String>,
    tubes: BTreeMap<u32, TubeRecord>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn apply_state(&mut self, update: &StateUpdate) {
        self.state.apply(update);
    }

    pub fn replace_input_labels(&mut self, labels: BTreeMap<u8, String>) {
        self.input_labels = labels;
    }

    pub fn replace_amp_state_labels(&mut self, labels: BTreeMap<u8, String>) {
        self.amp_state_labels = labels;
    }

    pub fn input_labels(&self) -> &BTreeMap<u8, String> {
        &self.input_labels
    }

    pub fn amp_state_labels(&self) -> &BTreeMap<u8, String> {
        &self.amp_state_labels
    }

    /// Input options ordered by slot; four default slots until labels arrive
    pub fn input_options(&self) -> Vec<InputOption> {
        if self.input_labels.is_empty() {
            return DEFAULT_INPUT_SLOTS
                .iter()
                .map(|slot| InputOption {
                    slot: *slot,
                    label: format!("Input {}", slot),
                })
                .collect();
        }

        self.input_labels
            .iter()
            .map(|(slot, label)| InputOption {
                slot: *slot,
                label: if label.is_empty() {
                    format!("Input {}", slot)
                } else {
                    label.clone()
                },
            })
            .collect()
    }

    /// Human label of the current power state: table label, else the raw code,
    /// else "Unknown" before any report
    pub fn amp_state_label(&self) -> String {
        match self.state.amp_power_state {
            None => "Unknown".to_string(),
            Some(amp) => {
                let code = amp.code();
                match self.amp_state_labels.get(&code) {
                    Some(label) if !label.is_empty() => label.clone(),
                    _ => code.to_string(),
                }
            }
        }
    }

    pub fn amp_power_state(&self) -> Option<AmpPowerState> {
        self.state.amp_power_state
    }

    pub fn tube(&self, num: u32) -> Option<&TubeRecord> {
        self.tubes.get(&num)
    }

    pub fn has_tube(&self, num: u32) -> bool {
        self.tubes.contains_key(&num)
    }

    pub fn upsert_tube(&mut self, tube: TubeRecord) {
        self.tubes.insert(tube.num, tube);
    }

    pub fn replace_tubes(&mut self, tubes: BTreeMap<u32, TubeRecord>) {
        self.tubes = tubes;
    }

    /// Tubes in ascending `num` order
    pub fn tubes(&self) -> Vec<TubeRecord> {
        self.tubes.values().copied().collect()
    }

    pub fn lowest_tube(&self) -> Option<&TubeRecord> {
        self.tubes.values().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tube(num: u32) -> TubeRecord {
        TubeRecord {
            num,
            active: true,
            age_hours: 1,
            age_minutes: 2,
        }
    }

    #[test]
    fn test_amp_state_label_fallbacks() {
        let mut store = DeviceStore::new();
        assert_eq!(store.amp_state_label(), "Unknown");

        store.apply_state(&StateUpdate {
            amp_power_state: Some(AmpPowerState::Standby),
            ..Default::default()
        });
        assert_eq!(store.amp_state_label(), "4");

        store.replace_amp_state_labels(BTreeMap::from([(4, "Standby".to_string())]));
        assert_eq!(store.amp_state_label(), "Standby");
    }

    #[test]
    fn test_input_options_default_and_sorted() {
        let mut store = DeviceStore::new();
        let defaults = store.input_options();
        assert_eq!(defaults.len(), 4);
        assert_eq!(defaults[0].label, "Input 1");

        store.replace_input_labels(BTreeMap::from([
            (3, "Tuner".to_string()),
            (1, "Phono".to_string()),
            (2, String::new()),
        ]));
        let options = store.input_options();
        let slots: Vec<u8> = options.iter().map(|o| o.slot).collect();
        assert_eq!(slots, vec![1, 2, 3]);
        assert_eq!(options[1].label, "Input 2");
    }

    #[test]
    fn test_tubes_sorted_by_number() {
        let mut store = DeviceStore::new();
        store.upsert_tube(tube(5));
        store.upsert_tube(tube(2));
        store.upsert_tube(tube(9));

        let nums: Vec<u32> = store.tubes().iter().map(|t| t.num).collect();
        assert_eq!(nums, vec![2, 5, 9]);
        assert_eq!(store.lowest_tube().map(|t| t.num), Some(2));
    }
}
