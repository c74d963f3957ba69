//! An in-memory `Board`, grounded on
//! `original_source/src/driver/fakepooldriver.py`'s `FakePoolDriver`.
//! Ships as a first-class module (`spec.md` §6 ADDED note) so both
//! unit tests and `poolctld/tests/` integration scenarios can drive
//! the control loops deterministically without real hardware.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use poolctl_api::board::{AnalogSample, EdgeCallback, EdgeSensor};
use poolctl_api::device::ActuatorId;
use poolctl_api::{Board, Result};

#[derive(Default)]
struct FakeBoardState {
    actuators: HashMap<ActuatorId, bool>,
    temperature: Option<f64>,
    analog: AnalogSample,
    edge_callbacks: HashMap<EdgeSensorKey, Vec<EdgeCallback>>,
}

/// `EdgeSensor` doesn't implement `Hash` (it carries a `u8` for
/// `WaterLevel`), so the fake keys its callback lists on this instead.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum EdgeSensorKey {
    WaterLevel(u8),
    EmergencyStop,
    Light,
    Flow,
}

impl From<EdgeSensor> for EdgeSensorKey {
    fn from(s: EdgeSensor) -> Self {
        match s {
            EdgeSensor::WaterLevel(i) => EdgeSensorKey::WaterLevel(i),
            EdgeSensor::EmergencyStop => EdgeSensorKey::EmergencyStop,
            EdgeSensor::Light => EdgeSensorKey::Light,
            EdgeSensor::Flow => EdgeSensorKey::Flow,
        }
    }
}

pub struct FakeBoard {
    state: Mutex<FakeBoardState>,
}

impl FakeBoard {
    pub fn new() -> Self {
        FakeBoard {
            state: Mutex::new(FakeBoardState::default()),
        }
    }

    pub fn actuator_state(&self, id: ActuatorId) -> bool {
        *self.state.lock().unwrap().actuators.get(&id).unwrap_or(&false)
    }

    pub fn set_temperature(&self, value: Option<f64>) {
        self.state.lock().unwrap().temperature = value;
    }

    pub fn set_analog_sample(&self, sample: AnalogSample) {
        self.state.lock().unwrap().analog = sample;
    }

    /// Test/demo helper: fires every callback registered for `sensor`
    /// with `value`, as if the corresponding GPIO pin had just
    /// changed. Held while calling -- safe because every real
    /// registered callback only spawns a task rather than blocking.
    pub fn fire_edge(&self, sensor: EdgeSensor, value: bool) {
        let state = self.state.lock().unwrap();
        if let Some(cbs) = state.edge_callbacks.get(&EdgeSensorKey::from(sensor)) {
            for cb in cbs {
                cb(value);
            }
        }
    }
}

impl Default for FakeBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Board for FakeBoard {
    async fn set_actuator(&self, id: ActuatorId, state: bool) -> Result<()> {
        self.state.lock().unwrap().actuators.insert(id, state);
        Ok(())
    }

    fn read_temperature(&self) -> Option<f64> {
        self.state.lock().unwrap().temperature
    }

    fn sample_analog(&self) -> AnalogSample {
        self.state.lock().unwrap().analog
    }

    fn register_edge_callback(&self, sensor: EdgeSensor, callback: EdgeCallback) {
        self.state
            .lock()
            .unwrap()
            .edge_callbacks
            .entry(EdgeSensorKey::from(sensor))
            .or_default()
            .push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unset_actuators_default_to_off() {
        let board = FakeBoard::new();
        assert!(!board.actuator_state(ActuatorId::FilterPump));
    }

    #[tokio::test]
    async fn set_actuator_is_observable() {
        let board = FakeBoard::new();
        board.set_actuator(ActuatorId::FillValve, true).await.unwrap();
        assert!(board.actuator_state(ActuatorId::FillValve));
    }

    #[test]
    fn registered_edge_callbacks_fire_in_order() {
        let board = FakeBoard::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        board.register_edge_callback(EdgeSensor::WaterLevel(1), Box::new(move |v| s1.lock().unwrap().push(v)));
        let s2 = seen.clone();
        board.register_edge_callback(EdgeSensor::WaterLevel(1), Box::new(move |v| s2.lock().unwrap().push(!v)));

        board.fire_edge(EdgeSensor::WaterLevel(1), true);
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn callbacks_for_different_sensors_dont_cross_fire() {
        let board = FakeBoard::new();
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        board.register_edge_callback(EdgeSensor::Light, Box::new(move |_| *s.lock().unwrap() += 1));

        board.fire_edge(EdgeSensor::EmergencyStop, true);
        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
