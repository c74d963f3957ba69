//! Fundamental types shared by every component: sensor kinds, actuator
//! ids, the tagged numeric/boolean value a sensor can hold, and the
//! timezone-aware timestamp used on every persisted row.

use serde::{Deserialize, Serialize};

/// A timestamp tagged with the installation's configured timezone.
/// Every row that goes through a `Repository` carries one of these,
/// named `datetime`.
pub type Timestamp = chrono::DateTime<chrono_tz::Tz>;

/// Returns the current instant in the given timezone.
pub fn now_in(tz: chrono_tz::Tz) -> Timestamp {
    chrono::Utc::now().with_timezone(&tz)
}

/// The value a sensor reports. Boolean sensors (water level, the
/// emergency-stop button, the light sensor) are always "ok"; numeric
/// sensors are checked against an optional `[min, max]` window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Float(f64),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Bool(_) => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

/// Every physical/logical sensor the board exposes. The six
/// water-level reed switches are distinguished by their index
/// (`0..6`), matching `pool_fill_start_level`/`pool_fill_end_level` in
/// `PoolConfig`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Ph,
    Orp,
    Tds,
    Temperature,
    SandPressure,
    DiatomsPressure,
    Voltage,
    PumpCurrent,
    GeneralCurrent,
    Light,
    EmergencyStop,
    WaterLevel(u8),
    Flow,
}

impl SensorKind {
    /// Booleans are always considered "ok"; only numeric sensors are
    /// range-checked.
    pub fn is_boolean(&self) -> bool {
        matches!(
            self,
            SensorKind::Light
                | SensorKind::EmergencyStop
                | SensorKind::WaterLevel(_)
        )
    }
}

/// The five physical actuators `ActuatorControl` gates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActuatorId {
    FilterPump,
    BleachPump,
    AcidPump,
    AuxOut,
    FillValve,
}

impl ActuatorId {
    pub const ALL: [ActuatorId; 5] = [
        ActuatorId::FilterPump,
        ActuatorId::BleachPump,
        ActuatorId::AcidPump,
        ActuatorId::AuxOut,
        ActuatorId::FillValve,
    ];

    /// True for the three actuators subject to the emergency
    /// interlock (`spec.md` §4.7: the fill valve and aux output are
    /// *not* covered).
    pub fn is_interlocked(&self) -> bool {
        matches!(
            self,
            ActuatorId::FilterPump | ActuatorId::BleachPump | ActuatorId::AcidPump
        )
    }
}

/// The reason an `ActuatorControl` is latched in emergency stop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmergencyCause {
    /// Raised automatically by the emergency-stop sensor input.
    Sensor,
    /// Raised by an explicit API call with a caller-supplied reason.
    Api(String),
}

impl std::fmt::Display for EmergencyCause {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EmergencyCause::Sensor => write!(f, "emergency stop sensor"),
            EmergencyCause::Api(reason) => write!(f, "{}", reason),
        }
    }
}

/// Which chemical a `ChemicalTank` stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TankType {
    Bleach,
    Acid,
}

/// Which filter media a `Filter` pressure log tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterType {
    Sand,
    Diatoms,
}
