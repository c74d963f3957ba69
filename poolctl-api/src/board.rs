//! The hardware driver interface. `spec.md` treats the real board
//! (serial Arduino link, ADC sampling, GPIO edges) as an external
//! collaborator; this trait is the seam. A real implementation lives
//! outside this workspace. A `FakeBoard` for tests ships in `poolctld`.

use async_trait::async_trait;

use crate::device::ActuatorId;
use crate::error::Result;

/// The edge-triggered boolean inputs the board can report on. Each of
/// these fires its registered callback from whatever thread/context
/// the board implementation uses (an interrupt handler, on real
/// hardware); callbacks must be non-blocking (`spec.md` §9).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeSensor {
    WaterLevel(u8),
    EmergencyStop,
    Light,
    /// Each edge is one flow-meter pulse; the callback's `bool`
    /// argument is unused (always `true`) for this variant.
    Flow,
}

pub type EdgeCallback = Box<dyn Fn(bool) + Send + Sync>;

/// A single sweep of the board's analog front end, already calibrated
/// into engineering units. Fields are `None` when that channel's
/// reading isn't available this cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AnalogSample {
    pub ph: Option<f64>,
    pub orp_mv: Option<f64>,
    pub tds: Option<f64>,
    pub sand_pressure: Option<f64>,
    pub diatoms_pressure: Option<f64>,
    pub voltage: Option<f64>,
    pub pump_current: Option<f64>,
    pub general_current: Option<f64>,
}

/// Behind this trait sits the real hardware: a serial link to the
/// actuator board, a one-wire temperature probe, an ADC front end, and
/// six GPIO edge inputs plus the emergency-stop button, light sensor,
/// and flow-meter pulse line.
#[async_trait]
pub trait Board: Send + Sync {
    /// Drives a physical actuator output. Async because a real board
    /// drives this over a serial link.
    async fn set_actuator(&self, id: ActuatorId, state: bool) -> Result<()>;

    /// Reads the one-wire temperature probe. `None` means the probe
    /// couldn't be read this cycle.
    fn read_temperature(&self) -> Option<f64>;

    /// Returns the latest calibrated analog sweep.
    fn sample_analog(&self) -> AnalogSample;

    /// Registers a callback to be invoked on every edge of the given
    /// input. Callbacks are append-only, matching `Sensor::add_callback`
    /// (`spec.md` §4.3) -- there's no way to deregister one.
    fn register_edge_callback(&self, sensor: EdgeSensor, callback: EdgeCallback);
}
