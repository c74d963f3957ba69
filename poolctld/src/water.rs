//! Aggregates sensor samples into time-windowed means and the
//! Langelier Saturation Index. Grounded on
//! `original_source/src/models/water.py`'s `Water` class.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use poolctl_api::device::{now_in, Timestamp};
use poolctl_api::repository::collections;
use poolctl_api::Repository;

use crate::actuator::ActuatorControl;
use crate::scheduler::PeriodicTask;
use crate::sensor::Sensor;

/// A read-only snapshot handed to `Water`'s subscribers after each
/// flush.
#[derive(Clone, Debug, PartialEq)]
pub struct WaterSnapshot {
    pub temperature: Option<f64>,
    pub orp: Option<f64>,
    pub ph: Option<f64>,
    pub tds: Option<f64>,
    pub alkalinity: Option<f64>,
    pub hardness: Option<f64>,
    pub cya: Option<f64>,
    pub lsi: Option<f64>,
    pub levels: [bool; 6],
    pub valid: bool,
}

type Subscriber = Arc<dyn Fn(WaterSnapshot) + Send + Sync>;

struct WaterState {
    temperature_vector: Vec<f64>,
    orp_vector: Vec<f64>,
    ph_vector: Vec<f64>,
    tds_vector: Vec<f64>,

    temperature: Option<f64>,
    orp: Option<f64>,
    ph: Option<f64>,
    tds: Option<f64>,
    alkalinity: Option<f64>,
    hardness: Option<f64>,
    cya: Option<f64>,
    lsi: Option<f64>,

    levels: [bool; 6],
    valid: bool,
}

impl WaterState {
    fn new() -> Self {
        WaterState {
            temperature_vector: Vec::new(),
            orp_vector: Vec::new(),
            ph_vector: Vec::new(),
            tds_vector: Vec::new(),
            temperature: None,
            orp: None,
            ph: None,
            tds: None,
            alkalinity: None,
            hardness: None,
            cya: None,
            lsi: None,
            levels: [false; 6],
            valid: false,
        }
    }
}

#[derive(Serialize)]
struct WaterDataRow {
    datetime: Timestamp,
    temperature: Option<f64>,
    orp: Option<f64>,
    ph: Option<f64>,
    tds: Option<f64>,
    alkalinity: Option<f64>,
    hardness: Option<f64>,
    cya: Option<f64>,
    #[serde(rename = "LSI")]
    lsi: Option<f64>,
    levels: [bool; 6],
    valid: bool,
}

/// Langelier Saturation Index, computed exactly as `_update_LSI` does,
/// including the literal, non-strict pH-branch order that leaves the
/// middle branch unreachable for `7.55 < ph < 7.85` (`spec.md` Open
/// Question #1).
fn compute_lsi(
    temperature: Option<f64>,
    ph: Option<f64>,
    tds: Option<f64>,
    alkalinity: Option<f64>,
    hardness: Option<f64>,
    cya: Option<f64>,
) -> Option<f64> {
    let (temperature, ph, tds, alkalinity, hardness) =
        (temperature?, ph?, tds?, alkalinity?, hardness?);
    let cya = cya.unwrap_or(0.0);

    let log_tds = 11.13 + (1.0 / 3.0) * tds.log10();
    let temp_f = 1.8 * temperature + 32.0;
    let log_temp = -(1.0 / 2_000_000.0) * temp_f.powi(3) + (3.0 / 50_000.0) * temp_f.powi(2)
        + 0.0117 * temp_f
        - 0.4116;

    let factor = if ph > 7.55 {
        0.32 + 0.1 * (ph - 7.5)
    } else if ph > 7.85 {
        0.35 + 0.05 * (ph - 7.8)
    } else {
        0.12 + 0.2 * (ph - 6.5)
    };

    let carbonate_alkalinity = alkalinity - factor * cya;
    let log_ta = carbonate_alkalinity.log10();
    let log_hardness = hardness.log10() - 0.4;

    Some(ph + log_temp + log_hardness + log_ta - log_tds)
}

/// Mean sensor values, six water-level booleans, and the computed
/// LSI. `valid` tracks whether the last flush can be trusted for
/// dosing decisions (`spec.md` §3).
pub struct Water {
    tz: chrono_tz::Tz,
    repo: Arc<dyn Repository>,
    actuator: Arc<ActuatorControl>,
    state: Mutex<WaterState>,
    subscribers: Mutex<Vec<Subscriber>>,
    refresh_minutes: Mutex<u32>,
    refresh_task: Mutex<Option<PeriodicTask>>,
}

impl Water {
    pub fn new(
        tz: chrono_tz::Tz,
        repo: Arc<dyn Repository>,
        actuator: Arc<ActuatorControl>,
        refresh_minutes: u32,
    ) -> Self {
        info!("water instantiated");
        Water {
            tz,
            repo,
            actuator,
            state: Mutex::new(WaterState::new()),
            subscribers: Mutex::new(Vec::new()),
            refresh_minutes: Mutex::new(refresh_minutes),
            refresh_task: Mutex::new(None),
        }
    }

    pub fn add_cb(&self, callback: impl Fn(WaterSnapshot) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap().push(Arc::new(callback));
    }

    pub fn temperature(&self) -> Option<f64> {
        self.state.lock().unwrap().temperature
    }

    pub fn orp(&self) -> Option<f64> {
        self.state.lock().unwrap().orp
    }

    pub fn ph(&self) -> Option<f64> {
        self.state.lock().unwrap().ph
    }

    pub fn tds(&self) -> Option<f64> {
        self.state.lock().unwrap().tds
    }

    pub fn lsi(&self) -> Option<f64> {
        self.state.lock().unwrap().lsi
    }

    pub fn level(&self, index: usize) -> bool {
        self.state.lock().unwrap().levels[index]
    }

    pub fn valid(&self) -> bool {
        self.state.lock().unwrap().valid
    }

    pub fn snapshot(&self) -> WaterSnapshot {
        let s = self.state.lock().unwrap();
        WaterSnapshot {
            temperature: s.temperature,
            orp: s.orp,
            ph: s.ph,
            tds: s.tds,
            alkalinity: s.alkalinity,
            hardness: s.hardness,
            cya: s.cya,
            lsi: s.lsi,
            levels: s.levels,
            valid: s.valid,
        }
    }

    pub async fn set_alkalinity(&self, value: Option<f64>) {
        self.state.lock().unwrap().alkalinity = value;
        self.persist().await;
    }

    pub async fn set_hardness(&self, value: Option<f64>) {
        self.state.lock().unwrap().hardness = value;
        self.persist().await;
    }

    pub async fn set_cya(&self, value: Option<f64>) {
        self.state.lock().unwrap().cya = value;
        self.persist().await;
    }

    /// Restores `alkalinity`/`hardness`/`cya` (user-supplied, not
    /// re-derived from any sensor) from the most recently persisted
    /// row, matching `load_from_db`.
    pub async fn load_from_repository(&self) {
        match self.repo.find_latest(collections::WATER_DATA).await {
            Ok(Some(row)) => {
                let mut s = self.state.lock().unwrap();
                if let Some(v) = row.get("alkalinity").and_then(|v| v.as_f64()) {
                    s.alkalinity = Some(v);
                }
                if let Some(v) = row.get("hardness").and_then(|v| v.as_f64()) {
                    s.hardness = Some(v);
                }
                if let Some(v) = row.get("cya").and_then(|v| v.as_f64()) {
                    s.cya = Some(v);
                }
                if let Some(v) = row.get("LSI").and_then(|v| v.as_f64()) {
                    s.lsi = Some(v);
                }
                info!("water data loaded");
            }
            Ok(None) => info!("no stored water data, starting empty"),
            Err(e) => warn!(error = %e, "couldn't load water data, starting empty"),
        }
    }

    /// Subscribes to a temperature/ORP/pH/TDS sensor: every valid
    /// sample is appended to that quantity's rolling vector, to be
    /// flushed into a mean on the next periodic tick. Synchronous --
    /// no persistence happens here.
    pub fn wire_temperature_sensor(self: &Arc<Self>, sensor: &Sensor) {
        let this = self.clone();
        sensor.add_callback(move |snapshot| {
            if let Some(v) = snapshot.value.and_then(|v| v.as_f64()).filter(|_| snapshot.is_ok) {
                this.state.lock().unwrap().temperature_vector.push(v);
            }
        });
    }

    pub fn wire_orp_sensor(self: &Arc<Self>, sensor: &Sensor) {
        let this = self.clone();
        sensor.add_callback(move |snapshot| {
            if let Some(v) = snapshot.value.and_then(|v| v.as_f64()).filter(|_| snapshot.is_ok) {
                this.state.lock().unwrap().orp_vector.push(v);
            }
        });
    }

    pub fn wire_ph_sensor(self: &Arc<Self>, sensor: &Sensor) {
        let this = self.clone();
        sensor.add_callback(move |snapshot| {
            if let Some(v) = snapshot.value.and_then(|v| v.as_f64()).filter(|_| snapshot.is_ok) {
                this.state.lock().unwrap().ph_vector.push(v);
            }
        });
    }

    pub fn wire_tds_sensor(self: &Arc<Self>, sensor: &Sensor) {
        let this = self.clone();
        sensor.add_callback(move |snapshot| {
            if let Some(v) = snapshot.value.and_then(|v| v.as_f64()).filter(|_| snapshot.is_ok) {
                this.state.lock().unwrap().tds_vector.push(v);
            }
        });
    }

    /// Subscribes to one of the six water-level sensors. Each edge
    /// updates `levels[index]` and persists immediately, independent
    /// of the periodic flush (`spec.md` §4.8).
    pub fn wire_level_sensor(self: &Arc<Self>, index: usize, sensor: &Sensor) {
        let this = self.clone();
        sensor.add_callback(move |snapshot| {
            if let Some(value) = snapshot.value.and_then(|v| v.as_bool()) {
                let this = this.clone();
                tokio::spawn(async move {
                    this.set_level(index, value).await;
                });
            }
        });
    }

    async fn set_level(&self, index: usize, value: bool) {
        self.state.lock().unwrap().levels[index] = value;
        self.persist().await;
    }

    /// Starts the periodic aggregation task at the current refresh
    /// interval. Call once, after every sensor has been wired.
    pub fn start(self: &Arc<Self>) {
        let minutes = *self.refresh_minutes.lock().unwrap();
        self.spawn_refresh_task(minutes);
    }

    /// Cancels and reschedules the aggregation timer -- the callback
    /// registered with `PoolConfig::on_sensor_refresh_minutes_change`.
    pub fn reschedule(self: &Arc<Self>, minutes: u32) {
        *self.refresh_minutes.lock().unwrap() = minutes;
        self.spawn_refresh_task(minutes);
    }

    fn spawn_refresh_task(self: &Arc<Self>, minutes: u32) {
        let this = self.clone();
        let task = PeriodicTask::start(
            "water_refresh",
            Duration::from_secs(minutes as u64 * 60),
            move || {
                let this = this.clone();
                async move { this.flush().await }
            },
        );
        *self.refresh_task.lock().unwrap() = Some(task);
    }

    /// Flushes the rolling vectors into means, recomputes `valid` and
    /// `LSI`, persists, and fans the resulting snapshot out to
    /// subscribers.
    async fn flush(&self) {
        let snapshot = {
            let mut s = self.state.lock().unwrap();

            s.temperature = mean(&s.temperature_vector);
            s.orp = mean(&s.orp_vector);
            s.ph = mean(&s.ph_vector);
            s.tds = mean(&s.tds_vector);
            s.temperature_vector.clear();
            s.orp_vector.clear();
            s.ph_vector.clear();
            s.tds_vector.clear();

            let refresh_minutes = *self.refresh_minutes.lock().unwrap();
            s.valid = self.actuator.filter_sec_since_last_on() >= refresh_minutes as u64 * 60;

            s.lsi = compute_lsi(s.temperature, s.ph, s.tds, s.alkalinity, s.hardness, s.cya);

            WaterSnapshot {
                temperature: s.temperature,
                orp: s.orp,
                ph: s.ph,
                tds: s.tds,
                alkalinity: s.alkalinity,
                hardness: s.hardness,
                cya: s.cya,
                lsi: s.lsi,
                levels: s.levels,
                valid: s.valid,
            }
        };

        self.persist().await;

        let subscribers = self.subscribers.lock().unwrap().clone();
        for cb in subscribers {
            cb(snapshot.clone());
        }
    }

    async fn persist(&self) {
        let row = {
            let s = self.state.lock().unwrap();
            WaterDataRow {
                datetime: now_in(self.tz),
                temperature: s.temperature,
                orp: s.orp,
                ph: s.ph,
                tds: s.tds,
                alkalinity: s.alkalinity,
                hardness: s.hardness,
                cya: s.cya,
                lsi: s.lsi,
                levels: s.levels,
                valid: s.valid,
            }
        };
        let Ok(row) = serde_json::to_value(&row) else {
            return;
        };
        if let Err(e) = self.repo.insert(collections::WATER_DATA, row).await {
            warn!(error = %e, "couldn't persist water data");
        }
    }
}

#[cfg(test)]
impl Water {
    /// Test-only seam for other components' unit tests: stamps a
    /// reading directly instead of driving it through sensors and a
    /// full refresh cycle.
    pub fn set_orp_ph_for_test(&self, orp: Option<f64>, ph: Option<f64>) {
        let mut s = self.state.lock().unwrap();
        s.orp = orp;
        s.ph = ph;
    }

    pub fn set_valid_for_test(&self, valid: bool) {
        self.state.lock().unwrap().valid = valid;
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board_fake::FakeBoard;
    use crate::chemical_tank::ChemicalTank;
    use crate::repository::MemoryRepository;
    use poolctl_api::device::{SensorKind, TankType, Value};

    fn harness() -> (Arc<Water>, Arc<ActuatorControl>) {
        let board = Arc::new(FakeBoard::new());
        let repo = Arc::new(MemoryRepository::new());
        let bleach = Arc::new(ChemicalTank::new(
            TankType::Bleach,
            25.0,
            chrono_tz::Europe::Madrid,
            repo.clone(),
        ));
        let acid = Arc::new(ChemicalTank::new(
            TankType::Acid,
            25.0,
            chrono_tz::Europe::Madrid,
            repo.clone(),
        ));
        let actuator = Arc::new(ActuatorControl::new(
            board,
            repo.clone(),
            chrono_tz::Europe::Madrid,
            bleach,
            acid,
        ));
        let water = Arc::new(Water::new(
            chrono_tz::Europe::Madrid,
            repo,
            actuator.clone(),
            15,
        ));
        (water, actuator)
    }

    fn sensor(kind: SensorKind) -> Arc<Sensor> {
        Arc::new(Sensor::new(
            kind,
            None,
            None,
            chrono_tz::Europe::Madrid,
            Arc::new(MemoryRepository::new()),
        ))
    }

    #[test]
    fn lsi_is_none_when_any_required_field_is_missing() {
        assert_eq!(compute_lsi(Some(28.0), Some(7.4), None, Some(100.0), Some(250.0), None), None);
    }

    #[test]
    fn lsi_matches_the_literal_formula() {
        let lsi = compute_lsi(
            Some(28.0),
            Some(7.4),
            Some(600.0),
            Some(100.0),
            Some(250.0),
            None,
        )
        .unwrap();
        // Regression value pinned from the formula's own arithmetic,
        // not an independent LSI reference table.
        assert!((lsi - 0.022).abs() < 0.01);
    }

    #[test]
    fn missing_cya_is_treated_as_zero() {
        let without_cya = compute_lsi(Some(28.0), Some(7.4), Some(600.0), Some(100.0), Some(250.0), None);
        let with_zero_cya =
            compute_lsi(Some(28.0), Some(7.4), Some(600.0), Some(100.0), Some(250.0), Some(0.0));
        assert_eq!(without_cya, with_zero_cya);
    }

    #[tokio::test]
    async fn only_ok_samples_are_appended_to_the_rolling_vector() {
        let (water, _) = harness();
        let temp = sensor(SensorKind::Temperature);
        water.wire_temperature_sensor(&temp);

        temp.add_value(Some(Value::Float(27.0)), false).await;
        temp.add_value(None, false).await;

        assert_eq!(water.state.lock().unwrap().temperature_vector, vec![27.0]);
    }

    #[tokio::test]
    async fn flush_computes_mean_and_clears_the_vector() {
        let (water, _) = harness();
        let temp = sensor(SensorKind::Temperature);
        water.wire_temperature_sensor(&temp);

        temp.add_value(Some(Value::Float(26.0)), false).await;
        temp.add_value(Some(Value::Float(28.0)), false).await;

        water.flush().await;

        assert_eq!(water.temperature(), Some(27.0));
        assert!(water.state.lock().unwrap().temperature_vector.is_empty());
    }

    #[tokio::test]
    async fn valid_requires_the_filter_pump_to_have_run_long_enough() {
        let (water, actuator) = harness();
        water.flush().await;
        assert!(!water.valid(), "filter pump has never run");

        actuator
            .set_state(poolctl_api::device::ActuatorId::FilterPump, true, true)
            .await
            .unwrap();
        let sensor = sensor(SensorKind::PumpCurrent);
        actuator.wire_pump_current_sensor(&sensor);
        sensor.add_value(Some(Value::Float(3.0)), false).await;
        tokio::task::yield_now().await;

        for _ in 0..(15 * 60) {
            actuator.tick().await;
        }

        water.flush().await;
        assert!(water.valid());
    }

    #[tokio::test]
    async fn level_edge_updates_the_right_index_and_persists() {
        let (water, _) = harness();
        let level_sensor = sensor(SensorKind::WaterLevel(3));
        water.wire_level_sensor(3, &level_sensor);

        level_sensor.add_value(Some(Value::Bool(true)), false).await;
        tokio::task::yield_now().await;

        assert!(water.level(3));
        assert!(!water.level(0));
    }

    #[tokio::test]
    async fn flush_invokes_subscribers_with_the_new_snapshot() {
        let (water, _) = harness();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        water.add_cb(move |snapshot| *s.lock().unwrap() = Some(snapshot));

        water.flush().await;
        assert!(seen.lock().unwrap().is_some());
    }
}
