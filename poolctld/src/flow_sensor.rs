//! Pulse-counting flow meter. Grounded on
//! `original_source/src/sensors/subtypes/flowsensor.py`'s `FlowSensor`,
//! which subclasses the plain sensor; here composition stands in for
//! that subclassing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::warn;

use poolctl_api::device::{now_in, SensorKind, Timestamp, Value};
use poolctl_api::repository::collections;
use poolctl_api::Repository;

use crate::sensor::Sensor;

struct FlowState {
    last_tick: Instant,
    flow: f64,
    daily_volume: f64,
    day: u32,
}

/// Integrates flow pulses into a liters-per-minute rate and an m3
/// running daily total. `add_tick` is called from the board's edge
/// callback and must stay cheap; the per-second integration and
/// persistence happen on `tick`, driven by the scheduler.
pub struct FlowSensor {
    sensor: Arc<Sensor>,
    repo: Arc<dyn Repository>,
    tz: chrono_tz::Tz,
    counter: AtomicU64,
    k_factor: Mutex<f64>,
    state: Mutex<FlowState>,
}

#[derive(Serialize)]
struct FlowDataRow {
    datetime: Timestamp,
    daily_volume: f64,
}

impl FlowSensor {
    pub fn new(tz: chrono_tz::Tz, repo: Arc<dyn Repository>, k_factor: f64) -> Self {
        let sensor = Arc::new(Sensor::new(SensorKind::Flow, None, None, tz, repo.clone()));

        FlowSensor {
            sensor,
            repo,
            tz,
            counter: AtomicU64::new(0),
            k_factor: Mutex::new(k_factor),
            state: Mutex::new(FlowState {
                last_tick: Instant::now(),
                flow: 0.0,
                daily_volume: 0.0,
                day: now_in(tz).day(),
            }),
        }
    }

    /// Restores `daily_volume` from the most recently persisted row,
    /// unless that row belongs to a day that has already ended.
    pub async fn load_from_repository(&self) {
        let today = now_in(self.tz).day();

        match self.repo.find_latest(collections::FLOW_DATA).await {
            Ok(Some(row)) => {
                let stored_day = row
                    .get("datetime")
                    .and_then(|v| v.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| chrono::Datelike::day(&dt));

                if stored_day == Some(today) {
                    if let Some(v) = row.get("daily_volume").and_then(|v| v.as_f64()) {
                        self.state.lock().unwrap().daily_volume = v;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "couldn't load flow data at startup"),
        }
    }

    pub fn sensor(&self) -> &Arc<Sensor> {
        &self.sensor
    }

    /// Called from the board's pulse interrupt. Must not block.
    pub fn add_tick(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Live-updated from `PoolConfig.pool_flow_k_factor`.
    pub fn set_k_factor(&self, k_factor: f64) {
        *self.k_factor.lock().unwrap() = k_factor;
    }

    pub fn flow(&self) -> f64 {
        self.state.lock().unwrap().flow
    }

    pub fn daily_volume(&self) -> f64 {
        self.state.lock().unwrap().daily_volume
    }

    /// Runs once a second: drains the pulse counter, updates the flow
    /// rate and daily volume, persists, and handles day rollover.
    pub async fn tick(&self) {
        let pulses = self.counter.swap(0, Ordering::Relaxed) as f64;
        let k_factor = *self.k_factor.lock().unwrap();
        let now = Instant::now();
        let today = now_in(self.tz).day();

        let (flow, daily_volume, rolled_over) = {
            let mut s = self.state.lock().unwrap();
            let mut delta_t = now.duration_since(s.last_tick).as_secs_f64();
            s.last_tick = now;
            if delta_t <= 0.0 {
                delta_t = 1.0;
            }

            let frequency = pulses / delta_t;
            s.flow = (frequency / k_factor) * (1.0 / (60.0 * delta_t));
            s.daily_volume += s.flow / 1000.0;

            let rolled_over = s.day != today;
            if rolled_over {
                s.daily_volume = 0.0;
                s.day = today;
            }

            (s.flow, s.daily_volume, rolled_over)
        };

        self.sensor
            .add_value(Some(Value::Float(flow)), false)
            .await;

        if rolled_over {
            self.persist(daily_volume, true).await;
        } else if flow != 0.0 {
            self.persist(daily_volume, false).await;
        }
    }

    async fn persist(&self, daily_volume: f64, new_day: bool) {
        let row = FlowDataRow {
            datetime: now_in(self.tz),
            daily_volume,
        };
        let Ok(row) = serde_json::to_value(&row) else {
            return;
        };

        let result = if new_day {
            self.repo.insert(collections::FLOW_DATA, row).await
        } else {
            self.repo
                .upsert_single(collections::FLOW_DATA, None, row)
                .await
        };

        if let Err(e) = result {
            warn!(error = %e, "couldn't persist flow data");
        }
    }
}

#[cfg(test)]
impl FlowSensor {
    /// Test-only seam for other components' tests: stamps the running
    /// daily total directly, sidestepping `tick`'s real-wall-clock
    /// `delta_t` measurement.
    pub fn set_daily_volume_for_test(&self, value: f64) {
        self.state.lock().unwrap().daily_volume = value;
    }
}

trait DayOfMonth {
    fn day(&self) -> u32;
}

impl DayOfMonth for Timestamp {
    fn day(&self) -> u32 {
        chrono::Datelike::day(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    fn flow_sensor() -> FlowSensor {
        FlowSensor::new(
            chrono_tz::Europe::Madrid,
            Arc::new(MemoryRepository::new()),
            7.5,
        )
    }

    #[tokio::test]
    async fn ticks_with_no_pulses_report_zero_flow() {
        let fs = flow_sensor();
        fs.tick().await;
        assert_eq!(fs.flow(), 0.0);
    }

    #[tokio::test]
    async fn pulses_accumulate_into_daily_volume() {
        let fs = flow_sensor();
        for _ in 0..100 {
            fs.add_tick();
        }
        fs.tick().await;
        assert!(fs.flow() > 0.0);
        assert!(fs.daily_volume() > 0.0);
    }

    #[tokio::test]
    async fn counter_resets_after_each_tick() {
        let fs = flow_sensor();
        fs.add_tick();
        fs.add_tick();
        fs.tick().await;
        let volume_after_first = fs.daily_volume();
        fs.tick().await;
        // No new pulses were added, so flow should drop back to 0 and
        // the daily volume should stop growing.
        assert_eq!(fs.flow(), 0.0);
        assert_eq!(fs.daily_volume(), volume_after_first);
    }

    #[tokio::test]
    async fn k_factor_changes_take_effect_on_the_next_tick() {
        let fs = flow_sensor();
        fs.set_k_factor(1.0);
        for _ in 0..10 {
            fs.add_tick();
        }
        fs.tick().await;
        let high_k_flow = fs.flow();

        fs.set_k_factor(100.0);
        for _ in 0..10 {
            fs.add_tick();
        }
        fs.tick().await;
        let low_k_flow = fs.flow();

        assert!(low_k_flow < high_k_flow);
    }
}
