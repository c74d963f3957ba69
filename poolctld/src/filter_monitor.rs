//! Pressure logging for a filter. Grounded on
//! `original_source/src/models/filter.py`'s `Filter`: subscribes to
//! its pressure sensor and persists the latest reading whenever one
//! arrives, independent of `algorithms::filter::FilterAlgorithm`'s
//! daily-budget bookkeeping.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use poolctl_api::device::{now_in, FilterType, Timestamp};
use poolctl_api::repository::collections;
use poolctl_api::Repository;

use crate::sensor::Sensor;

#[derive(Serialize)]
struct FilterRow {
    datetime: Timestamp,
    #[serde(rename = "type")]
    filter_type: FilterType,
    pressure: f64,
}

/// Tracks the latest pressure reading of one filter medium and
/// persists it every time the sensor reports a valid value.
pub struct Filter {
    filter_type: FilterType,
    tz: chrono_tz::Tz,
    repo: Arc<dyn Repository>,
    pressure: Mutex<Option<f64>>,
}

impl Filter {
    pub fn new(filter_type: FilterType, tz: chrono_tz::Tz, repo: Arc<dyn Repository>) -> Arc<Self> {
        info!(filter = ?filter_type, "filter instantiated");
        Arc::new(Filter {
            filter_type,
            tz,
            repo,
            pressure: Mutex::new(None),
        })
    }

    pub fn pressure(&self) -> Option<f64> {
        *self.pressure.lock().unwrap()
    }

    /// Subscribes to this filter's pressure sensor. Only valid
    /// readings (`is_ok`) update the stored pressure, matching the
    /// Python source's `if sensor.is_ok: self.pressure = sensor.value`.
    pub fn wire_pressure_sensor(self: &Arc<Self>, sensor: &Arc<Sensor>) {
        let this = self.clone();
        sensor.add_callback(move |snapshot| {
            let this = this.clone();
            if !snapshot.is_ok {
                return;
            }
            let Some(pressure) = snapshot.value.and_then(|v| v.as_f64()) else {
                return;
            };
            tokio::spawn(async move {
                this.record(pressure).await;
            });
        });
    }

    async fn record(&self, pressure: f64) {
        *self.pressure.lock().unwrap() = Some(pressure);
        self.persist(pressure).await;
    }

    async fn persist(&self, pressure: f64) {
        let row = FilterRow {
            datetime: now_in(self.tz),
            filter_type: self.filter_type,
            pressure,
        };
        let Ok(row) = serde_json::to_value(&row) else {
            return;
        };
        if let Err(e) = self.repo.insert(collections::FILTER_DATA, row).await {
            warn!(error = %e, "couldn't persist filter pressure reading");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use poolctl_api::device::{SensorKind, Value};

    fn pressure_sensor(kind: SensorKind) -> Arc<Sensor> {
        Arc::new(Sensor::new(
            kind,
            None,
            None,
            chrono_tz::Europe::Madrid,
            Arc::new(MemoryRepository::new()),
        ))
    }

    #[tokio::test]
    async fn a_valid_reading_updates_the_stored_pressure() {
        let filter = Filter::new(
            FilterType::Sand,
            chrono_tz::Europe::Madrid,
            Arc::new(MemoryRepository::new()),
        );
        let sensor = pressure_sensor(SensorKind::SandPressure);
        filter.wire_pressure_sensor(&sensor);

        sensor.add_value(Some(Value::Float(1.4)), false).await;
        tokio::task::yield_now().await;

        assert_eq!(filter.pressure(), Some(1.4));
    }

    #[tokio::test]
    async fn an_invalid_reading_is_ignored() {
        let filter = Filter::new(
            FilterType::Diatoms,
            chrono_tz::Europe::Madrid,
            Arc::new(MemoryRepository::new()),
        );
        // Bounded sensor so an out-of-range value reports `is_ok == false`.
        let sensor = Arc::new(Sensor::new(
            SensorKind::DiatomsPressure,
            Some(0.0),
            Some(2.0),
            chrono_tz::Europe::Madrid,
            Arc::new(MemoryRepository::new()),
        ));
        filter.wire_pressure_sensor(&sensor);

        sensor.add_value(Some(Value::Float(5.0)), false).await;
        tokio::task::yield_now().await;

        assert_eq!(filter.pressure(), None);
    }

    #[tokio::test]
    async fn valid_readings_are_persisted() {
        let repo = Arc::new(MemoryRepository::new());
        let filter = Filter::new(FilterType::Sand, chrono_tz::Europe::Madrid, repo.clone());
        let sensor = pressure_sensor(SensorKind::SandPressure);
        filter.wire_pressure_sensor(&sensor);

        sensor.add_value(Some(Value::Float(1.1)), false).await;
        tokio::task::yield_now().await;

        let row = repo
            .find_latest(collections::FILTER_DATA)
            .await
            .unwrap()
            .expect("a row should have been persisted");
        assert_eq!(row.get("pressure").and_then(|v| v.as_f64()), Some(1.1));
    }
}
