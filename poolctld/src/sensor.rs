//! A typed sensor reading with a validity window, a last-value cache,
//! and a fan-out of change subscribers. Grounded on
//! `original_source/src/sensors/sensor.py`'s `Sensor` class.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, warn};

use poolctl_api::device::{now_in, SensorKind, Timestamp, Value};
use poolctl_api::repository::collections;
use poolctl_api::Repository;

/// A read-only snapshot of a sensor, handed to subscribers and
/// accessors so they never need to hold the sensor's lock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorSnapshot {
    pub kind: SensorKind,
    pub value: Option<Value>,
    pub is_ok: bool,
    pub timestamp: Option<Timestamp>,
}

struct SensorState {
    value: Option<Value>,
    is_ok: bool,
    timestamp: Option<Timestamp>,
    previous_value: Option<Value>,
    previous_is_ok: bool,
    previous_timestamp: Option<Timestamp>,
}

impl SensorState {
    fn new() -> Self {
        SensorState {
            value: None,
            is_ok: false,
            timestamp: None,
            previous_value: None,
            previous_is_ok: false,
            previous_timestamp: None,
        }
    }
}

type Subscriber = Arc<dyn Fn(SensorSnapshot) + Send + Sync>;

/// One typed sensor. Created once at startup and mutated only through
/// `add_value` for the rest of the process's life (`spec.md` §3).
pub struct Sensor {
    kind: SensorKind,
    min: Option<f64>,
    max: Option<f64>,
    tz: chrono_tz::Tz,
    repo: Arc<dyn Repository>,
    state: Mutex<SensorState>,
    subscribers: Mutex<Vec<Subscriber>>,
}

#[derive(Serialize)]
struct SensorDataRow {
    datetime: Timestamp,
    kind: SensorKind,
    value: Option<Value>,
    is_ok: bool,
}

impl Sensor {
    pub fn new(
        kind: SensorKind,
        min: Option<f64>,
        max: Option<f64>,
        tz: chrono_tz::Tz,
        repo: Arc<dyn Repository>,
    ) -> Self {
        Sensor {
            kind,
            min,
            max,
            tz,
            repo,
            state: Mutex::new(SensorState::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Appends a subscriber. There's no way to remove one -- per
    /// `spec.md` §4.3, subscribers live as long as the process.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(SensorSnapshot) + Send + Sync + 'static,
    {
        self.subscribers.lock().unwrap().push(Arc::new(callback));
    }

    /// `is_ok ⇔ value ∈ [min, max]`. Boolean sensors are always ok.
    fn check_value(&self, value: Option<Value>) -> bool {
        if self.kind.is_boolean() {
            return value.is_some();
        }

        match value.and_then(|v| v.as_f64()) {
            None => false,
            Some(v) => {
                let above_min = self.min.map(|min| v >= min).unwrap_or(true);
                let below_max = self.max.map(|max| v <= max).unwrap_or(true);
                above_min && below_max
            }
        }
    }

    pub fn value(&self) -> Option<Value> {
        self.state.lock().unwrap().value
    }

    pub fn is_ok(&self) -> bool {
        self.state.lock().unwrap().is_ok
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        let s = self.state.lock().unwrap();
        SensorSnapshot {
            kind: self.kind,
            value: s.value,
            is_ok: s.is_ok,
            timestamp: s.timestamp,
        }
    }

    /// Rotates previous -> current, recomputes `is_ok`, stamps the
    /// time, optionally persists, then invokes every subscriber in
    /// registration order. Subscribers run with no lock of this
    /// sensor held (`spec.md` §5).
    pub async fn add_value(&self, value: Option<Value>, save: bool) {
        let is_ok = self.check_value(value);
        let timestamp = now_in(self.tz);

        {
            let mut s = self.state.lock().unwrap();
            s.previous_value = s.value;
            s.previous_is_ok = s.is_ok;
            s.previous_timestamp = s.timestamp;
            s.value = value;
            s.is_ok = is_ok;
            s.timestamp = Some(timestamp);
        }

        debug!(kind = ?self.kind, is_ok, "sensor updated");

        if save {
            let row = SensorDataRow {
                datetime: timestamp,
                kind: self.kind,
                value,
                is_ok,
            };
            if let Ok(row) = serde_json::to_value(&row) {
                if let Err(e) = self.repo.insert(collections::SENSOR_DATA, row).await {
                    warn!(error = %e, "couldn't persist sensor reading");
                }
            }
        }

        let subscribers = self.subscribers.lock().unwrap().clone();
        let snapshot = self.snapshot();
        for cb in subscribers {
            cb(snapshot);
        }
    }

    /// The previous reading, for algorithms that care about the delta
    /// rather than the absolute value (e.g. flow pulse counting).
    pub fn previous(&self) -> (Option<Value>, bool, Option<Timestamp>) {
        let s = self.state.lock().unwrap();
        (s.previous_value, s.previous_is_ok, s.previous_timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sensor(min: Option<f64>, max: Option<f64>) -> Sensor {
        Sensor::new(
            SensorKind::Ph,
            min,
            max,
            chrono_tz::Europe::Madrid,
            Arc::new(MemoryRepository::new()),
        )
    }

    #[tokio::test]
    async fn is_ok_reflects_the_validity_window() {
        let s = sensor(Some(6.0), Some(8.0));

        s.add_value(Some(Value::Float(7.0)), false).await;
        assert!(s.is_ok());

        s.add_value(Some(Value::Float(9.0)), false).await;
        assert!(!s.is_ok());

        s.add_value(Some(Value::Float(6.0)), false).await;
        assert!(s.is_ok(), "lower bound is inclusive");

        s.add_value(Some(Value::Float(8.0)), false).await;
        assert!(s.is_ok(), "upper bound is inclusive");
    }

    #[tokio::test]
    async fn missing_value_is_never_ok() {
        let s = sensor(None, None);
        s.add_value(None, false).await;
        assert!(!s.is_ok());
    }

    #[tokio::test]
    async fn boolean_sensors_are_always_ok_once_set() {
        let s = Sensor::new(
            SensorKind::Light,
            None,
            None,
            chrono_tz::Europe::Madrid,
            Arc::new(MemoryRepository::new()),
        );
        s.add_value(Some(Value::Bool(false)), false).await;
        assert!(s.is_ok());
    }

    #[tokio::test]
    async fn subscribers_fire_in_registration_order() {
        let s = sensor(None, None);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        s.add_callback(move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        s.add_callback(move |_| o2.lock().unwrap().push(2));

        s.add_value(Some(Value::Float(1.0)), false).await;

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn subscriber_count_matches_calls() {
        let s = sensor(None, None);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        s.add_callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        s.add_value(Some(Value::Float(1.0)), false).await;
        s.add_value(Some(Value::Float(2.0)), false).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
