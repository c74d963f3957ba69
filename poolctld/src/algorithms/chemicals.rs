//! Fifteen-minute dosing cycle for bleach (ORP) and acid (pH).
//! Grounded on `original_source/src/algorithms/chemicals.py`'s
//! `Chemicals`.

use std::sync::{Arc, Mutex};

use chrono::Datelike;
use serde::Serialize;
use tracing::{info, warn};

use poolctl_api::device::{now_in, ActuatorId, Timestamp};
use poolctl_api::repository::collections;
use poolctl_api::Repository;

use crate::actuator::ActuatorControl;
use crate::pool_config::PoolConfig;
use crate::water::Water;

const CYCLE_SECONDS: i64 = 15 * 60;
const CAPPED_INJECTION_SECONDS: i64 = 14 * 60;

struct State {
    cycle_sec: i64,
    orp_injected_sec: i64,
    ph_injected_sec: i64,
    total_orp_daily_sec: i64,
    total_ph_daily_sec: i64,
    day: u32,
}

#[derive(Serialize)]
struct ChemicalsAlgorithmRow {
    datetime: Timestamp,
    algorithm_cycle_seconds: i64,
    algorithm_orp_injected_seconds: i64,
    algorithm_ph_injected_seconds: i64,
    total_orp_daily_seconds: i64,
    total_ph_daily_seconds: i64,
}

/// Recomputes, every 15 minutes, how many seconds the bleach and acid
/// pumps should run this cycle, then spends that budget one second at
/// a time while the preconditions in `spec.md` §4.10 hold.
pub struct ChemicalsAlgorithm {
    tz: chrono_tz::Tz,
    repo: Arc<dyn Repository>,
    actuator: Arc<ActuatorControl>,
    config: Arc<PoolConfig>,
    water: Arc<Water>,
    state: Mutex<State>,
}

impl ChemicalsAlgorithm {
    pub fn new(
        tz: chrono_tz::Tz,
        repo: Arc<dyn Repository>,
        actuator: Arc<ActuatorControl>,
        config: Arc<PoolConfig>,
        water: Arc<Water>,
    ) -> Self {
        info!("chemicals algorithm instantiated");
        ChemicalsAlgorithm {
            tz,
            repo,
            actuator,
            config,
            water,
            state: Mutex::new(State {
                cycle_sec: CYCLE_SECONDS,
                orp_injected_sec: 0,
                ph_injected_sec: 0,
                total_orp_daily_sec: 0,
                total_ph_daily_sec: 0,
                day: now_in(tz).day(),
            }),
        }
    }

    pub fn orp_injected_seconds(&self) -> i64 {
        self.state.lock().unwrap().orp_injected_sec
    }

    pub fn ph_injected_seconds(&self) -> i64 {
        self.state.lock().unwrap().ph_injected_sec
    }

    pub async fn load_from_repository(&self) {
        let today = now_in(self.tz).day();
        match self
            .repo
            .find_latest(collections::CHEMICALS_ALGORITHM_DATA)
            .await
        {
            Ok(Some(row)) => {
                let stored_day = row
                    .get("datetime")
                    .and_then(|v| v.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| chrono::Datelike::day(&dt));

                let mut s = self.state.lock().unwrap();
                s.cycle_sec = row
                    .get("algorithm_cycle_seconds")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(CYCLE_SECONDS);
                s.orp_injected_sec = row
                    .get("algorithm_orp_injected_seconds")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                s.ph_injected_sec = row
                    .get("algorithm_ph_injected_seconds")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);

                if stored_day != Some(today) {
                    s.total_orp_daily_sec = 0;
                    s.total_ph_daily_sec = 0;
                } else {
                    s.total_orp_daily_sec = row
                        .get("total_orp_daily_seconds")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    s.total_ph_daily_sec = row
                        .get("total_ph_daily_seconds")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                }
                info!("chemicals algorithm state loaded");
            }
            Ok(None) => info!("no stored chemicals algorithm state, starting from zero"),
            Err(e) => warn!(error = %e, "couldn't load chemicals algorithm state, starting from zero"),
        }
    }

    /// Runs once a second.
    pub async fn tick(&self) {
        let today = now_in(self.tz).day();

        let preconditions = !self.actuator.in_emergency_stop()
            && self.actuator.filter_pump_real_state()
            && self.actuator.pump_automatic()
            && self.water.valid();

        if preconditions {
            let starting_new_cycle = self.state.lock().unwrap().cycle_sec >= CYCLE_SECONDS;

            if starting_new_cycle {
                self.recompute_cycle();
            } else {
                self.spend_cycle().await;
            }

            self.state.lock().unwrap().cycle_sec += 1;
            self.persist().await;
        } else {
            let bleach_on = self.actuator.teoric_state(ActuatorId::BleachPump);
            let acid_on = self.actuator.teoric_state(ActuatorId::AcidPump);
            if !self.actuator.in_emergency_stop()
                && self.actuator.pump_automatic()
                && (bleach_on || acid_on)
            {
                let _ = self.actuator.set_state(ActuatorId::BleachPump, false, true).await;
                let _ = self.actuator.set_state(ActuatorId::AcidPump, false, true).await;
            }
        }

        let mut s = self.state.lock().unwrap();
        if s.day != today {
            s.day = today;
            s.total_orp_daily_sec = 0;
            s.total_ph_daily_sec = 0;
        }
    }

    fn recompute_cycle(&self) {
        let orp_auto_disabled = self.config.pool_orp_auto_injection_disabled();
        let ph_auto_disabled = self.config.pool_ph_auto_injection_disabled();
        let orp_setpoint = self.config.pool_orp_mv_setpoint();
        let ph_setpoint = self.config.pool_ph_setpoint();

        let orp_injected = match self.water.orp() {
            Some(orp) if !orp_auto_disabled && orp < orp_setpoint => {
                let err = orp_setpoint - orp;
                if err > 150.0 {
                    CAPPED_INJECTION_SECONDS
                } else if (25.0..=150.0).contains(&err) {
                    (5.28 * err - 72.0).round() as i64
                } else {
                    60
                }
            }
            Some(_) => 0,
            None => self.state.lock().unwrap().orp_injected_sec,
        };

        let ph_injected = match self.water.ph() {
            Some(ph) if !ph_auto_disabled && ph > ph_setpoint => {
                let err = ph - ph_setpoint;
                if err > 0.4 {
                    CAPPED_INJECTION_SECONDS
                } else {
                    (1800.0 * err).round().max(0.0) as i64
                }
            }
            Some(_) => 0,
            None => self.state.lock().unwrap().ph_injected_sec,
        };

        let mut s = self.state.lock().unwrap();
        s.orp_injected_sec = orp_injected;
        s.ph_injected_sec = ph_injected;
        s.cycle_sec = -1;
    }

    async fn spend_cycle(&self) {
        let max_orp_daily = self.config.pool_max_orp_daily_seconds();
        let max_ph_daily = self.config.pool_max_ph_daily_seconds();
        let orp_auto_disabled = self.config.pool_orp_auto_injection_disabled();
        let ph_auto_disabled = self.config.pool_ph_auto_injection_disabled();

        {
            let mut s = self.state.lock().unwrap();
            if orp_auto_disabled || s.total_orp_daily_sec > max_orp_daily {
                s.orp_injected_sec = 0;
            }
            if ph_auto_disabled || s.total_ph_daily_sec > max_ph_daily {
                s.ph_injected_sec = 0;
            }
        }

        let (orp_pending, ph_pending) = {
            let s = self.state.lock().unwrap();
            (s.orp_injected_sec, s.ph_injected_sec)
        };
        let bleach_on = self.actuator.teoric_state(ActuatorId::BleachPump);
        let acid_on = self.actuator.teoric_state(ActuatorId::AcidPump);

        if orp_pending > 0 && !bleach_on {
            let _ = self.actuator.set_state(ActuatorId::BleachPump, true, true).await;
        }
        if ph_pending > 0 && !acid_on {
            let _ = self.actuator.set_state(ActuatorId::AcidPump, true, true).await;
        }
        if orp_pending <= 0 && bleach_on {
            let _ = self.actuator.set_state(ActuatorId::BleachPump, false, true).await;
        }
        if ph_pending <= 0 && acid_on {
            let _ = self.actuator.set_state(ActuatorId::AcidPump, false, true).await;
        }

        let bleach_running = self.actuator.teoric_state(ActuatorId::BleachPump);
        let acid_running = self.actuator.teoric_state(ActuatorId::AcidPump);
        let mut s = self.state.lock().unwrap();
        if bleach_running {
            s.orp_injected_sec -= 1;
            s.total_orp_daily_sec += 1;
        }
        if acid_running {
            s.ph_injected_sec -= 1;
            s.total_ph_daily_sec += 1;
        }
    }

    async fn persist(&self) {
        let row = {
            let s = self.state.lock().unwrap();
            ChemicalsAlgorithmRow {
                datetime: now_in(self.tz),
                algorithm_cycle_seconds: s.cycle_sec,
                algorithm_orp_injected_seconds: s.orp_injected_sec,
                algorithm_ph_injected_seconds: s.ph_injected_sec,
                total_orp_daily_seconds: s.total_orp_daily_sec,
                total_ph_daily_seconds: s.total_ph_daily_sec,
            }
        };
        let Ok(row) = serde_json::to_value(&row) else {
            return;
        };
        if let Err(e) = self
            .repo
            .upsert_single(collections::CHEMICALS_ALGORITHM_DATA, None, row)
            .await
        {
            warn!(error = %e, "couldn't persist chemicals algorithm state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board_fake::FakeBoard;
    use crate::chemical_tank::ChemicalTank;
    use crate::repository::MemoryRepository;
    use poolctl_api::device::{SensorKind, TankType, Value};

    async fn harness() -> (Arc<ChemicalsAlgorithm>, Arc<ActuatorControl>, Arc<Water>) {
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

        actuator
            .set_state(ActuatorId::FilterPump, true, true)
            .await
            .unwrap();
        let current = Arc::new(crate::sensor::Sensor::new(
            SensorKind::PumpCurrent,
            None,
            None,
            chrono_tz::Europe::Madrid,
            repo.clone(),
        ));
        actuator.wire_pump_current_sensor(&current);
        current.add_value(Some(Value::Float(3.2)), false).await;
        tokio::task::yield_now().await;

        let config = Arc::new(PoolConfig::new(chrono_tz::Europe::Madrid, repo.clone()));
        let water = Arc::new(Water::new(
            chrono_tz::Europe::Madrid,
            repo.clone(),
            actuator.clone(),
            15,
        ));
        // Fake a valid water reading directly; Water's own validity
        // window is exercised in `water.rs`'s tests.
        water.set_valid_for_test(true);

        let algo = Arc::new(ChemicalsAlgorithm::new(
            chrono_tz::Europe::Madrid,
            repo,
            actuator.clone(),
            config,
            water.clone(),
        ));
        (algo, actuator, water)
    }

    #[tokio::test]
    async fn orp_error_of_200_mv_caps_the_injection_at_840_seconds() {
        let (algo, actuator, water) = harness().await;
        water.set_orp_ph_for_test(Some(450.0), None);
        algo.tick().await;

        assert_eq!(algo.orp_injected_seconds(), 840 - 1);
        assert!(actuator.teoric_state(ActuatorId::BleachPump));
    }

    #[tokio::test]
    async fn bleach_pump_turns_off_once_the_budget_is_spent() {
        let (algo, actuator, water) = harness().await;
        water.set_orp_ph_for_test(Some(640.0), None);
        algo.tick().await;
        assert_eq!(algo.orp_injected_seconds(), 59);

        for _ in 0..59 {
            algo.tick().await;
        }
        assert_eq!(algo.orp_injected_seconds(), 0);
        assert!(!actuator.teoric_state(ActuatorId::BleachPump));
    }

    #[tokio::test]
    async fn preconditions_failing_stops_any_running_dosing_pump() {
        let (algo, actuator, _water) = harness().await;
        actuator
            .set_state(ActuatorId::BleachPump, true, true)
            .await
            .unwrap();
        actuator.emergency_stop(None, false).await; // no-op while not in e-stop
        actuator
            .set_state(ActuatorId::FilterPump, false, true)
            .await
            .unwrap();

        algo.tick().await;
        assert!(!actuator.teoric_state(ActuatorId::BleachPump));
    }
}
