//! The central actuator safety gate. Grounded on
//! `original_source/src/models/actuatorcontrol.py`'s `ActuatorControl`:
//! mode flags, the emergency interlock, per-second statistics, and
//! persistence are all carried over; "class attribute" mutation in the
//! source becomes ordinary instance state here (`spec.md` §9).

use std::sync::{Arc, Mutex};

use chrono::Datelike;
use serde::Serialize;
use tracing::{info, warn};

use poolctl_api::device::{now_in, ActuatorId, EmergencyCause, Timestamp};
use poolctl_api::repository::collections;
use poolctl_api::{Board, Error, Repository, Result};

use crate::chemical_tank::ChemicalTank;

/// Liters a dosing pump drains per second it runs, per `spec.md` §6.
const TANK_SEC_DECREASE_VALUE_LITERS: f64 = 4.0 / 3600.0;

struct ActuatorState {
    pump_automatic: bool,
    valve_automatic: bool,

    filter_pump_teoric: bool,
    filter_pump_real: bool,
    bleach_pump: bool,
    acid_pump: bool,
    aux_out: bool,
    fill_valve: bool,

    in_emergency_stop: bool,
    emergency_cause: Option<EmergencyCause>,

    day: u32,

    filter_on_real_seconds: u64,
    filter_on_total_seconds: u64,
    filter_on_auto_seconds: u64,
    filter_on_manual_seconds: u64,
    filter_sec_since_last_on: u64,

    bleach_on_total_seconds: u64,
    bleach_on_auto_seconds: u64,
    bleach_on_manual_seconds: u64,
    bleach_sec_since_last_on: u64,

    acid_on_total_seconds: u64,
    acid_on_auto_seconds: u64,
    acid_on_manual_seconds: u64,
    acid_sec_since_last_on: u64,

    aux_on_total_seconds: u64,
    aux_on_auto_seconds: u64,
    aux_on_manual_seconds: u64,
    aux_sec_since_last_on: u64,

    fill_on_total_seconds: u64,
    fill_on_auto_seconds: u64,
    fill_on_manual_seconds: u64,
    fill_sec_since_last_on: u64,
}

impl ActuatorState {
    fn new(day: u32) -> Self {
        ActuatorState {
            pump_automatic: true,
            valve_automatic: true,
            filter_pump_teoric: false,
            filter_pump_real: false,
            bleach_pump: false,
            acid_pump: false,
            aux_out: false,
            fill_valve: false,
            in_emergency_stop: false,
            emergency_cause: None,
            day,
            filter_on_real_seconds: 0,
            filter_on_total_seconds: 0,
            filter_on_auto_seconds: 0,
            filter_on_manual_seconds: 0,
            filter_sec_since_last_on: 0,
            bleach_on_total_seconds: 0,
            bleach_on_auto_seconds: 0,
            bleach_on_manual_seconds: 0,
            bleach_sec_since_last_on: 0,
            acid_on_total_seconds: 0,
            acid_on_auto_seconds: 0,
            acid_on_manual_seconds: 0,
            acid_sec_since_last_on: 0,
            aux_on_total_seconds: 0,
            aux_on_auto_seconds: 0,
            aux_on_manual_seconds: 0,
            aux_sec_since_last_on: 0,
            fill_on_total_seconds: 0,
            fill_on_auto_seconds: 0,
            fill_on_manual_seconds: 0,
            fill_sec_since_last_on: 0,
        }
    }
}

pub struct ActuatorControl {
    board: Arc<dyn Board>,
    repo: Arc<dyn Repository>,
    tz: chrono_tz::Tz,
    bleach_tank: Arc<ChemicalTank>,
    acid_tank: Arc<ChemicalTank>,
    state: Mutex<ActuatorState>,
}

#[derive(Serialize)]
struct ActuatorControlRow {
    datetime: Timestamp,
    in_emergency_stop: bool,
    emergency_stop_cause: String,
    pump_automatic_control: bool,
    valve_automatic_control: bool,
    filter_pump_teoric_state: bool,
    bleach_pump_state: bool,
    acid_pump_state: bool,
    aux_out_state: bool,
    fill_valve_state: bool,
    filter_pump_on_real_seconds: u64,
    filter_pump_on_total_seconds: u64,
    filter_pump_on_auto_seconds: u64,
    filter_pump_on_manual_seconds: u64,
    bleach_pump_on_total_seconds: u64,
    bleach_pump_on_auto_seconds: u64,
    bleach_pump_on_manual_seconds: u64,
    acid_pump_on_total_seconds: u64,
    acid_pump_on_auto_seconds: u64,
    acid_pump_on_manual_seconds: u64,
    aux_out_on_total_seconds: u64,
    aux_out_on_auto_seconds: u64,
    aux_out_on_manual_seconds: u64,
    fill_valve_on_total_seconds: u64,
    fill_valve_on_auto_seconds: u64,
    fill_valve_on_manual_seconds: u64,
}

impl ActuatorControl {
    pub fn new(
        board: Arc<dyn Board>,
        repo: Arc<dyn Repository>,
        tz: chrono_tz::Tz,
        bleach_tank: Arc<ChemicalTank>,
        acid_tank: Arc<ChemicalTank>,
    ) -> Self {
        info!("actuator control instantiated");
        ActuatorControl {
            board,
            repo,
            tz,
            bleach_tank,
            acid_tank,
            state: Mutex::new(ActuatorState::new(now_in(tz).day())),
        }
    }

    pub fn teoric_state(&self, id: ActuatorId) -> bool {
        let s = self.state.lock().unwrap();
        match id {
            ActuatorId::FilterPump => s.filter_pump_teoric,
            ActuatorId::BleachPump => s.bleach_pump,
            ActuatorId::AcidPump => s.acid_pump,
            ActuatorId::AuxOut => s.aux_out,
            ActuatorId::FillValve => s.fill_valve,
        }
    }

    pub fn filter_pump_real_state(&self) -> bool {
        self.state.lock().unwrap().filter_pump_real
    }

    pub fn pump_automatic(&self) -> bool {
        self.state.lock().unwrap().pump_automatic
    }

    pub fn valve_automatic(&self) -> bool {
        self.state.lock().unwrap().valve_automatic
    }

    pub fn in_emergency_stop(&self) -> bool {
        self.state.lock().unwrap().in_emergency_stop
    }

    pub fn filter_sec_since_last_on(&self) -> u64 {
        self.state.lock().unwrap().filter_sec_since_last_on
    }

    /// Sets `pump_automatic`/`valve_automatic` back to `true` without
    /// changing any actuator's state. The only way out of manual mode
    /// (`spec.md` §4.7: "an explicit API flag write").
    pub async fn set_pump_automatic(&self, automatic: bool) {
        self.state.lock().unwrap().pump_automatic = automatic;
        self.persist().await;
    }

    pub async fn set_valve_automatic(&self, automatic: bool) {
        self.state.lock().unwrap().valve_automatic = automatic;
        self.persist().await;
    }

    /// Commands one actuator. `automatic=false` clears that
    /// actuator's group mode flag; `automatic=true` while the group is
    /// already manual is rejected with `ManualMode`.
    pub async fn set_state(&self, id: ActuatorId, state: bool, automatic: bool) -> Result<()> {
        {
            let s = self.state.lock().unwrap();
            if s.in_emergency_stop && id.is_interlocked() {
                return Err(Error::EmergencyStop);
            }
        }

        let group_automatic = match id {
            ActuatorId::FillValve => {
                let mut s = self.state.lock().unwrap();
                if !automatic {
                    s.valve_automatic = false;
                }
                s.valve_automatic
            }
            _ => {
                let mut s = self.state.lock().unwrap();
                if !automatic {
                    s.pump_automatic = false;
                }
                s.pump_automatic
            }
        };

        if !group_automatic && automatic {
            warn!(actuator = ?id, state, "automatic command rejected, actuator is under manual control");
            return Err(Error::ManualMode);
        }

        self.board.set_actuator(id, state).await?;

        {
            let mut s = self.state.lock().unwrap();
            match id {
                ActuatorId::FilterPump => s.filter_pump_teoric = state,
                ActuatorId::BleachPump => s.bleach_pump = state,
                ActuatorId::AcidPump => s.acid_pump = state,
                ActuatorId::AuxOut => s.aux_out = state,
                ActuatorId::FillValve => s.fill_valve = state,
            }
        }

        info!(
            actuator = ?id,
            state,
            mode = if automatic { "automatic" } else { "manual" },
            "actuator state changed"
        );

        self.persist().await;
        Ok(())
    }

    /// Latches or releases the emergency interlock. `cause` is
    /// ignored when `resume` is true.
    pub async fn emergency_stop(&self, cause: Option<EmergencyCause>, resume: bool) {
        let mut did_something = false;

        if !resume {
            let already = self.state.lock().unwrap().in_emergency_stop;
            if !already {
                let _ = self.board.set_actuator(ActuatorId::AcidPump, false).await;
                let _ = self.board.set_actuator(ActuatorId::BleachPump, false).await;
                let _ = self.board.set_actuator(ActuatorId::FilterPump, false).await;

                let mut s = self.state.lock().unwrap();
                s.emergency_cause = cause;
                s.in_emergency_stop = true;
                did_something = true;
                warn!("emergency stop engaged");
            }
        }

        if resume {
            let was_in_estop = self.state.lock().unwrap().in_emergency_stop;
            if was_in_estop {
                let (filter_teoric, bleach, acid) = {
                    let s = self.state.lock().unwrap();
                    (s.filter_pump_teoric, s.bleach_pump, s.acid_pump)
                };

                let _ = self
                    .board
                    .set_actuator(ActuatorId::FilterPump, filter_teoric)
                    .await;
                let _ = self
                    .board
                    .set_actuator(ActuatorId::BleachPump, bleach)
                    .await;
                let _ = self.board.set_actuator(ActuatorId::AcidPump, acid).await;

                let mut s = self.state.lock().unwrap();
                s.emergency_cause = None;
                s.in_emergency_stop = false;
                did_something = true;
                warn!("emergency stop resumed");
            }
        }

        if did_something {
            self.persist().await;
        }
    }

    /// Wires the filter pump current sensor's readings into
    /// `filter_pump_real_state` -- the only authoritative "pump is
    /// actually running" signal (`spec.md` §4.7).
    pub fn wire_pump_current_sensor(self: &Arc<Self>, sensor: &crate::sensor::Sensor) {
        let this = self.clone();
        sensor.add_callback(move |snapshot| {
            let this = this.clone();
            let current = snapshot.value.and_then(|v| v.as_f64());
            tokio::spawn(async move {
                this.update_real_state(current).await;
            });
        });
    }

    async fn update_real_state(&self, current: Option<f64>) {
        let real = current.map(|c| c > 0.0).unwrap_or(false);
        {
            let mut s = self.state.lock().unwrap();
            s.filter_pump_real = real;
        }
        self.persist().await;
    }

    /// Runs once a second: rolls `sec_since_last_on` counters, handles
    /// day rollover, and otherwise accumulates the daily on-seconds
    /// counters for every actuator (`spec.md` §4.7 step 4).
    pub async fn tick(&self) {
        let today = now_in(self.tz).day();
        let mut decrease_bleach = false;
        let mut decrease_acid = false;

        {
            let mut s = self.state.lock().unwrap();

            if !s.aux_out {
                s.aux_sec_since_last_on = 0;
            }
            if !s.fill_valve {
                s.fill_sec_since_last_on = 0;
            }

            if s.in_emergency_stop {
                s.filter_sec_since_last_on = 0;
                s.bleach_sec_since_last_on = 0;
                s.acid_sec_since_last_on = 0;
            } else {
                if !s.filter_pump_real {
                    s.filter_sec_since_last_on = 0;
                }
                if !s.bleach_pump {
                    s.bleach_sec_since_last_on = 0;
                }
                if !s.acid_pump {
                    s.acid_sec_since_last_on = 0;
                }
            }

            if s.day != today {
                s.day = today;
                s.filter_on_real_seconds = 0;
                s.filter_on_total_seconds = 0;
                s.filter_on_auto_seconds = 0;
                s.filter_on_manual_seconds = 0;
                s.bleach_on_total_seconds = 0;
                s.bleach_on_auto_seconds = 0;
                s.bleach_on_manual_seconds = 0;
                s.acid_on_total_seconds = 0;
                s.acid_on_auto_seconds = 0;
                s.acid_on_manual_seconds = 0;
                s.aux_on_total_seconds = 0;
                s.aux_on_auto_seconds = 0;
                s.aux_on_manual_seconds = 0;
                s.fill_on_total_seconds = 0;
                s.fill_on_auto_seconds = 0;
                s.fill_on_manual_seconds = 0;
            } else {
                if s.filter_pump_real {
                    s.filter_on_real_seconds += 1;
                    s.filter_sec_since_last_on += 1;
                }

                let pump_auto = s.pump_automatic;

                if s.filter_pump_teoric {
                    if pump_auto {
                        s.filter_on_auto_seconds += 1;
                    } else {
                        s.filter_on_manual_seconds += 1;
                    }
                    s.filter_on_total_seconds = s.filter_on_auto_seconds + s.filter_on_manual_seconds;
                }

                if s.bleach_pump {
                    if pump_auto {
                        s.bleach_on_auto_seconds += 1;
                    } else {
                        s.bleach_on_manual_seconds += 1;
                    }
                    s.bleach_on_total_seconds = s.bleach_on_auto_seconds + s.bleach_on_manual_seconds;
                    s.bleach_sec_since_last_on += 1;
                    decrease_bleach = true;
                }

                if s.acid_pump {
                    if pump_auto {
                        s.acid_on_auto_seconds += 1;
                    } else {
                        s.acid_on_manual_seconds += 1;
                    }
                    s.acid_on_total_seconds = s.acid_on_auto_seconds + s.acid_on_manual_seconds;
                    s.acid_sec_since_last_on += 1;
                    decrease_acid = true;
                }

                if s.aux_out {
                    if pump_auto {
                        s.aux_on_auto_seconds += 1;
                    } else {
                        s.aux_on_manual_seconds += 1;
                    }
                    s.aux_on_total_seconds = s.aux_on_auto_seconds + s.aux_on_manual_seconds;
                    s.aux_sec_since_last_on += 1;
                }

                if s.fill_valve {
                    if s.valve_automatic {
                        s.fill_on_auto_seconds += 1;
                    } else {
                        s.fill_on_manual_seconds += 1;
                    }
                    s.fill_on_total_seconds = s.fill_on_auto_seconds + s.fill_on_manual_seconds;
                    s.fill_sec_since_last_on += 1;
                }
            }
        }

        if decrease_bleach {
            self.bleach_tank
                .decrease_value(TANK_SEC_DECREASE_VALUE_LITERS)
                .await;
        }
        if decrease_acid {
            self.acid_tank
                .decrease_value(TANK_SEC_DECREASE_VALUE_LITERS)
                .await;
        }

        self.persist().await;
    }

    /// Restores mode flags and (if the stored row is from today)
    /// counters, reconciles the emergency latch against the current
    /// emergency-stop sensor reading, then replays every teoric state
    /// to the board.
    pub async fn load_from_repository(&self, emergency_sensor_active: bool) {
        let row = match self.repo.find_latest(collections::ACTUATOR_CONTROL_DATA).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                info!("no stored actuator control state, starting with all outputs off");
                return;
            }
            Err(e) => {
                warn!(error = %e, "couldn't load actuator control state, starting with all outputs off");
                return;
            }
        };

        let pump_automatic = row
            .get("pump_automatic_control")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let valve_automatic = row
            .get("valve_automatic_control")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let filter_pump_teoric = row
            .get("filter_pump_teoric_state")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let bleach_pump = row
            .get("bleach_pump_state")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let acid_pump = row
            .get("acid_pump_state")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let aux_out = row
            .get("aux_out_state")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let fill_valve = row
            .get("fill_valve_state")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let stored_cause = row.get("emergency_stop_cause").and_then(|v| v.as_str());
        let stored_in_estop = row
            .get("in_emergency_stop")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let stored_day = row
            .get("datetime")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| chrono::Datelike::day(&dt));

        {
            let mut s = self.state.lock().unwrap();
            s.pump_automatic = pump_automatic;
            s.valve_automatic = valve_automatic;
            s.filter_pump_teoric = filter_pump_teoric;
            s.bleach_pump = bleach_pump;
            s.acid_pump = acid_pump;
            s.aux_out = aux_out;
            s.fill_valve = fill_valve;

            if stored_day == Some(now_in(self.tz).day()) {
                s.filter_on_real_seconds = row
                    .get("filter_pump_on_real_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.filter_on_total_seconds = row
                    .get("filter_pump_on_total_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.filter_on_auto_seconds = row
                    .get("filter_pump_on_auto_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.filter_on_manual_seconds = row
                    .get("filter_pump_on_manual_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.bleach_on_total_seconds = row
                    .get("bleach_pump_on_total_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.bleach_on_auto_seconds = row
                    .get("bleach_pump_on_auto_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.bleach_on_manual_seconds = row
                    .get("bleach_pump_on_manual_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.acid_on_total_seconds = row
                    .get("acid_pump_on_total_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.acid_on_auto_seconds = row
                    .get("acid_pump_on_auto_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.acid_on_manual_seconds = row
                    .get("acid_pump_on_manual_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.aux_on_total_seconds = row
                    .get("aux_out_on_total_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.aux_on_auto_seconds = row
                    .get("aux_out_on_auto_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.aux_on_manual_seconds = row
                    .get("aux_out_on_manual_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.fill_on_total_seconds = row
                    .get("fill_valve_on_total_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.fill_on_auto_seconds = row
                    .get("fill_valve_on_auto_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                s.fill_on_manual_seconds = row
                    .get("fill_valve_on_manual_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                info!("actuator control statistics loaded for today");
            } else {
                info!("stored actuator control statistics are stale, starting from zero");
            }
        }

        match stored_cause {
            None | Some("None") => {
                if emergency_sensor_active {
                    self.emergency_stop(Some(EmergencyCause::Sensor), false).await;
                } else {
                    self.emergency_stop(None, true).await;
                }
            }
            Some(_) => {
                let mut s = self.state.lock().unwrap();
                s.emergency_cause = Some(EmergencyCause::Api(
                    stored_cause.unwrap_or_default().to_string(),
                ));
                s.in_emergency_stop = stored_in_estop;
            }
        }

        let in_estop = self.state.lock().unwrap().in_emergency_stop;
        if !in_estop {
            let _ = self
                .board
                .set_actuator(ActuatorId::FilterPump, filter_pump_teoric)
                .await;
            let _ = self.board.set_actuator(ActuatorId::BleachPump, bleach_pump).await;
            let _ = self.board.set_actuator(ActuatorId::AcidPump, acid_pump).await;
        }
        let _ = self.board.set_actuator(ActuatorId::AuxOut, aux_out).await;
        let _ = self.board.set_actuator(ActuatorId::FillValve, fill_valve).await;
    }

    async fn persist(&self) {
        let row = {
            let s = self.state.lock().unwrap();
            ActuatorControlRow {
                datetime: now_in(self.tz),
                in_emergency_stop: s.in_emergency_stop,
                emergency_stop_cause: s
                    .emergency_cause
                    .as_ref()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "None".to_string()),
                pump_automatic_control: s.pump_automatic,
                valve_automatic_control: s.valve_automatic,
                filter_pump_teoric_state: s.filter_pump_teoric,
                bleach_pump_state: s.bleach_pump,
                acid_pump_state: s.acid_pump,
                aux_out_state: s.aux_out,
                fill_valve_state: s.fill_valve,
                filter_pump_on_real_seconds: s.filter_on_real_seconds,
                filter_pump_on_total_seconds: s.filter_on_total_seconds,
                filter_pump_on_auto_seconds: s.filter_on_auto_seconds,
                filter_pump_on_manual_seconds: s.filter_on_manual_seconds,
                bleach_pump_on_total_seconds: s.bleach_on_total_seconds,
                bleach_pump_on_auto_seconds: s.bleach_on_auto_seconds,
                bleach_pump_on_manual_seconds: s.bleach_on_manual_seconds,
                acid_pump_on_total_seconds: s.acid_on_total_seconds,
                acid_pump_on_auto_seconds: s.acid_on_auto_seconds,
                acid_pump_on_manual_seconds: s.acid_on_manual_seconds,
                aux_out_on_total_seconds: s.aux_on_total_seconds,
                aux_out_on_auto_seconds: s.aux_on_auto_seconds,
                aux_out_on_manual_seconds: s.aux_on_manual_seconds,
                fill_valve_on_total_seconds: s.fill_on_total_seconds,
                fill_valve_on_auto_seconds: s.fill_on_auto_seconds,
                fill_valve_on_manual_seconds: s.fill_on_manual_seconds,
            }
        };
        let Ok(row) = serde_json::to_value(&row) else {
            return;
        };
        if let Err(e) = self
            .repo
            .upsert_single(collections::ACTUATOR_CONTROL_DATA, None, row)
            .await
        {
            warn!(error = %e, "couldn't persist actuator control state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board_fake::FakeBoard;
    use crate::repository::MemoryRepository;
    use poolctl_api::device::TankType;

    fn harness() -> (Arc<ActuatorControl>, Arc<FakeBoard>) {
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
        let ac = Arc::new(ActuatorControl::new(
            board.clone(),
            repo,
            chrono_tz::Europe::Madrid,
            bleach,
            acid,
        ));
        (ac, board)
    }

    #[tokio::test]
    async fn automatic_command_succeeds_while_automatic() {
        let (ac, board) = harness();
        ac.set_state(ActuatorId::FilterPump, true, true).await.unwrap();
        assert!(board.actuator_state(ActuatorId::FilterPump));
        assert!(ac.teoric_state(ActuatorId::FilterPump));
    }

    #[tokio::test]
    async fn manual_command_clears_automatic_mode_and_blocks_automatic_writes() {
        let (ac, _board) = harness();
        ac.set_state(ActuatorId::FilterPump, false, false).await.unwrap();
        assert!(!ac.pump_automatic());

        let err = ac.set_state(ActuatorId::FilterPump, true, true).await;
        assert_eq!(err, Err(Error::ManualMode));
    }

    #[tokio::test]
    async fn re_enabling_automatic_mode_unblocks_automatic_writes() {
        let (ac, _board) = harness();
        ac.set_state(ActuatorId::FilterPump, false, false).await.unwrap();
        ac.set_pump_automatic(true).await;
        ac.set_state(ActuatorId::FilterPump, true, true).await.unwrap();
        assert!(ac.teoric_state(ActuatorId::FilterPump));
    }

    #[tokio::test]
    async fn emergency_stop_blocks_interlocked_actuators_but_not_valve_or_aux() {
        let (ac, board) = harness();
        ac.set_state(ActuatorId::FilterPump, true, true).await.unwrap();
        ac.emergency_stop(Some(EmergencyCause::Sensor), false).await;

        assert!(ac.in_emergency_stop());
        assert!(!board.actuator_state(ActuatorId::FilterPump));
        assert_eq!(
            ac.set_state(ActuatorId::FilterPump, true, true).await,
            Err(Error::EmergencyStop)
        );

        ac.set_state(ActuatorId::FillValve, true, true).await.unwrap();
        assert!(board.actuator_state(ActuatorId::FillValve));
    }

    #[tokio::test]
    async fn resuming_emergency_stop_replays_teoric_states() {
        let (ac, board) = harness();
        ac.set_state(ActuatorId::FilterPump, true, true).await.unwrap();
        ac.emergency_stop(Some(EmergencyCause::Sensor), false).await;
        assert!(!board.actuator_state(ActuatorId::FilterPump));

        ac.emergency_stop(None, true).await;
        assert!(!ac.in_emergency_stop());
        assert!(board.actuator_state(ActuatorId::FilterPump));
    }

    #[tokio::test]
    async fn on_total_always_equals_auto_plus_manual() {
        let (ac, _board) = harness();
        ac.set_state(ActuatorId::BleachPump, true, true).await.unwrap();
        for _ in 0..5 {
            ac.tick().await;
        }

        let s = ac.state.lock().unwrap();
        assert_eq!(
            s.bleach_on_total_seconds,
            s.bleach_on_auto_seconds + s.bleach_on_manual_seconds
        );
        assert_eq!(s.bleach_on_total_seconds, 5);
    }

    #[tokio::test]
    async fn bleach_pump_on_drains_the_bleach_tank() {
        let (ac, _board) = harness();
        ac.set_state(ActuatorId::BleachPump, true, true).await.unwrap();
        ac.tick().await;
        assert!(ac.bleach_tank.current_liters() < 25.0);
    }

    #[tokio::test]
    async fn pump_current_sensor_drives_real_state() {
        let (ac, _board) = harness();
        let sensor = crate::sensor::Sensor::new(
            poolctl_api::device::SensorKind::PumpCurrent,
            None,
            None,
            chrono_tz::Europe::Madrid,
            Arc::new(MemoryRepository::new()),
        );
        ac.wire_pump_current_sensor(&sensor);

        sensor
            .add_value(Some(poolctl_api::device::Value::Float(3.2)), false)
            .await;
        tokio::task::yield_now().await;
        assert!(ac.filter_pump_real_state());

        sensor
            .add_value(Some(poolctl_api::device::Value::Float(0.0)), false)
            .await;
        tokio::task::yield_now().await;
        assert!(!ac.filter_pump_real_state());
    }
}
