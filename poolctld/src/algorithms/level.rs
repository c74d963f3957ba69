//! Fill-valve control. Grounded on
//! `original_source/src/algorithms/level.py`'s `Level`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Datelike;
use serde::Serialize;
use tracing::{info, warn};

use poolctl_api::device::{now_in, ActuatorId, Timestamp};
use poolctl_api::repository::collections;
use poolctl_api::Repository;

use crate::actuator::ActuatorControl;
use crate::flow_sensor::FlowSensor;
use crate::pool_config::PoolConfig;
use crate::water::Water;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum LevelState {
    WaitingForFill,
    Filling,
}

struct State {
    state: LevelState,
    daily_filled_volume: f64,
    start_volume: f64,
    day: u32,
}

#[derive(Serialize)]
struct LevelAlgorithmRow {
    datetime: Timestamp,
    state: LevelState,
    daily_filled_volume: f64,
}

/// Opens the fill valve when the pool runs dry and closes it once the
/// top sensor trips or the daily volume cap is reached, pausing
/// between checks the same amount of time the flow meter needs to
/// report a fresh reading (`spec.md` §4.11).
pub struct LevelAlgorithm {
    tz: chrono_tz::Tz,
    repo: Arc<dyn Repository>,
    actuator: Arc<ActuatorControl>,
    config: Arc<PoolConfig>,
    water: Arc<Water>,
    flow: Arc<FlowSensor>,
    state: Mutex<State>,
}

impl LevelAlgorithm {
    pub fn new(
        tz: chrono_tz::Tz,
        repo: Arc<dyn Repository>,
        actuator: Arc<ActuatorControl>,
        config: Arc<PoolConfig>,
        water: Arc<Water>,
        flow: Arc<FlowSensor>,
    ) -> Self {
        info!("level algorithm instantiated");
        LevelAlgorithm {
            tz,
            repo,
            actuator,
            config,
            water,
            flow,
            state: Mutex::new(State {
                state: LevelState::WaitingForFill,
                daily_filled_volume: 0.0,
                start_volume: 0.0,
                day: now_in(tz).day(),
            }),
        }
    }

    pub fn state(&self) -> LevelState {
        self.state.lock().unwrap().state
    }

    pub fn daily_filled_volume(&self) -> f64 {
        self.state.lock().unwrap().daily_filled_volume
    }

    pub async fn load_from_repository(&self) {
        let today = now_in(self.tz).day();
        match self.repo.find_latest(collections::LEVEL_ALGORITHM_DATA).await {
            Ok(Some(row)) => {
                let stored_day = row
                    .get("datetime")
                    .and_then(|v| v.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| chrono::Datelike::day(&dt));

                let mut s = self.state.lock().unwrap();
                s.daily_filled_volume = if stored_day == Some(today) {
                    row.get("daily_filled_volume")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0)
                } else {
                    0.0
                };
                info!("level algorithm state loaded");
            }
            Ok(None) => info!("no stored level algorithm state, starting from zero"),
            Err(e) => warn!(error = %e, "couldn't load level algorithm state, starting from zero"),
        }
    }

    /// Runs once a second.
    pub async fn tick(&self) {
        let today = now_in(self.tz).day();

        if self.actuator.valve_automatic() {
            let current = self.state.lock().unwrap().state;
            match current {
                LevelState::WaitingForFill => self.tick_waiting_for_fill().await,
                LevelState::Filling => self.tick_filling().await,
            }
        }

        {
            let mut s = self.state.lock().unwrap();
            if s.day != today {
                s.day = today;
                s.daily_filled_volume = 0.0;
            }
        }

        self.persist().await;
    }

    async fn tick_waiting_for_fill(&self) {
        if self.actuator.teoric_state(ActuatorId::FillValve) {
            let _ = self
                .actuator
                .set_state(ActuatorId::FillValve, false, true)
                .await;
        }

        let start_level = self.config.pool_fill_start_level() as usize;
        let no_water = !self.water.level(start_level);
        let under_cap = {
            let s = self.state.lock().unwrap();
            s.daily_filled_volume < self.config.pool_max_daily_water_volume_m3()
        };

        if no_water && under_cap {
            let start_volume = self.flow.daily_volume();
            {
                let mut s = self.state.lock().unwrap();
                s.start_volume = start_volume;
                s.state = LevelState::Filling;
            }
            let _ = self
                .actuator
                .set_state(ActuatorId::FillValve, true, true)
                .await;
            info!("level algorithm: waiting_for_fill -> filling");
        }
    }

    async fn tick_filling(&self) {
        if !self.actuator.teoric_state(ActuatorId::FillValve) {
            let _ = self
                .actuator
                .set_state(ActuatorId::FillValve, true, true)
                .await;
        }

        let daily_volume = self.flow.daily_volume();
        let mut difference = {
            let s = self.state.lock().unwrap();
            daily_volume - s.start_volume
        };
        if difference < 0.0 {
            self.state.lock().unwrap().start_volume = daily_volume;
            difference = 0.0;
        }

        let (exceeded_cap, reached_check) = {
            let mut s = self.state.lock().unwrap();
            s.daily_filled_volume += difference;
            (
                s.daily_filled_volume > self.config.pool_max_daily_water_volume_m3(),
                difference >= self.config.pool_fill_volume_between_checks(),
            )
        };

        if exceeded_cap {
            let _ = self
                .actuator
                .set_state(ActuatorId::FillValve, false, true)
                .await;
            self.state.lock().unwrap().state = LevelState::WaitingForFill;
            info!("level algorithm: daily volume cap reached, filling -> waiting_for_fill");
            return;
        }

        if !reached_check {
            return;
        }

        let _ = self
            .actuator
            .set_state(ActuatorId::FillValve, false, true)
            .await;

        // Cooperative wait belonging to this task's own timeline: the
        // flow meter needs this long to report a fresh reading before
        // the next check is meaningful.
        tokio::time::sleep(Duration::from_secs(self.config.pool_fill_seconds_wait())).await;

        let end_level = self.config.pool_fill_end_level() as usize;
        if self.water.level(end_level) {
            self.state.lock().unwrap().state = LevelState::WaitingForFill;
            info!("level algorithm: top level reached, filling -> waiting_for_fill");
        } else {
            let fresh_start = self.flow.daily_volume();
            {
                let mut s = self.state.lock().unwrap();
                s.start_volume = fresh_start;
            }
            let _ = self
                .actuator
                .set_state(ActuatorId::FillValve, true, true)
                .await;
        }
    }

    async fn persist(&self) {
        let row = {
            let s = self.state.lock().unwrap();
            LevelAlgorithmRow {
                datetime: now_in(self.tz),
                state: s.state,
                daily_filled_volume: s.daily_filled_volume,
            }
        };
        let Ok(row) = serde_json::to_value(&row) else {
            return;
        };
        if let Err(e) = self
            .repo
            .upsert_single(collections::LEVEL_ALGORITHM_DATA, None, row)
            .await
        {
            warn!(error = %e, "couldn't persist level algorithm state");
        }
    }
}
