//! Night-triggered light show over the LUMIPLUS link. Grounded on
//! `original_source/src/algorithms/lights.py`'s `Lights`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use poolctl_api::device::now_in;
use poolctl_api::repository::collections;
use poolctl_api::{LightLink, Repository};

use crate::pool_config::{LightCommand, PoolConfig};
use crate::sensor::Sensor;

/// LUMIPLUS's 36 commands, each a 6-ASCII-digit wire command. Indices
/// 0 (shutdown), 1-12 (colors), 13-20 (sequences), 21-27 (speeds) and
/// 28-35 (the fixed timings `execute_command_sequence` falls back to)
/// all come from the controller's own protocol table.
const COMMANDS: [[u8; 6]; 36] = [
    *b"023080", *b"023049", *b"023051", *b"023050", *b"023060", *b"023055", *b"023053",
    *b"023058", *b"023054", *b"023057", *b"023052", *b"023056", *b"023059", *b"023184",
    *b"023170", *b"023179", *b"023199", *b"023248", *b"023234", *b"023243", *b"023135",
    *b"023072", *b"023071", *b"023070", *b"023069", *b"023068", *b"023067", *b"023066",
    *b"023097", *b"023098", *b"023099", *b"023100", *b"023101", *b"023102", *b"023103",
    *b"023104",
];

/// Maps a sequence entry's `duration` (seconds) onto one of the
/// controller's own fixed-timing commands, when it matches exactly.
fn timing_command_for(duration: u64) -> Option<u8> {
    match duration {
        300 => Some(28),
        900 => Some(29),
        1800 => Some(30),
        3600 => Some(31),
        5400 => Some(32),
        7200 => Some(33),
        14400 => Some(34),
        28800 => Some(35),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum LightsState {
    WaitingForNight,
    WaitingForDay,
}

struct State {
    algorithm_state: LightsState,
    lights_are_on: bool,
}

#[derive(Serialize)]
struct LightsAlgorithmRow {
    datetime: poolctl_api::device::Timestamp,
    lights_are_on: bool,
}

/// Watches the light sensor and, on the transition into darkness,
/// plays the configured command sequence over the LUMIPLUS link.
pub struct LightsAlgorithm {
    tz: chrono_tz::Tz,
    repo: Arc<dyn Repository>,
    config: Arc<PoolConfig>,
    light_link: Arc<dyn LightLink>,
    state: Mutex<State>,
}

impl LightsAlgorithm {
    pub fn new(
        tz: chrono_tz::Tz,
        repo: Arc<dyn Repository>,
        config: Arc<PoolConfig>,
        light_link: Arc<dyn LightLink>,
    ) -> Self {
        info!("lights algorithm instantiated");
        LightsAlgorithm {
            tz,
            repo,
            config,
            light_link,
            state: Mutex::new(State {
                algorithm_state: LightsState::WaitingForNight,
                lights_are_on: false,
            }),
        }
    }

    pub fn lights_are_on(&self) -> bool {
        self.state.lock().unwrap().lights_are_on
    }

    pub fn state(&self) -> LightsState {
        self.state.lock().unwrap().algorithm_state
    }

    pub async fn load_from_repository(&self) {
        match self.repo.find_latest(collections::LIGHTS_ALGORITHM_DATA).await {
            Ok(Some(row)) => {
                if let Some(v) = row.get("lights_are_on").and_then(|v| v.as_bool()) {
                    self.state.lock().unwrap().lights_are_on = v;
                }
                info!("lights algorithm state loaded");
            }
            Ok(None) => info!("no stored lights algorithm state, starting from zero"),
            Err(e) => warn!(error = %e, "couldn't load lights algorithm state, starting from zero"),
        }
    }

    /// Sets the initial state from the light sensor's current reading,
    /// so a boot that happens after dusk doesn't wait for a spurious
    /// transition before catching up.
    pub fn initialize(&self, light_present: bool) {
        if !self.config.pool_auto_lights_on() {
            return;
        }
        self.state.lock().unwrap().algorithm_state = if light_present {
            LightsState::WaitingForNight
        } else {
            LightsState::WaitingForDay
        };
    }

    /// Subscribes to the boolean light sensor.
    pub fn wire_light_sensor(self: &Arc<Self>, sensor: &Sensor) {
        let this = self.clone();
        sensor.add_callback(move |snapshot| {
            if let Some(light_present) = snapshot.value.and_then(|v| v.as_bool()) {
                let this = this.clone();
                tokio::spawn(async move {
                    this.on_light_change(light_present).await;
                });
            }
        });
    }

    async fn on_light_change(&self, light_present: bool) {
        if !self.config.pool_auto_lights_on() {
            return;
        }

        let sequence = {
            let mut s = self.state.lock().unwrap();
            match s.algorithm_state {
                LightsState::WaitingForNight if !light_present => {
                    s.algorithm_state = LightsState::WaitingForDay;
                    info!("lights algorithm: waiting_for_night -> waiting_for_day");
                    Some(self.config.pool_auto_lights_on_command_sequence())
                }
                LightsState::WaitingForDay if light_present => {
                    s.algorithm_state = LightsState::WaitingForNight;
                    info!("lights algorithm: waiting_for_day -> waiting_for_night");
                    None
                }
                _ => None,
            }
        };

        if let Some(sequence) = sequence {
            self.execute_command_sequence(&sequence).await;
        }
    }

    async fn execute_command_sequence(&self, sequence: &[LightCommand]) {
        for &(command, duration) in sequence {
            if duration == 0 {
                self.send_command(command).await;
                continue;
            }

            if self.send_command(command).await {
                match timing_command_for(duration) {
                    Some(timing) => {
                        self.send_command(timing).await;
                    }
                    None => {
                        tokio::time::sleep(Duration::from_secs(duration)).await;
                    }
                }
            }
        }
    }

    async fn send_command(&self, command: u8) -> bool {
        let Some(&bytes) = COMMANDS.get(command as usize) else {
            warn!(command, "unknown lumiplus command, skipping");
            return false;
        };

        let ok = self.light_link.send(bytes).await;
        if ok {
            if (1..=20).contains(&command) {
                self.state.lock().unwrap().lights_are_on = true;
                self.persist().await;
            } else if command == 0 {
                self.state.lock().unwrap().lights_are_on = false;
                self.persist().await;
            }
        } else {
            warn!(command, "lumiplus command failed");
        }
        ok
    }

    async fn persist(&self) {
        let row = LightsAlgorithmRow {
            datetime: now_in(self.tz),
            lights_are_on: self.state.lock().unwrap().lights_are_on,
        };
        let Ok(row) = serde_json::to_value(&row) else {
            return;
        };
        if let Err(e) = self
            .repo
            .upsert_single(collections::LIGHTS_ALGORITHM_DATA, None, row)
            .await
        {
            warn!(error = %e, "couldn't persist lights algorithm state");
        }
    }
}
