//! The live, operator-mutable pool configuration (`spec.md` §6). Not
//! to be confused with `config::Config`, the boot-time TOML file this
//! process is launched with -- this is the single persisted row that
//! the algorithms read every tick and that an administration surface
//! would expose for editing.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use poolctl_api::device::Timestamp;
use poolctl_api::repository::collections;
use poolctl_api::Repository;

/// A `(command, duration_seconds)` pair in a LUMIPLUS sequence.
pub type LightCommand = (u8, u64);

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PoolConfigState {
    sensor_refresh_minutes: u32,
    daily_filter_allowed_hours: Vec<u32>,
    pool_hydrodynamic_factor: i64,
    pool_recirculation_period: i64,
    pool_orp_mv_setpoint: f64,
    pool_ph_setpoint: f64,
    pool_orp_auto_injection_disabled: bool,
    pool_ph_auto_injection_disabled: bool,
    pool_max_orp_daily_seconds: i64,
    pool_max_ph_daily_seconds: i64,
    pool_flow_k_factor: f64,
    pool_fill_start_level: u8,
    pool_fill_end_level: u8,
    pool_max_daily_water_volume_m3: f64,
    pool_fill_volume_between_checks: f64,
    pool_fill_seconds_wait: u64,
    pool_auto_lights_on: bool,
    pool_auto_lights_on_command_sequence: Vec<LightCommand>,
}

impl Default for PoolConfigState {
    fn default() -> Self {
        PoolConfigState {
            sensor_refresh_minutes: 15,
            daily_filter_allowed_hours: (8..=21).collect(),
            pool_hydrodynamic_factor: 15,
            pool_recirculation_period: 4,
            pool_orp_mv_setpoint: 650.0,
            pool_ph_setpoint: 7.4,
            pool_orp_auto_injection_disabled: false,
            pool_ph_auto_injection_disabled: false,
            pool_max_orp_daily_seconds: 3600,
            pool_max_ph_daily_seconds: 3600,
            pool_flow_k_factor: 7.5,
            pool_fill_start_level: 1,
            pool_fill_end_level: 3,
            pool_max_daily_water_volume_m3: 2.0,
            pool_fill_volume_between_checks: 0.5,
            pool_fill_seconds_wait: 30,
            pool_auto_lights_on: true,
            pool_auto_lights_on_command_sequence: vec![(3, 2 * 60 * 60)],
        }
    }
}

#[derive(Default)]
struct Callbacks {
    sensor_refresh_minutes: Option<Box<dyn Fn(u32) + Send + Sync>>,
    flow_k_factor: Option<Box<dyn Fn(f64) + Send + Sync>>,
}

pub struct PoolConfig {
    tz: chrono_tz::Tz,
    repo: Arc<dyn Repository>,
    state: Mutex<PoolConfigState>,
    callbacks: Mutex<Callbacks>,
}

#[derive(Serialize)]
struct PoolConfigRow<'a> {
    datetime: Timestamp,
    #[serde(flatten)]
    state: &'a PoolConfigState,
}

macro_rules! getter {
    ($name:ident, $field:ident, $ty:ty) => {
        pub fn $name(&self) -> $ty {
            self.state.lock().unwrap().$field.clone()
        }
    };
}

impl PoolConfig {
    pub fn new(tz: chrono_tz::Tz, repo: Arc<dyn Repository>) -> Self {
        PoolConfig {
            tz,
            repo,
            state: Mutex::new(PoolConfigState::default()),
            callbacks: Mutex::new(Callbacks::default()),
        }
    }

    /// Applies compiled-default overrides parsed from the boot config
    /// file (`config::load_file`), before `load_from_repository` runs.
    pub fn apply_overrides(&self, overrides: &PoolConfigOverrides) {
        let mut s = self.state.lock().unwrap();
        overrides.merge_into(&mut s);
    }

    pub async fn load_from_repository(&self) {
        match self.repo.find_latest(collections::POOL_CONFIG_DATA).await {
            Ok(Some(row)) => match serde_json::from_value::<PoolConfigState>(row) {
                Ok(loaded) => {
                    *self.state.lock().unwrap() = loaded;
                    info!("pool configuration loaded");
                }
                Err(e) => warn!(error = %e, "stored pool configuration is malformed, keeping defaults"),
            },
            Ok(None) => info!("no stored pool configuration, using compiled defaults"),
            Err(e) => warn!(error = %e, "couldn't load pool configuration, using compiled defaults"),
        }
    }

    getter!(sensor_refresh_minutes, sensor_refresh_minutes, u32);
    getter!(daily_filter_allowed_hours, daily_filter_allowed_hours, Vec<u32>);
    getter!(pool_hydrodynamic_factor, pool_hydrodynamic_factor, i64);
    getter!(pool_recirculation_period, pool_recirculation_period, i64);
    getter!(pool_orp_mv_setpoint, pool_orp_mv_setpoint, f64);
    getter!(pool_ph_setpoint, pool_ph_setpoint, f64);
    getter!(
        pool_orp_auto_injection_disabled,
        pool_orp_auto_injection_disabled,
        bool
    );
    getter!(
        pool_ph_auto_injection_disabled,
        pool_ph_auto_injection_disabled,
        bool
    );
    getter!(pool_max_orp_daily_seconds, pool_max_orp_daily_seconds, i64);
    getter!(pool_max_ph_daily_seconds, pool_max_ph_daily_seconds, i64);
    getter!(pool_flow_k_factor, pool_flow_k_factor, f64);
    getter!(pool_fill_start_level, pool_fill_start_level, u8);
    getter!(pool_fill_end_level, pool_fill_end_level, u8);
    getter!(
        pool_max_daily_water_volume_m3,
        pool_max_daily_water_volume_m3,
        f64
    );
    getter!(
        pool_fill_volume_between_checks,
        pool_fill_volume_between_checks,
        f64
    );
    getter!(pool_fill_seconds_wait, pool_fill_seconds_wait, u64);
    getter!(pool_auto_lights_on, pool_auto_lights_on, bool);
    getter!(
        pool_auto_lights_on_command_sequence,
        pool_auto_lights_on_command_sequence,
        Vec<LightCommand>
    );

    /// Registers the single callback fired whenever
    /// `sensor_refresh_minutes` changes -- `Water` uses this to cancel
    /// and reschedule its aggregation timer.
    pub fn on_sensor_refresh_minutes_change(&self, cb: impl Fn(u32) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().sensor_refresh_minutes = Some(Box::new(cb));
    }

    /// Registers the single callback fired whenever `pool_flow_k_factor`
    /// changes -- `FlowSensor` uses this to live-update its divisor.
    pub fn on_flow_k_factor_change(&self, cb: impl Fn(f64) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().flow_k_factor = Some(Box::new(cb));
    }

    pub async fn set_sensor_refresh_minutes(&self, value: u32) {
        let clamped = value.clamp(1, 20);
        {
            let mut s = self.state.lock().unwrap();
            s.sensor_refresh_minutes = clamped;
        }
        self.persist().await;
        if let Some(cb) = &self.callbacks.lock().unwrap().sensor_refresh_minutes {
            cb(clamped);
        }
    }

    pub async fn set_daily_filter_allowed_hours(&self, hours: Vec<u32>) {
        let filtered: Vec<u32> = hours.into_iter().filter(|h| *h < 24).collect();
        self.state.lock().unwrap().daily_filter_allowed_hours = filtered;
        self.persist().await;
    }

    pub async fn set_pool_hydrodynamic_factor(&self, value: i64) {
        self.state.lock().unwrap().pool_hydrodynamic_factor = value;
        self.persist().await;
    }

    pub async fn set_pool_recirculation_period(&self, value: i64) {
        self.state.lock().unwrap().pool_recirculation_period = value;
        self.persist().await;
    }

    pub async fn set_pool_orp_mv_setpoint(&self, value: f64) {
        self.state.lock().unwrap().pool_orp_mv_setpoint = value;
        self.persist().await;
    }

    pub async fn set_pool_ph_setpoint(&self, value: f64) {
        self.state.lock().unwrap().pool_ph_setpoint = value;
        self.persist().await;
    }

    pub async fn set_pool_orp_auto_injection_disabled(&self, value: bool) {
        self.state.lock().unwrap().pool_orp_auto_injection_disabled = value;
        self.persist().await;
    }

    pub async fn set_pool_ph_auto_injection_disabled(&self, value: bool) {
        self.state.lock().unwrap().pool_ph_auto_injection_disabled = value;
        self.persist().await;
    }

    pub async fn set_pool_max_orp_daily_seconds(&self, value: i64) {
        self.state.lock().unwrap().pool_max_orp_daily_seconds = value;
        self.persist().await;
    }

    pub async fn set_pool_max_ph_daily_seconds(&self, value: i64) {
        self.state.lock().unwrap().pool_max_ph_daily_seconds = value;
        self.persist().await;
    }

    pub async fn set_pool_flow_k_factor(&self, value: f64) {
        {
            let mut s = self.state.lock().unwrap();
            s.pool_flow_k_factor = value;
        }
        self.persist().await;
        if let Some(cb) = &self.callbacks.lock().unwrap().flow_k_factor {
            cb(value);
        }
    }

    pub async fn set_pool_fill_start_level(&self, value: u8) {
        self.state.lock().unwrap().pool_fill_start_level = value.min(5);
        self.persist().await;
    }

    pub async fn set_pool_fill_end_level(&self, value: u8) {
        self.state.lock().unwrap().pool_fill_end_level = value.min(5);
        self.persist().await;
    }

    pub async fn set_pool_max_daily_water_volume_m3(&self, value: f64) {
        self.state.lock().unwrap().pool_max_daily_water_volume_m3 = value;
        self.persist().await;
    }

    pub async fn set_pool_fill_volume_between_checks(&self, value: f64) {
        self.state.lock().unwrap().pool_fill_volume_between_checks = value;
        self.persist().await;
    }

    pub async fn set_pool_fill_seconds_wait(&self, value: u64) {
        self.state.lock().unwrap().pool_fill_seconds_wait = value;
        self.persist().await;
    }

    pub async fn set_pool_auto_lights_on(&self, value: bool) {
        self.state.lock().unwrap().pool_auto_lights_on = value;
        self.persist().await;
    }

    pub async fn set_pool_auto_lights_on_command_sequence(&self, seq: Vec<LightCommand>) {
        self.state.lock().unwrap().pool_auto_lights_on_command_sequence = seq;
        self.persist().await;
    }

    async fn persist(&self) {
        let row = {
            let s = self.state.lock().unwrap();
            let row = PoolConfigRow {
                datetime: poolctl_api::device::now_in(self.tz),
                state: &s,
            };
            serde_json::to_value(&row)
        };
        let Ok(row) = row else {
            return;
        };
        if let Err(e) = self
            .repo
            .upsert_single(collections::POOL_CONFIG_DATA, None, row)
            .await
        {
            warn!(error = %e, "couldn't persist pool configuration");
        }
    }
}

/// Overrides parsed from the boot config file, applied once at
/// startup before the persisted row (if any) is loaded on top.
#[derive(Default, Deserialize)]
pub struct PoolConfigOverrides {
    pub sensor_refresh_minutes: Option<u32>,
    pub daily_filter_allowed_hours: Option<Vec<u32>>,
    pub pool_hydrodynamic_factor: Option<i64>,
    pub pool_recirculation_period: Option<i64>,
    pub pool_orp_mv_setpoint: Option<f64>,
    pub pool_ph_setpoint: Option<f64>,
    pub pool_flow_k_factor: Option<f64>,
    pub pool_max_daily_water_volume_m3: Option<f64>,
}

impl PoolConfigOverrides {
    fn merge_into(&self, s: &mut PoolConfigState) {
        if let Some(v) = self.sensor_refresh_minutes {
            s.sensor_refresh_minutes = v.clamp(1, 20);
        }
        if let Some(v) = &self.daily_filter_allowed_hours {
            s.daily_filter_allowed_hours = v.clone();
        }
        if let Some(v) = self.pool_hydrodynamic_factor {
            s.pool_hydrodynamic_factor = v;
        }
        if let Some(v) = self.pool_recirculation_period {
            s.pool_recirculation_period = v;
        }
        if let Some(v) = self.pool_orp_mv_setpoint {
            s.pool_orp_mv_setpoint = v;
        }
        if let Some(v) = self.pool_ph_setpoint {
            s.pool_ph_setpoint = v;
        }
        if let Some(v) = self.pool_flow_k_factor {
            s.pool_flow_k_factor = v;
        }
        if let Some(v) = self.pool_max_daily_water_volume_m3 {
            s.pool_max_daily_water_volume_m3 = v;
        }
    }
}
