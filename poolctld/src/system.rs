//! Wires every component into a single running installation.
//! Construction order follows `spec.md` §2's data-flow diagram:
//! repository, then tanks/config, then sensors, then the actuator
//! gate, then water, then the four algorithms. Grounded on
//! `drmemd::core::State`'s role of owning every driver instance, and
//! `drmemd::run`'s pattern of collecting task handles and joining
//! them on shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, info_span};
use tracing_futures::Instrument;

use poolctl_api::board::EdgeSensor;
use poolctl_api::device::{EmergencyCause, SensorKind, Value};
use poolctl_api::{Board, LightLink, Repository};

use crate::actuator::ActuatorControl;
use crate::algorithms::chemicals::ChemicalsAlgorithm;
use crate::algorithms::filter::FilterAlgorithm;
use crate::algorithms::level::LevelAlgorithm;
use crate::algorithms::lights::LightsAlgorithm;
use crate::chemical_tank::ChemicalTank;
use crate::config::Config;
use crate::filter_monitor::Filter;
use crate::flow_sensor::FlowSensor;
use crate::pool_config::PoolConfig;
use crate::scheduler::PeriodicTask;
use crate::sensor::Sensor;
use crate::water::Water;

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Every component of one running installation, plus the handles of
/// the tasks that drive it. Dropping this stops every task (each
/// `PeriodicTask` cancels itself on `Drop`).
pub struct System {
    pub actuator: Arc<ActuatorControl>,
    pub config: Arc<PoolConfig>,
    pub water: Arc<Water>,
    pub flow: Arc<FlowSensor>,
    pub filter_algorithm: Arc<FilterAlgorithm>,
    pub chemicals_algorithm: Arc<ChemicalsAlgorithm>,
    pub level_algorithm: Arc<LevelAlgorithm>,
    pub lights_algorithm: Arc<LightsAlgorithm>,
    pub sand_filter: Arc<Filter>,
    pub diatoms_filter: Arc<Filter>,

    ph_sensor: Arc<Sensor>,
    orp_sensor: Arc<Sensor>,
    tds_sensor: Arc<Sensor>,
    temperature_sensor: Arc<Sensor>,
    sand_pressure_sensor: Arc<Sensor>,
    diatoms_pressure_sensor: Arc<Sensor>,
    voltage_sensor: Arc<Sensor>,
    pump_current_sensor: Arc<Sensor>,
    general_current_sensor: Arc<Sensor>,
    light_sensor: Arc<Sensor>,
    emergency_sensor: Arc<Sensor>,
    level_sensors: Vec<Arc<Sensor>>,

    board: Arc<dyn Board>,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl System {
    /// Builds every component and wires every subscription, but
    /// starts no task yet. Call `load_state` then `start`.
    pub fn new(
        board: Arc<dyn Board>,
        light_link: Arc<dyn LightLink>,
        repo: Arc<dyn Repository>,
        cfg: &Config,
    ) -> Arc<System> {
        let tz = cfg.timezone();

        let bleach_tank = Arc::new(ChemicalTank::new(
            poolctl_api::device::TankType::Bleach,
            25.0,
            tz,
            repo.clone(),
        ));
        let acid_tank = Arc::new(ChemicalTank::new(
            poolctl_api::device::TankType::Acid,
            25.0,
            tz,
            repo.clone(),
        ));

        let config = Arc::new(PoolConfig::new(tz, repo.clone()));
        config.apply_overrides(&cfg.pool);

        let ph_sensor = Arc::new(Sensor::new(SensorKind::Ph, Some(6.9), Some(8.2), tz, repo.clone()));
        let orp_sensor = Arc::new(Sensor::new(SensorKind::Orp, Some(0.0), Some(1000.0), tz, repo.clone()));
        let tds_sensor = Arc::new(Sensor::new(SensorKind::Tds, None, None, tz, repo.clone()));
        let temperature_sensor =
            Arc::new(Sensor::new(SensorKind::Temperature, None, None, tz, repo.clone()));
        let sand_pressure_sensor =
            Arc::new(Sensor::new(SensorKind::SandPressure, None, None, tz, repo.clone()));
        let diatoms_pressure_sensor =
            Arc::new(Sensor::new(SensorKind::DiatomsPressure, None, None, tz, repo.clone()));
        let voltage_sensor = Arc::new(Sensor::new(SensorKind::Voltage, None, None, tz, repo.clone()));
        let pump_current_sensor =
            Arc::new(Sensor::new(SensorKind::PumpCurrent, None, None, tz, repo.clone()));
        let general_current_sensor =
            Arc::new(Sensor::new(SensorKind::GeneralCurrent, None, None, tz, repo.clone()));
        let light_sensor = Arc::new(Sensor::new(SensorKind::Light, None, None, tz, repo.clone()));
        let emergency_sensor =
            Arc::new(Sensor::new(SensorKind::EmergencyStop, None, None, tz, repo.clone()));
        let level_sensors: Vec<Arc<Sensor>> = (0..6u8)
            .map(|i| Arc::new(Sensor::new(SensorKind::WaterLevel(i), None, None, tz, repo.clone())))
            .collect();

        let actuator = Arc::new(ActuatorControl::new(
            board.clone(),
            repo.clone(),
            tz,
            bleach_tank,
            acid_tank,
        ));
        actuator.wire_pump_current_sensor(&pump_current_sensor);

        let water = Arc::new(Water::new(
            tz,
            repo.clone(),
            actuator.clone(),
            config.sensor_refresh_minutes(),
        ));
        water.wire_temperature_sensor(&temperature_sensor);
        water.wire_orp_sensor(&orp_sensor);
        water.wire_ph_sensor(&ph_sensor);
        water.wire_tds_sensor(&tds_sensor);
        for (i, sensor) in level_sensors.iter().enumerate() {
            water.wire_level_sensor(i, sensor);
        }

        let flow = Arc::new(FlowSensor::new(tz, repo.clone(), config.pool_flow_k_factor()));

        {
            let water = water.clone();
            config.on_sensor_refresh_minutes_change(move |minutes| water.reschedule(minutes));
        }
        {
            let flow = flow.clone();
            config.on_flow_k_factor_change(move |k| flow.set_k_factor(k));
        }

        let filter_algorithm = Arc::new(FilterAlgorithm::new(
            tz,
            repo.clone(),
            actuator.clone(),
            config.clone(),
        ));
        filter_algorithm.wire_water(&water);

        let chemicals_algorithm = Arc::new(ChemicalsAlgorithm::new(
            tz,
            repo.clone(),
            actuator.clone(),
            config.clone(),
            water.clone(),
        ));

        let level_algorithm = Arc::new(LevelAlgorithm::new(
            tz,
            repo.clone(),
            actuator.clone(),
            config.clone(),
            water.clone(),
            flow.clone(),
        ));

        let lights_algorithm = Arc::new(LightsAlgorithm::new(
            tz,
            repo.clone(),
            config.clone(),
            light_link,
        ));
        lights_algorithm.wire_light_sensor(&light_sensor);

        let sand_filter = Filter::new(poolctl_api::device::FilterType::Sand, tz, repo.clone());
        sand_filter.wire_pressure_sensor(&sand_pressure_sensor);
        let diatoms_filter = Filter::new(poolctl_api::device::FilterType::Diatoms, tz, repo.clone());
        diatoms_filter.wire_pressure_sensor(&diatoms_pressure_sensor);

        {
            let actuator = actuator.clone();
            emergency_sensor.add_callback(move |snapshot| {
                let actuator = actuator.clone();
                if let Some(active) = snapshot.value.and_then(|v| v.as_bool()) {
                    tokio::spawn(async move {
                        if active {
                            actuator
                                .emergency_stop(Some(EmergencyCause::Sensor), false)
                                .await;
                        } else {
                            actuator.emergency_stop(None, true).await;
                        }
                    });
                }
            });
        }

        Self::wire_board_edges(&board, &level_sensors, &light_sensor, &emergency_sensor, &flow);

        Arc::new(System {
            actuator,
            config,
            water,
            flow,
            filter_algorithm,
            chemicals_algorithm,
            level_algorithm,
            lights_algorithm,
            sand_filter,
            diatoms_filter,
            ph_sensor,
            orp_sensor,
            tds_sensor,
            temperature_sensor,
            sand_pressure_sensor,
            diatoms_pressure_sensor,
            voltage_sensor,
            pump_current_sensor,
            general_current_sensor,
            light_sensor,
            emergency_sensor,
            level_sensors,
            board,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Registers the board's GPIO edge callbacks. Each one only ever
    /// calls `Sensor::add_value`/`FlowSensor::add_tick`, matching
    /// `spec.md` §5's "callbacks must be non-blocking" rule --
    /// anything that needs a lock or I/O happens inside the
    /// subscriber chain those calls trigger, not here.
    fn wire_board_edges(
        board: &Arc<dyn Board>,
        level_sensors: &[Arc<Sensor>],
        light_sensor: &Arc<Sensor>,
        emergency_sensor: &Arc<Sensor>,
        flow: &Arc<FlowSensor>,
    ) {
        for (i, sensor) in level_sensors.iter().enumerate() {
            let sensor = sensor.clone();
            board.register_edge_callback(
                EdgeSensor::WaterLevel(i as u8),
                Box::new(move |value| {
                    let sensor = sensor.clone();
                    tokio::spawn(async move {
                        sensor.add_value(Some(Value::Bool(value)), true).await;
                    });
                }),
            );
        }

        {
            let sensor = light_sensor.clone();
            board.register_edge_callback(
                EdgeSensor::Light,
                Box::new(move |value| {
                    let sensor = sensor.clone();
                    tokio::spawn(async move {
                        sensor.add_value(Some(Value::Bool(value)), true).await;
                    });
                }),
            );
        }

        {
            // Active-low: the raw GPIO edge reports the pin level, but
            // the sensor (and everything downstream of it) tracks
            // whether the emergency stop is *engaged*.
            let sensor = emergency_sensor.clone();
            board.register_edge_callback(
                EdgeSensor::EmergencyStop,
                Box::new(move |raw| {
                    let sensor = sensor.clone();
                    let active = !raw;
                    tokio::spawn(async move {
                        sensor.add_value(Some(Value::Bool(active)), true).await;
                    });
                }),
            );
        }

        {
            let flow = flow.clone();
            board.register_edge_callback(
                EdgeSensor::Flow,
                Box::new(move |_| flow.add_tick()),
            );
        }
    }

    /// Loads every persisted row, in the order each component's
    /// constructor requires its dependencies to already exist.
    pub async fn load_state(&self) {
        self.config.load_from_repository().await;
        self.water.load_from_repository().await;
        self.flow.load_from_repository().await;

        let emergency_active = self.emergency_sensor.value().and_then(|v| v.as_bool()).unwrap_or(false);
        self.actuator.load_from_repository(emergency_active).await;

        self.filter_algorithm.load_from_repository().await;
        self.chemicals_algorithm.load_from_repository().await;
        self.level_algorithm.load_from_repository().await;
        self.lights_algorithm.load_from_repository().await;

        self.lights_algorithm
            .initialize(self.light_sensor.value().and_then(|v| v.as_bool()).unwrap_or(true));

        info!("system state loaded");
    }

    /// Spawns every periodic task and keeps their handles in `self`.
    /// Dropping the `System` drops those handles, and each
    /// `PeriodicTask` cancels and aborts its own task on `Drop`
    /// (`spec.md` §2 ADDED: "a handle whose `Drop` cancels every
    /// task").
    pub fn start(self: &Arc<Self>) {
        self.water.start();

        let mut tasks = vec![
            Self::spawn("actuator_tick", self.actuator.clone(), |a| async move {
                a.tick().await
            }),
            Self::spawn("flow_tick", self.flow.clone(), |f| async move {
                f.tick().await
            }),
            Self::spawn(
                "filter_algorithm_tick",
                self.filter_algorithm.clone(),
                |f| async move { f.tick().await },
            ),
            Self::spawn(
                "chemicals_algorithm_tick",
                self.chemicals_algorithm.clone(),
                |c| async move { c.tick().await },
            ),
            Self::spawn(
                "level_algorithm_tick",
                self.level_algorithm.clone(),
                |l| async move { l.tick().await },
            ),
            self.spawn_sensor_poll(),
        ];

        self.tasks.lock().unwrap().append(&mut tasks);

        info!("system started");
    }

    fn spawn<T, F, Fut>(name: &'static str, component: Arc<T>, tick: F) -> PeriodicTask
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        PeriodicTask::start(name, TICK_PERIOD, move || {
            let component = component.clone();
            tick(component).instrument(info_span!("task", name))
        })
    }

    /// Polls the board's analog front end and one-wire probe once a
    /// second and pushes the readings through their sensors, since
    /// `Board::sample_analog`/`read_temperature` are pull-style in
    /// this trait rather than push-style (`spec.md` §6).
    fn spawn_sensor_poll(&self) -> PeriodicTask {
        let board = self.board.clone();
        let ph = self.ph_sensor.clone();
        let orp = self.orp_sensor.clone();
        let tds = self.tds_sensor.clone();
        let temperature = self.temperature_sensor.clone();
        let sand = self.sand_pressure_sensor.clone();
        let diatoms = self.diatoms_pressure_sensor.clone();
        let voltage = self.voltage_sensor.clone();
        let pump_current = self.pump_current_sensor.clone();
        let general_current = self.general_current_sensor.clone();

        PeriodicTask::start("sensor_poll", TICK_PERIOD, move || {
            let board = board.clone();
            let ph = ph.clone();
            let orp = orp.clone();
            let tds = tds.clone();
            let temperature = temperature.clone();
            let sand = sand.clone();
            let diatoms = diatoms.clone();
            let voltage = voltage.clone();
            let pump_current = pump_current.clone();
            let general_current = general_current.clone();

            async move {
                temperature
                    .add_value(board.read_temperature().map(Value::Float), true)
                    .await;

                let sample = board.sample_analog();
                ph.add_value(sample.ph.map(Value::Float), true).await;
                orp.add_value(sample.orp_mv.map(Value::Float), true).await;
                tds.add_value(sample.tds.map(Value::Float), true).await;
                sand.add_value(sample.sand_pressure.map(Value::Float), true)
                    .await;
                diatoms
                    .add_value(sample.diatoms_pressure.map(Value::Float), true)
                    .await;
                voltage.add_value(sample.voltage.map(Value::Float), true).await;
                pump_current
                    .add_value(sample.pump_current.map(Value::Float), true)
                    .await;
                general_current
                    .add_value(sample.general_current.map(Value::Float), true)
                    .await;
            }
            .instrument(info_span!("task", name = "sensor_poll"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolctl_api::board::AnalogSample;
    use poolctl_api::device::ActuatorId;

    use crate::algorithms::filter::FilterState;
    use crate::algorithms::level::LevelState;
    use crate::board_fake::FakeBoard;
    use crate::lightlink_fake::FakeLightLink;
    use crate::pool_config::PoolConfigOverrides;
    use crate::repository::MemoryRepository;

    /// Drains every `tokio::spawn`-based subscriber chain a sensor
    /// fan-out or a board edge can start. Several callbacks wired in
    /// `System::new`/`wire_board_edges` spawn rather than run inline
    /// (`Sensor::add_value`'s own fan-out is synchronous, but most of
    /// its subscribers aren't), so a single `yield_now` isn't always
    /// enough once those chains nest.
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn harness() -> (Arc<System>, Arc<FakeBoard>, Arc<FakeLightLink>) {
        let board = Arc::new(FakeBoard::new());
        let light_link = Arc::new(FakeLightLink::new());
        let repo = Arc::new(MemoryRepository::new());

        let cfg = Config {
            pool: PoolConfigOverrides {
                // The compiled-in filter window depends on the
                // wall-clock hour; widen it so these tests don't flake
                // depending on when the suite happens to run.
                daily_filter_allowed_hours: Some((0..24).collect()),
                sensor_refresh_minutes: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };

        let system = System::new(
            board.clone() as Arc<dyn Board>,
            light_link.clone() as Arc<dyn LightLink>,
            repo as Arc<dyn Repository>,
            &cfg,
        );
        (system, board, light_link)
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_leaves_every_actuator_off_and_out_of_emergency_stop() {
        let (system, board, _link) = harness();
        system.load_state().await;
        system.start();

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        assert!(!system.actuator.in_emergency_stop());
        for id in ActuatorId::ALL {
            assert!(!board.actuator_state(id), "{id:?} should start off");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_20_degree_reading_budgets_the_default_daily_filtering_window() {
        let (system, board, _link) = harness();
        system.load_state().await;
        system.start();

        board.set_temperature(Some(20.0));

        // One shortened water-refresh cycle (1 minute) plus a little
        // slack so the flush and the filter tick both land.
        tokio::time::advance(Duration::from_secs(65)).await;
        settle().await;

        // hydrodynamic_factor=15, recirculation_period=4 (compiled defaults)
        assert_eq!(system.filter_algorithm.total_daily_seconds_remaining(), 19_200);
        assert_eq!(system.filter_algorithm.state(), FilterState::Filtering);
        assert!(system.actuator.teoric_state(ActuatorId::FilterPump));
        assert!(board.actuator_state(ActuatorId::FilterPump));
    }

    #[tokio::test(start_paused = true)]
    async fn a_large_orp_error_doses_bleach_then_stops_at_zero_remaining() {
        let (system, board, _link) = harness();
        system.load_state().await;
        system.start();

        // Water needs to see a continuously running pump for a full
        // refresh interval before it calls itself valid.
        system
            .actuator
            .set_state(ActuatorId::FilterPump, true, true)
            .await
            .unwrap();
        board.set_analog_sample(AnalogSample {
            pump_current: Some(3.2),
            orp_mv: Some(450.0), // 200mV under the 650mV setpoint
            ..Default::default()
        });

        tokio::time::advance(Duration::from_secs(65)).await;
        settle().await;

        // Dosing should have started and be deep into the capped budget.
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        let injected = system.chemicals_algorithm.orp_injected_seconds();
        assert!(
            injected > 0 && injected <= 840,
            "expected a capped, in-progress dose, got {injected}"
        );
        assert!(board.actuator_state(ActuatorId::BleachPump));

        // Well past the point the full capped budget would have been spent.
        tokio::time::advance(Duration::from_secs(900)).await;
        settle().await;
        assert_eq!(system.chemicals_algorithm.orp_injected_seconds(), 0);
        assert!(!board.actuator_state(ActuatorId::BleachPump));
    }

    #[tokio::test(start_paused = true)]
    async fn an_empty_pool_fills_until_the_top_sensor_trips() {
        let (system, board, _link) = harness();
        system.load_state().await;
        system.start();

        // No water at the start-level sensor: the valve should open.
        board.fire_edge(EdgeSensor::WaterLevel(1), false);
        settle().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(system.level_algorithm.state(), LevelState::Filling);
        assert!(board.actuator_state(ActuatorId::FillValve));

        // Manufacture one check's worth of flow and trip the top
        // sensor (and, since the pool has now refilled, the start
        // sensor too, so the cycle doesn't immediately reopen).
        system.flow.set_daily_volume_for_test(0.5);
        board.fire_edge(EdgeSensor::WaterLevel(3), true);
        board.fire_edge(EdgeSensor::WaterLevel(1), true);
        settle().await;

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(!board.actuator_state(ActuatorId::FillValve), "valve closes for the check");

        // The cooperative wait between closing for a check and
        // reading the top sensor again.
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;

        assert_eq!(system.level_algorithm.state(), LevelState::WaitingForFill);
        assert!(!board.actuator_state(ActuatorId::FillValve));
        assert_eq!(system.level_algorithm.daily_filled_volume(), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn pressing_emergency_stop_cuts_interlocked_pumps_and_resuming_restores_them() {
        let (system, board, _link) = harness();
        system.load_state().await;
        system.start();

        system
            .actuator
            .set_state(ActuatorId::FilterPump, true, true)
            .await
            .unwrap();
        system
            .actuator
            .set_state(ActuatorId::BleachPump, true, true)
            .await
            .unwrap();
        system
            .actuator
            .set_state(ActuatorId::AcidPump, true, true)
            .await
            .unwrap();
        assert!(board.actuator_state(ActuatorId::FilterPump));

        // Active-low: pressing the button pulls the line low.
        board.fire_edge(EdgeSensor::EmergencyStop, false);
        settle().await;

        assert!(system.actuator.in_emergency_stop());
        assert!(!board.actuator_state(ActuatorId::FilterPump));
        assert!(!board.actuator_state(ActuatorId::BleachPump));
        assert!(!board.actuator_state(ActuatorId::AcidPump));
        assert_eq!(
            system
                .actuator
                .set_state(ActuatorId::FilterPump, true, true)
                .await,
            Err(poolctl_api::Error::EmergencyStop)
        );
        assert!(
            system.actuator.teoric_state(ActuatorId::FilterPump),
            "teoric state should survive the interlock so it can be replayed on resume"
        );

        // Releasing the button restores every teoric state.
        board.fire_edge(EdgeSensor::EmergencyStop, true);
        settle().await;

        assert!(!system.actuator.in_emergency_stop());
        assert!(board.actuator_state(ActuatorId::FilterPump));
        assert!(board.actuator_state(ActuatorId::BleachPump));
        assert!(board.actuator_state(ActuatorId::AcidPump));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_override_blocks_automatic_writes_until_re_enabled() {
        let (system, _board, _link) = harness();
        system.load_state().await;
        system.start();

        system
            .actuator
            .set_state(ActuatorId::FilterPump, false, false)
            .await
            .unwrap();
        assert!(!system.actuator.pump_automatic());

        assert_eq!(
            system
                .actuator
                .set_state(ActuatorId::FilterPump, true, true)
                .await,
            Err(poolctl_api::Error::ManualMode)
        );

        system.actuator.set_pump_automatic(true).await;
        system
            .actuator
            .set_state(ActuatorId::FilterPump, true, true)
            .await
            .unwrap();
        assert!(system.actuator.teoric_state(ActuatorId::FilterPump));
    }
}
