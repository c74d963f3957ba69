//! Abstraction over the persistent document store. `spec.md` §4.2
//! treats the real store as opaque; components serialize their own
//! snapshot structs into a `Row` and hand them to this trait.
//!
//! Every method that talks to the backend returns
//! `Result<_, Error::StoreUnavailable>` on failure. Callers must
//! swallow that error and continue on in-memory state (`spec.md` §7)
//! -- this trait only describes the failure, it doesn't decide how
//! callers react to it.

use async_trait::async_trait;
use serde_json::Value as Row;

use crate::error::Result;

/// Names of the collections enumerated in `spec.md` §6.
pub mod collections {
    pub const SENSOR_DATA: &str = "sensor_data";
    pub const CHEMICAL_TANK_DATA: &str = "chemical_tank_data";
    pub const ACTUATOR_CONTROL_DATA: &str = "actuator_control_data";
    pub const POOL_CONFIG_DATA: &str = "pool_config_data";
    pub const FILTER_ALGORITHM_DATA: &str = "filter_algorithm_data";
    pub const CHEMICALS_ALGORITHM_DATA: &str = "chemicals_algorithm_data";
    pub const LEVEL_ALGORITHM_DATA: &str = "level_algorithm_data";
    pub const LIGHTS_ALGORITHM_DATA: &str = "lights_algorithm_data";
    pub const FLOW_DATA: &str = "flow_data";
    pub const WATER_DATA: &str = "water_data";
    pub const FILTER_DATA: &str = "filter_data";
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Returns the row with the greatest `datetime` in `collection`,
    /// or `None` if the collection is empty.
    async fn find_latest(&self, collection: &str) -> Result<Option<Row>>;

    /// Like `find_latest`, but restricted to rows whose `key.0` field
    /// equals `key.1` -- used by collections that multiplex several
    /// logical single-row records by a discriminant (each chemical
    /// tank's `tank_type`).
    async fn find_latest_keyed(
        &self,
        collection: &str,
        key: (&str, &str),
    ) -> Result<Option<Row>>;

    /// Replaces the single row of a single-row collection (actuator
    /// control, pool config, each algorithm snapshot, each chemical
    /// tank keyed by `tank_type`) with `row`. `key` selects which
    /// existing row to replace when a collection holds more than one
    /// logical "single row" (e.g. one per `tank_type`); pass `None`
    /// for collections that only ever hold one row at all.
    async fn upsert_single(
        &self,
        collection: &str,
        key: Option<(&str, &str)>,
        row: Row,
    ) -> Result<()>;

    /// Appends a new row (`sensor_data`, day-change snapshots).
    async fn insert(&self, collection: &str, row: Row) -> Result<()>;
}
