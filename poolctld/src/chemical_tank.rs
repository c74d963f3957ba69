//! A dosing tank's liter level. Grounded on
//! `original_source/src/models/chemicaltank.py`'s `ChemicalTank`.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use poolctl_api::device::{now_in, TankType, Timestamp};
use poolctl_api::repository::collections;
use poolctl_api::Repository;

/// `current_L` is allowed to go negative (`spec.md` §4.5): a tank that
/// runs dry is an operator-visible condition, not a panic.
pub struct ChemicalTank {
    tank_type: TankType,
    max_capacity_l: f64,
    tz: chrono_tz::Tz,
    repo: Arc<dyn Repository>,
    current_l: Mutex<f64>,
}

#[derive(Serialize)]
struct ChemicalTankRow {
    datetime: Timestamp,
    tank_type: TankType,
    current_liters: f64,
}

impl ChemicalTank {
    /// Starts at `max_capacity_l` pending `load_from_repository`.
    pub fn new(
        tank_type: TankType,
        max_capacity_l: f64,
        tz: chrono_tz::Tz,
        repo: Arc<dyn Repository>,
    ) -> Self {
        ChemicalTank {
            tank_type,
            max_capacity_l,
            tz,
            repo,
            current_l: Mutex::new(max_capacity_l),
        }
    }

    pub fn tank_type(&self) -> TankType {
        self.tank_type
    }

    pub fn current_liters(&self) -> f64 {
        *self.current_l.lock().unwrap()
    }

    pub fn max_capacity_liters(&self) -> f64 {
        self.max_capacity_l
    }

    /// Restores the most recently persisted level for this tank,
    /// falling back to full if nothing was ever saved.
    pub async fn load_from_repository(&self) {
        let key_value = match self.tank_type {
            TankType::Bleach => "Bleach",
            TankType::Acid => "Acid",
        };

        match self
            .repo
            .find_latest_keyed(collections::CHEMICAL_TANK_DATA, ("tank_type", key_value))
            .await
        {
            Ok(Some(rows)) => {
                if let Some(v) = rows.get("current_liters").and_then(|v| v.as_f64()) {
                    *self.current_l.lock().unwrap() = v;
                    info!(tank = ?self.tank_type, liters = v, "chemical tank level loaded");
                    return;
                }
                self.reset_to_full();
            }
            Ok(None) => self.reset_to_full(),
            Err(e) => {
                warn!(error = %e, "couldn't load chemical tank level, assuming full");
                self.reset_to_full();
            }
        }
    }

    fn reset_to_full(&self) {
        *self.current_l.lock().unwrap() = self.max_capacity_l;
    }

    pub async fn set_value(&self, value: f64) {
        *self.current_l.lock().unwrap() = value;
        info!(tank = ?self.tank_type, liters = value, "chemical tank level set");
        self.persist(value).await;
    }

    pub async fn decrease_value(&self, value: f64) {
        let new_value = {
            let mut l = self.current_l.lock().unwrap();
            *l -= value;
            *l
        };
        info!(
            tank = ?self.tank_type,
            decrement = value,
            remaining = new_value,
            "chemical tank level decreased"
        );
        self.persist(new_value).await;
    }

    pub async fn refill(&self) {
        self.set_value(self.max_capacity_l).await;
        info!(tank = ?self.tank_type, "chemical tank refilled");
    }

    async fn persist(&self, current_liters: f64) {
        let row = ChemicalTankRow {
            datetime: now_in(self.tz),
            tank_type: self.tank_type,
            current_liters,
        };
        let Ok(row) = serde_json::to_value(&row) else {
            return;
        };
        let key_value = match self.tank_type {
            TankType::Bleach => "Bleach",
            TankType::Acid => "Acid",
        };
        if let Err(e) = self
            .repo
            .upsert_single(
                collections::CHEMICAL_TANK_DATA,
                Some(("tank_type", key_value)),
                row,
            )
            .await
        {
            warn!(error = %e, "couldn't persist chemical tank level");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    fn tank() -> ChemicalTank {
        ChemicalTank::new(
            TankType::Bleach,
            25.0,
            chrono_tz::Europe::Madrid,
            Arc::new(MemoryRepository::new()),
        )
    }

    #[tokio::test]
    async fn starts_full() {
        let t = tank();
        assert_eq!(t.current_liters(), 25.0);
    }

    #[tokio::test]
    async fn decrease_can_go_negative() {
        let t = tank();
        t.decrease_value(30.0).await;
        assert_eq!(t.current_liters(), -5.0);
    }

    #[tokio::test]
    async fn refill_restores_max_capacity() {
        let t = tank();
        t.decrease_value(10.0).await;
        t.refill().await;
        assert_eq!(t.current_liters(), 25.0);
    }

    #[tokio::test]
    async fn load_from_repository_restores_persisted_level() {
        let repo = Arc::new(MemoryRepository::new());
        let t = ChemicalTank::new(TankType::Acid, 25.0, chrono_tz::Europe::Madrid, repo.clone());
        t.set_value(12.5).await;

        let reloaded = ChemicalTank::new(TankType::Acid, 25.0, chrono_tz::Europe::Madrid, repo);
        reloaded.load_from_repository().await;
        assert_eq!(reloaded.current_liters(), 12.5);
    }

    #[tokio::test]
    async fn load_from_repository_with_nothing_saved_stays_full() {
        let t = tank();
        t.load_from_repository().await;
        assert_eq!(t.current_liters(), 25.0);
    }
}
