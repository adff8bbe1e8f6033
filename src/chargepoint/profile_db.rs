//! Installed charging profiles.
//!
//! Three lists keyed by purpose, each holding `(connector id, profile)`
//! pairs sorted by stack level descending so the highest-priority profile
//! is found first. Mutations are written through to the persistent store;
//! the in-memory lists are authoritative at runtime.

use std::sync::Arc;

use tracing::{debug, error};

use crate::messages::types::{ChargingProfile, ChargingProfilePurposeType};
use crate::storage::PersistentStore;

pub type ChargingProfileList = Vec<(u32, ChargingProfile)>;

pub struct ProfileDatabase {
    store: Arc<dyn PersistentStore>,
    max_installed: usize,
    charge_point_max: ChargingProfileList,
    tx_default: ChargingProfileList,
    tx: ChargingProfileList,
}

impl ProfileDatabase {
    /// Create the database, loading the persisted profiles.
    pub async fn new(store: Arc<dyn PersistentStore>, max_installed: usize) -> Self {
        let mut db = Self {
            store,
            max_installed,
            charge_point_max: Vec::new(),
            tx_default: Vec::new(),
            tx: Vec::new(),
        };
        match db.store.profiles_load().await {
            Ok(profiles) => {
                for (connector_id, profile) in profiles {
                    db.insert(connector_id, profile);
                }
            }
            Err(e) => error!(error = %e, "Could not load persisted charging profiles"),
        }
        db
    }

    pub fn charge_point_max_profiles(&self) -> &ChargingProfileList {
        &self.charge_point_max
    }

    pub fn tx_default_profiles(&self) -> &ChargingProfileList {
        &self.tx_default
    }

    pub fn tx_profiles(&self) -> &ChargingProfileList {
        &self.tx
    }

    pub fn count(&self) -> usize {
        self.charge_point_max.len() + self.tx_default.len() + self.tx.len()
    }

    /// Install a profile, replacing any profile with the same
    /// (connector, purpose, stack level). Fails when the database is full.
    pub async fn install(&mut self, connector_id: u32, profile: ChargingProfile) -> bool {
        // Same (connector, purpose, stackLevel) replaces; same id replaces.
        let removed = self.remove_where(|c, p| {
            p.charging_profile_id == profile.charging_profile_id
                || (*c == connector_id
                    && p.charging_profile_purpose == profile.charging_profile_purpose
                    && p.stack_level == profile.stack_level)
        });
        for profile_id in &removed {
            if let Err(e) = self.store.profiles_delete(*profile_id).await {
                error!(profile_id, error = %e, "Could not delete replaced profile");
            }
        }

        if self.count() >= self.max_installed {
            debug!(
                profile_id = profile.charging_profile_id,
                "Profile database full"
            );
            return false;
        }

        if let Err(e) = self
            .store
            .profiles_store(connector_id, profile.clone())
            .await
        {
            error!(error = %e, "Could not persist charging profile");
        }
        self.insert(connector_id, profile);
        true
    }

    /// Remove profiles matching the given filters; absent filters match
    /// everything. Returns true when at least one profile was removed.
    pub async fn clear(
        &mut self,
        profile_id: Option<i32>,
        connector_id: Option<u32>,
        purpose: Option<ChargingProfilePurposeType>,
        stack_level: Option<u32>,
    ) -> bool {
        let removed = self.remove_where(|c, p| {
            profile_id.map_or(true, |id| p.charging_profile_id == id)
                && connector_id.map_or(true, |cid| *c == cid)
                && purpose.map_or(true, |pp| p.charging_profile_purpose == pp)
                && stack_level.map_or(true, |sl| p.stack_level == sl)
        });
        for profile_id in &removed {
            if let Err(e) = self.store.profiles_delete(*profile_id).await {
                error!(profile_id, error = %e, "Could not delete profile");
            }
        }
        !removed.is_empty()
    }

    /// Remove a single profile by id.
    pub async fn clear_by_id(&mut self, profile_id: i32) -> bool {
        self.clear(Some(profile_id), None, None, None).await
    }

    /// Bind pending Tx profiles (no transaction id yet) of a connector to
    /// a started transaction.
    pub async fn assign_pending_tx_profiles(&mut self, connector_id: u32, transaction_id: i32) {
        for (c, profile) in self.tx.iter_mut() {
            if *c == connector_id && profile.transaction_id.is_none() {
                profile.transaction_id = Some(transaction_id);
                if let Err(e) = self.store.profiles_store(*c, profile.clone()).await {
                    error!(error = %e, "Could not persist Tx profile assignment");
                }
            }
        }
    }

    fn list_mut(&mut self, purpose: ChargingProfilePurposeType) -> &mut ChargingProfileList {
        match purpose {
            ChargingProfilePurposeType::ChargePointMaxProfile => &mut self.charge_point_max,
            ChargingProfilePurposeType::TxDefaultProfile => &mut self.tx_default,
            ChargingProfilePurposeType::TxProfile => &mut self.tx,
        }
    }

    fn insert(&mut self, connector_id: u32, profile: ChargingProfile) {
        let list = self.list_mut(profile.charging_profile_purpose);
        list.push((connector_id, profile));
        // Highest stack level first; ties broken by profile id for a
        // deterministic scan order.
        list.sort_by(|(_, a), (_, b)| {
            b.stack_level
                .cmp(&a.stack_level)
                .then(a.charging_profile_id.cmp(&b.charging_profile_id))
        });
    }

    fn remove_where(&mut self, predicate: impl Fn(&u32, &ChargingProfile) -> bool) -> Vec<i32> {
        let mut removed = Vec::new();
        for list in [
            &mut self.charge_point_max,
            &mut self.tx_default,
            &mut self.tx,
        ] {
            list.retain(|(c, p)| {
                if predicate(c, p) {
                    removed.push(p.charging_profile_id);
                    false
                } else {
                    true
                }
            });
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::types::{
        ChargingProfileKindType, ChargingRateUnitType, ChargingSchedule, ChargingSchedulePeriod,
    };
    use crate::storage::InMemoryStore;

    pub(crate) fn profile(
        id: i32,
        purpose: ChargingProfilePurposeType,
        stack_level: u32,
    ) -> ChargingProfile {
        ChargingProfile {
            charging_profile_id: id,
            transaction_id: None,
            stack_level,
            charging_profile_purpose: purpose,
            charging_profile_kind: ChargingProfileKindType::Relative,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            charging_schedule: ChargingSchedule {
                duration: None,
                start_schedule: None,
                charging_rate_unit: ChargingRateUnitType::A,
                charging_schedule_period: vec![ChargingSchedulePeriod {
                    start_period: 0,
                    limit: 16.0,
                    number_phases: None,
                }],
                min_charging_rate: None,
            },
        }
    }

    async fn db(max: usize) -> ProfileDatabase {
        ProfileDatabase::new(Arc::new(InMemoryStore::new()), max).await
    }

    #[tokio::test]
    async fn lists_sorted_by_stack_level_descending() {
        let mut db = db(10).await;
        db.install(1, profile(1, ChargingProfilePurposeType::TxDefaultProfile, 1))
            .await;
        db.install(1, profile(2, ChargingProfilePurposeType::TxDefaultProfile, 5))
            .await;
        db.install(1, profile(3, ChargingProfilePurposeType::TxDefaultProfile, 3))
            .await;
        let levels: Vec<u32> = db
            .tx_default_profiles()
            .iter()
            .map(|(_, p)| p.stack_level)
            .collect();
        assert_eq!(levels, vec![5, 3, 1]);
    }

    #[tokio::test]
    async fn same_slot_replaces() {
        let mut db = db(10).await;
        assert!(
            db.install(1, profile(1, ChargingProfilePurposeType::TxDefaultProfile, 2))
                .await
        );
        assert!(
            db.install(1, profile(2, ChargingProfilePurposeType::TxDefaultProfile, 2))
                .await
        );
        assert_eq!(db.count(), 1);
        assert_eq!(db.tx_default_profiles()[0].1.charging_profile_id, 2);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let mut db = db(2).await;
        assert!(
            db.install(1, profile(1, ChargingProfilePurposeType::TxDefaultProfile, 1))
                .await
        );
        assert!(
            db.install(1, profile(2, ChargingProfilePurposeType::TxDefaultProfile, 2))
                .await
        );
        assert!(
            !db.install(1, profile(3, ChargingProfilePurposeType::TxDefaultProfile, 3))
                .await
        );
    }

    #[tokio::test]
    async fn clear_with_no_filter_clears_all() {
        let mut db = db(10).await;
        db.install(0, profile(1, ChargingProfilePurposeType::ChargePointMaxProfile, 1))
            .await;
        db.install(1, profile(2, ChargingProfilePurposeType::TxDefaultProfile, 1))
            .await;
        assert!(db.clear(None, None, None, None).await);
        assert_eq!(db.count(), 0);
    }

    #[tokio::test]
    async fn clear_by_purpose_and_connector() {
        let mut db = db(10).await;
        db.install(1, profile(1, ChargingProfilePurposeType::TxProfile, 1))
            .await;
        db.install(2, profile(2, ChargingProfilePurposeType::TxProfile, 1))
            .await;
        assert!(
            db.clear(None, Some(1), Some(ChargingProfilePurposeType::TxProfile), None)
                .await
        );
        assert_eq!(db.count(), 1);
        assert_eq!(db.tx_profiles()[0].0, 2);
    }

    #[tokio::test]
    async fn pending_tx_profiles_are_assigned() {
        let mut db = db(10).await;
        db.install(1, profile(1, ChargingProfilePurposeType::TxProfile, 1))
            .await;
        db.assign_pending_tx_profiles(1, 99).await;
        assert_eq!(db.tx_profiles()[0].1.transaction_id, Some(99));
    }

    #[tokio::test]
    async fn persisted_profiles_survive_reload() {
        let store = Arc::new(InMemoryStore::new());
        {
            let mut db = ProfileDatabase::new(store.clone(), 10).await;
            db.install(1, profile(7, ChargingProfilePurposeType::TxDefaultProfile, 4))
                .await;
        }
        let db = ProfileDatabase::new(store, 10).await;
        assert_eq!(db.count(), 1);
        assert_eq!(db.tx_default_profiles()[0].1.charging_profile_id, 7);
    }
}
