//! Connector state.
//!
//! Connector 0 addresses the whole charge point; physical connectors are
//! numbered from 1. A transaction is active iff `transaction_id != 0`.

use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::messages::types::ChargePointStatus;

#[derive(Debug, Clone)]
pub struct Connector {
    pub id: u32,
    pub status: ChargePointStatus,
    pub transaction_id: i32,
    pub transaction_start: Option<DateTime<Utc>>,
    pub transaction_id_tag: Option<String>,
    pub reservation_id: Option<i32>,
}

impl Connector {
    fn new(id: u32) -> Self {
        Self {
            id,
            status: ChargePointStatus::Available,
            transaction_id: 0,
            transaction_start: None,
            transaction_id_tag: None,
            reservation_id: None,
        }
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction_id != 0
    }
}

/// All connectors of a charge point, snapshot-readable from any task.
pub struct Connectors {
    slots: Vec<RwLock<Connector>>,
}

impl Connectors {
    /// `count` physical connectors plus connector 0.
    pub fn new(count: u32) -> Self {
        Self {
            slots: (0..=count).map(|id| RwLock::new(Connector::new(id))).collect(),
        }
    }

    /// Number of physical connectors (connector 0 excluded).
    pub fn count(&self) -> u32 {
        (self.slots.len() - 1) as u32
    }

    pub fn is_valid(&self, id: u32) -> bool {
        (id as usize) < self.slots.len()
    }

    /// Snapshot copy of a connector.
    pub fn get(&self, id: u32) -> Option<Connector> {
        self.slots
            .get(id as usize)
            .map(|slot| slot.read().unwrap().clone())
    }

    /// Mutate a connector in place; returns `None` for an unknown id.
    pub fn with_mut<T>(&self, id: u32, f: impl FnOnce(&mut Connector) -> T) -> Option<T> {
        self.slots
            .get(id as usize)
            .map(|slot| f(&mut slot.write().unwrap()))
    }

    /// Snapshot of every connector, connector 0 included.
    pub fn all(&self) -> Vec<Connector> {
        self.slots
            .iter()
            .map(|slot| slot.read().unwrap().clone())
            .collect()
    }

    /// Connector currently running `transaction_id`, if any.
    pub fn find_by_transaction(&self, transaction_id: i32) -> Option<Connector> {
        self.all()
            .into_iter()
            .find(|c| c.transaction_id == transaction_id && transaction_id != 0)
    }

    /// Connector holding `reservation_id`, if any.
    pub fn find_by_reservation(&self, reservation_id: i32) -> Option<Connector> {
        self.all()
            .into_iter()
            .find(|c| c.reservation_id == Some(reservation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_zero_plus_physical() {
        let connectors = Connectors::new(2);
        assert_eq!(connectors.count(), 2);
        assert!(connectors.is_valid(0));
        assert!(connectors.is_valid(2));
        assert!(!connectors.is_valid(3));
    }

    #[test]
    fn transaction_lookup() {
        let connectors = Connectors::new(2);
        connectors.with_mut(1, |c| {
            c.transaction_id = 77;
            c.transaction_start = Some(Utc::now());
        });
        assert_eq!(connectors.find_by_transaction(77).unwrap().id, 1);
        assert!(connectors.find_by_transaction(0).is_none());
    }
}
