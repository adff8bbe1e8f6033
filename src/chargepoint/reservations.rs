//! Connector reservations.
//!
//! At most one reservation per connector. Expired reservations are
//! released by a periodic tick which restores the connector to Available.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use super::connectors::Connectors;
use crate::config::OcppConfig;
use crate::messages::reservation::{
    CancelReservationRequest, CancelReservationResponse, ReserveNowRequest, ReserveNowResponse,
};
use crate::messages::types::{
    CancelReservationStatus, ChargePointStatus, ReservationStatus,
};

#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: i32,
    pub connector_id: u32,
    pub id_tag: String,
    pub parent_id_tag: Option<String>,
    pub expiry_date: DateTime<Utc>,
}

/// Notified when a reservation changes a connector's status; the runtime
/// turns these into StatusNotification messages.
pub trait ReservationObserver: Send + Sync {
    fn connector_status_changed(&self, connector_id: u32, status: ChargePointStatus);
}

pub struct ReservationManager {
    ocpp_config: Arc<OcppConfig>,
    connectors: Arc<Connectors>,
    reservations: DashMap<i32, Reservation>,
}

impl ReservationManager {
    pub fn new(ocpp_config: Arc<OcppConfig>, connectors: Arc<Connectors>) -> Arc<Self> {
        Arc::new(Self {
            ocpp_config,
            connectors,
            reservations: DashMap::new(),
        })
    }

    pub fn handle_reserve_now(
        &self,
        request: ReserveNowRequest,
        observer: &dyn ReservationObserver,
    ) -> ReserveNowResponse {
        info!(
            reservation_id = request.reservation_id,
            connector_id = request.connector_id,
            "ReserveNow requested"
        );

        let status = self.reserve(request, observer);
        info!(?status, "ReserveNow status");
        ReserveNowResponse { status }
    }

    fn reserve(
        &self,
        request: ReserveNowRequest,
        observer: &dyn ReservationObserver,
    ) -> ReservationStatus {
        if request.connector_id == 0 && !self.ocpp_config.reserve_connector_zero_supported() {
            return ReservationStatus::Rejected;
        }
        let Some(connector) = self.connectors.get(request.connector_id) else {
            return ReservationStatus::Unavailable;
        };

        // Replacing one's own reservation is allowed.
        let replacing = connector.reservation_id == Some(request.reservation_id);
        match connector.status {
            ChargePointStatus::Available => {}
            ChargePointStatus::Reserved if replacing => {}
            ChargePointStatus::Faulted => return ReservationStatus::Faulted,
            ChargePointStatus::Unavailable => return ReservationStatus::Unavailable,
            _ => return ReservationStatus::Occupied,
        }

        if let Some(existing) = connector.reservation_id {
            if existing != request.reservation_id {
                return ReservationStatus::Occupied;
            }
            self.reservations.remove(&existing);
        }

        self.connectors.with_mut(request.connector_id, |c| {
            c.reservation_id = Some(request.reservation_id);
            if request.connector_id != 0 {
                c.status = ChargePointStatus::Reserved;
            }
        });
        if request.connector_id != 0 {
            observer.connector_status_changed(request.connector_id, ChargePointStatus::Reserved);
        }

        self.reservations.insert(
            request.reservation_id,
            Reservation {
                reservation_id: request.reservation_id,
                connector_id: request.connector_id,
                id_tag: request.id_tag,
                parent_id_tag: request.parent_id_tag,
                expiry_date: request.expiry_date,
            },
        );
        ReservationStatus::Accepted
    }

    pub fn handle_cancel_reservation(
        &self,
        request: CancelReservationRequest,
        observer: &dyn ReservationObserver,
    ) -> CancelReservationResponse {
        info!(reservation_id = request.reservation_id, "CancelReservation requested");
        let status = if self.release(request.reservation_id, observer) {
            CancelReservationStatus::Accepted
        } else {
            CancelReservationStatus::Rejected
        };
        info!(?status, "CancelReservation status");
        CancelReservationResponse { status }
    }

    /// Release a reservation; returns false for an unknown id.
    pub fn release(&self, reservation_id: i32, observer: &dyn ReservationObserver) -> bool {
        let Some((_, reservation)) = self.reservations.remove(&reservation_id) else {
            return false;
        };
        self.connectors.with_mut(reservation.connector_id, |c| {
            c.reservation_id = None;
            if c.status == ChargePointStatus::Reserved {
                c.status = ChargePointStatus::Available;
            }
        });
        if reservation.connector_id != 0 {
            observer
                .connector_status_changed(reservation.connector_id, ChargePointStatus::Available);
        }
        true
    }

    /// The reservation a transaction on `connector_id` with `id_tag`
    /// would consume, when the tag (or its parent) owns it.
    pub fn matching_reservation(
        &self,
        connector_id: u32,
        id_tag: &str,
        parent_id_tag: &str,
    ) -> Option<i32> {
        self.reservations.iter().find_map(|r| {
            let matches_connector = r.connector_id == connector_id || r.connector_id == 0;
            let matches_tag = r.id_tag == id_tag
                || (!parent_id_tag.is_empty() && r.parent_id_tag.as_deref() == Some(parent_id_tag));
            (matches_connector && matches_tag).then_some(r.reservation_id)
        })
    }

    /// A reservation held by someone else, blocking `id_tag` on this
    /// connector.
    pub fn blocking_reservation(
        &self,
        connector_id: u32,
        id_tag: &str,
        parent_id_tag: &str,
    ) -> bool {
        let Some(connector) = self.connectors.get(connector_id) else {
            return false;
        };
        let Some(reservation_id) = connector.reservation_id else {
            return false;
        };
        let Some(reservation) = self.reservations.get(&reservation_id) else {
            return false;
        };
        let owns = reservation.id_tag == id_tag
            || (!parent_id_tag.is_empty()
                && reservation.parent_id_tag.as_deref() == Some(parent_id_tag));
        !owns
    }

    /// Release every expired reservation.
    pub fn expire_tick(&self, observer: &dyn ReservationObserver) {
        let now = Utc::now();
        let expired: Vec<i32> = self
            .reservations
            .iter()
            .filter(|r| r.expiry_date <= now)
            .map(|r| r.reservation_id)
            .collect();
        for reservation_id in expired {
            debug!(reservation_id, "Reservation expired");
            self.release(reservation_id, observer);
        }
    }

    /// Periodic expiry sweep; owned by the role runtime.
    pub fn spawn_expiry_task(
        self: &Arc<Self>,
        observer: Arc<dyn ReservationObserver>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            tick.tick().await;
            loop {
                tick.tick().await;
                manager.expire_tick(observer.as_ref());
            }
        })
    }
}
