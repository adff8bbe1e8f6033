//! # ocpp-runtime
//!
//! OCPP 1.6-J runtime library. Lets an application play any of the three
//! roles of an EV charging network:
//!
//! - **Charge Point** ([`chargepoint::ChargePoint`]): the station.
//!   Connects out to a central system, runs the boot/heartbeat lifecycle,
//!   transactions, local authorization, reservations and smart charging.
//! - **Central System** ([`centralsystem::CentralSystem`]): the back
//!   end. Accepts charge-point connections and exposes one typed proxy
//!   per station.
//! - **Local Controller** ([`localcontroller::LocalController`]): a
//!   bidirectional proxy pairing each charge-point connection with an
//!   outbound central-system connection.
//!
//! The layers underneath are usable on their own: [`rpc`] implements the
//! OCPP-J framing and the symmetric call/response discipline over
//! WebSocket, [`messages`] the typed payloads, JSON-schema validation and
//! action dispatch, [`storage`] the durable-state seam and [`config`] the
//! stack settings plus the OCPP configuration-key registry.

pub mod centralsystem;
pub mod chargepoint;
pub mod config;
pub mod localcontroller;
pub mod messages;
pub mod rpc;
pub mod storage;

pub use centralsystem::{CentralSystem, CentralSystemEvents, ChargePointProxy};
pub use chargepoint::{ChargePoint, ChargePointEventsHandler};
pub use config::{
    CentralSystemSettings, ChargePointSettings, LocalControllerSettings, OcppConfig,
};
pub use localcontroller::{LocalController, LocalControllerEvents, ProxyPair};
pub use messages::{MessageDispatcher, MessagesValidator, Request};
pub use rpc::{Frame, RpcError, RpcErrorCode, RpcSpy, OCPP16_SUBPROTOCOL};
pub use storage::{InMemoryStore, PersistentStore};
