//! OCPP-J RPC transport: framing, sessions, client and server endpoints.

pub mod client;
pub mod frame;
pub mod server;
pub mod session;

pub use client::{ClientConfig, ClientListener, RpcClient};
pub use frame::{Frame, FrameError, RpcErrorCode};
pub use server::{RpcServer, RpcServerHandler, ServerConfig, SessionSetup};
pub use session::{run_transport, RpcError, RpcSession, RpcSpy, SessionObserver};

/// WebSocket subprotocol identifier for OCPP 1.6-J.
pub const OCPP16_SUBPROTOCOL: &str = "ocpp1.6";
