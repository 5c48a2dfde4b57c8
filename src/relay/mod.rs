//! Reverse-tunnel relay subsystem.
//!
//! - `ControlLink` - One outbound control connection with ack correlation
//! - `HttpRelay` - Proxied HTTP calls with replay cache, retries, and a deadline
//! - `WebSocketRelay` - Bridges remote WebSocket sessions to local sockets
//! - `TunnelEndpoint` - A named link wired to its relays
//! - [`TunnelSupervisor`] - Keeps endpoints connected under a [`ReconnectPolicy`]
//! - [`PrimaryControlChannel`] - Registration, heartbeat, and bandwidth tests

mod cache;
mod endpoint;
mod http_relay;
mod identity;
mod link;
mod policy;
mod primary;
mod supervisor;
mod ws_relay;

#[cfg(test)]
pub(crate) mod testutil;

pub use endpoint::ConnectOutcome;
pub use http_relay::{LocalHttp, ReqwestLocalHttp};
pub use identity::{bootstrap_identity, NodeIdentity, SystemReport};
pub use policy::ReconnectPolicy;
pub use primary::{PrimaryControlChannel, PrimarySettings};
pub use supervisor::TunnelSupervisor;
