//! Protocol message types for control-channel communication.
//!
//! Every frame is a JSON [`Frame`] naming an event:
//! - [`Inbound`] - Messages received from the control plane
//! - [`Outbound`] - Messages sent to the control plane
//!
//! Also provides type-safe ID wrappers for compile-time safety.

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;
