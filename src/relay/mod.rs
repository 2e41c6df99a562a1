//! Live relay between the run reporter and a viewer
//!
//! The [`broker`] holds the two connection slots, the [`server`] exposes it
//! over websockets, and the [`reporter`] is the driver's client side.

pub mod broker;
pub mod protocol;
pub mod reporter;
pub mod server;

pub use broker::Broker;
pub use protocol::{Message, Role};
pub use reporter::Reporter;
pub use server::RelayServer;
