//! DevTools protocol session for the Helmsman engine.
//!
//! One [`CdpSession`] owns one browser connection: a transport actor holding
//! the WebSocket, an event pump publishing raw protocol events onto the bus,
//! a tab registry, and the navigation/evaluation helpers the dispatcher and
//! perceiver build on. Transport loss is fatal to the session by design;
//! reconnection is the caller's decision.

mod config;
mod error;
mod launcher;
mod session;
mod tabs;
mod transport;

pub use config::SessionConfig;
pub use error::SessionError;
pub use session::{CdpSession, ProtocolClient};
pub use tabs::TabInfo;
pub use transport::{ChromiumTransport, CommandTarget, Transport};
