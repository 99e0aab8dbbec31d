//! Transport adapter
//!
//! Owns the single persistent Socket.IO connection to the agent service and
//! exposes a named publish/subscribe surface over it.
//!
//! # Architecture
//!
//! ```text
//!  MissionSession           TransportAdapter              Agent server
//!        │                        │                            │
//!        ├──send("start_agent")──►├──42["start_agent",..]────►│
//!        │                        │◄──42["log",..]────────────┤
//!        │◄──on("log") handler────┤                            │
//!        │◄──on("disconnect")─────┤    (reconnect w/ backoff)  │
//! ```
//!
//! Reconnection happens inside the adapter. Consumers only observe it as
//! repeated `connect` / `disconnect` pseudo-events, each tagged with the
//! connection epoch it belongs to.

mod adapter;
mod options;
mod registry;

pub use adapter::TransportAdapter;
pub use options::{ReconnectPolicy, TransportOptions};
pub use registry::{EventHandler, InboundEvent};
