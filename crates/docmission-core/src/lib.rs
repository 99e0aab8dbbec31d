//! docmission-core - mission session client for the documentation agent
//!
//! Hands a local project folder to a remote agent service, follows the
//! mission over a live event stream, and latches the generated document.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use docmission_core::{ClientConfig, MissionSession, MissionStatus};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::load(&ClientConfig::default_path());
//!     let mut session = MissionSession::new(config.transport_options());
//!     session.connect(&config.server_url)?;
//!     session.wait_for_connection(Duration::from_secs(10)).await;
//!
//!     session.start("/path/to/project")?;
//!     while session.mission_status() == MissionStatus::Awaiting {
//!         session.next_update().await;
//!     }
//!
//!     if let Some(doc) = session.document() {
//!         println!("{}", doc.content);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod mission;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ClientConfig;
pub use error::{LaunchError, ProtocolError, TransportError};
pub use mission::{transition, MissionChange, MissionEvent, MissionInput, MissionMachine};
pub use session::{MissionSession, SessionUpdate};
pub use transport::{InboundEvent, ReconnectPolicy, TransportAdapter, TransportOptions};
pub use types::*;
