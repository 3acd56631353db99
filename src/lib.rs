//! # Labwire
//!
//! Model-driven device graphs for hardware-in-the-loop testing:
//! - A YAML model names one device and the transports it exposes
//! - The builder turns the model into live objects with process-unique identities
//! - The registry tracks them, hands out re-resolving views and reconciles
//!   instances dropped behind its back
//! - Network transports run their I/O on a session thread behind two queues
//!
//! Supported media:
//! - TCP/UDP sockets (queued session or direct)
//! - Serial ports
//! - Telnet
//! - SSH-2 (libssh2)
//! - Bluetooth LE
//! - SocketCAN, spidev and i2c-dev on Linux
//!
//! ## Example
//!
//! ```rust,no_run
//! use labwire::Workbench;
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let bench = Workbench::new()?;
//!     let psu = bench.load_str(
//!         "Device:\n  name: psu\n  interfaces:\n    Socket:\n      name: CTRL\n      host: 127.0.0.1\n      port: 5025\n",
//!     )?;
//!
//!     let ctrl = psu.transport("CTRL")?;
//!     ctrl.connect()?;
//!     ctrl.write(b"*IDN?\n")?;
//!     let reply = ctrl.read_timeout(Some(Duration::from_secs(1)))?;
//!     println!("{}", String::from_utf8_lossy(&reply));
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod capability;
pub mod config;
pub mod device;
pub mod identity;
pub mod logging;
pub mod model;
pub mod registry;
pub mod transport;
pub mod workbench;

// Re-exports for convenience
pub use crate::builder::{BuildError, Builder, ModelSource};
pub use crate::capability::{Capability, CapabilityError, CapabilityRegistry, CapabilitySet};
pub use crate::config::{ConfigError, ConfigStore, GlobalSettings, LoggingSettings, SessionSettings};
pub use crate::device::{Device, DeviceError, DeviceFields};
pub use crate::identity::{IdentityError, Uid};
pub use crate::model::{ModelDocument, ModelError};
pub use crate::registry::{
    DeviceHandle, DeviceView, HandleError, Registry, RegistryEntry, RegistryError, Resolved,
    TransportView, VerifyReport,
};
pub use crate::transport::{
    ConnectionState, SessionState, ThreadedSession, Transport, TransportError, TransportKind,
    TransportNode, TransportStats,
};
pub use crate::workbench::{Workbench, WorkbenchError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
