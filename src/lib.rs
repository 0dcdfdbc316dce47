//! # Virtual BMV
//!
//! Emulates a VE.Direct BMV-602S battery monitor on a Venus OS bus so that
//! a GX device accepts battery telemetry from another source (typically a
//! Signal K server) as if it came from genuine hardware.
//!
//! ## Features
//!
//! - **Bus emulation**: `com.victronenergy.BusItem` objects with `GetValue`,
//!   `SetValue` and `GetText`
//! - **Typed properties**: each property's type is fixed at registration
//! - **Periodic sampling**: telemetry copied in on a timer, misses fall back
//!   to zero and are reported in the status line
//! - **Clean lifecycle**: every start is fully reversible on stop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use virtual_bmv::bus::TcpBus;
//! use virtual_bmv::config::BridgeOptions;
//! use virtual_bmv::plugin::VirtualBmvPlugin;
//! use virtual_bmv::status::TracingSink;
//! use virtual_bmv::telemetry::SharedTelemetry;
//!
//! # async fn demo() -> Result<(), virtual_bmv::error::BridgeError> {
//! let telemetry = SharedTelemetry::new();
//! telemetry.set("electrical.batteries.0.voltage", 12.6);
//!
//! let mut plugin = VirtualBmvPlugin::new(TcpBus, Arc::new(telemetry), Arc::new(TracingSink));
//! plugin.start(&BridgeOptions::default()).await?;
//! // ...
//! plugin.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`value`] - Tagged property values
//! - [`property`] - Single bus-visible property objects
//! - [`registry`] - Property set of one device, export/unexport
//! - [`sampler`] - Telemetry-to-property refresh and status summary
//! - [`session`] - Connection lifecycle and the sampling task
//! - [`bus`] - Transport traits plus in-memory and TCP relay transports
//! - [`device`] - The BMV-602S path table
//! - [`plugin`] - Host-facing start/stop surface

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod plugin;
pub mod property;
pub mod registry;
pub mod sampler;
pub mod session;
pub mod status;
pub mod telemetry;
pub mod value;

// Re-export main public types for convenience
pub use error::{BridgeError, ConfigError, TransportError};
pub use plugin::VirtualBmvPlugin;
pub use session::{BridgeSession, SessionState};
pub use value::{Value, ValueTag};
