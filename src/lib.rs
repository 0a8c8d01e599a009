#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Fitbridge
//!
//! A Rust library that bridges Bluetooth Low Energy fitness equipment to a uniform
//! metric model.
//!
//! Each supported machine is described by a [`ProtocolProfile`]: its service and
//! characteristic UUIDs, its frame format, its command set and the initialization
//! sequence it expects. A [`DeviceSession`] drives one machine end to end:
//!
//! - **Discovery**: scan, match advertised names, bind to the strongest candidate
//! - **Connection supervision**: reconnect after every drop once a link existed
//! - **Telemetry**: decode fixed-frame or flag-variable frames into a [`MetricSet`]
//! - **Control**: queue resistance, speed, incline and fan requests and write them
//!   one frame per tick, waiting for acknowledgement where the profile expects one
//! - **Heart rate**: merge readings from the machine, a belt or the platform
//!
//! Sessions are built with a [`SessionBuilder`] and observed or commanded through its
//! [`SessionHandle`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use fitbridge::{ble::BleTransport, profile::SPORTSTECH_BIKE, OperatorCommand, SessionBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BleTransport::new().await?);
//!     let (session, handle) = SessionBuilder::new(&SPORTSTECH_BIKE, transport).build();
//!     let task = tokio::spawn(session.run());
//!
//!     handle.request(OperatorCommand::TargetResistance(8))?;
//!     println!("{:?}", handle.metrics());
//!
//!     handle.shutdown();
//!     let summary = task.await??;
//!     println!("{} samples recorded", summary.lines.len());
//!     Ok(())
//! }
//! ```

/// External heart-rate belt bridging
pub mod belt;
/// Bluetooth Low Energy transport
pub mod ble;
/// Device session and its handle
pub mod device;
/// Service and characteristic discovery
pub mod discovery;
/// Command queueing and acknowledgement
pub mod dispatch;
/// Error types and handling
pub mod error;
/// Metric aggregation and session history
pub mod metrics;
/// Virtual peripheral contract
pub mod peripheral;
/// Per-device protocol descriptions
pub mod profile;
/// Frame codecs
pub mod protocol;
/// Scan and reconnect policy
pub mod supervisor;
/// Transport abstraction over the BLE stack
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use device::{DeviceSession, SessionBuilder, SessionHandle};
pub use error::{BridgeError, Result};
pub use profile::ProtocolProfile;
pub use transport::{Transport, TransportEvent};
pub use types::{
    BridgeSettings, ConnectionParams, DeviceCandidate, DeviceClass, EmulationKind,
    HeartRateSample, HeartRateSource, MetricSet, OperatorCommand, SessionLine, SessionState,
    SessionSummary,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
