//! # HV Battery Monitoring Unit
//!
//! Monitors a high-voltage traction pack over the vehicle bus and drives the
//! main contactors.
//!
//! ## Features
//!
//! - **Segmented transport**: request/first-frame/flow-control/consecutive-frame
//!   exchange with the battery controller, cycling through four report groups
//! - **Telemetry decoding**: pack, cell, extreme and temperature readings
//!   decoded into typed measurements and emitted as sequenced records
//! - **Safety evaluation**: two-tier limits on the guarded metrics, published
//!   as boolean flags
//! - **Contactor interlock**: pre-charge, grace delay and an emergency-open
//!   path that runs even when the controller task fails
//! - **Simulation**: an in-memory bus and a simulated controller with
//!   deterministic fault injection
//!
//! ## Quick Start
//!
//! ```no_run
//! use hvbmu::{BmuConfig, MemoryBus, Monitor, RecordingActuator, TracingSink};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), hvbmu::MonitorError> {
//! let (host, _device) = MemoryBus::pair();
//! let (transmit, receive) = host.split();
//! let monitor = Monitor::new(
//!     BmuConfig::default(),
//!     transmit,
//!     receive,
//!     Arc::new(RecordingActuator::new()),
//!     TracingSink,
//! )?;
//! let handle = monitor.start();
//! handle.registry().set_enable(true);
//! let summary = handle.shutdown().await?;
//! println!("{:?}", summary.session);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - Frame type and the bus port abstraction
//! - [`protocol`] - Segmented transport session
//! - [`telemetry`] - Decoder and telemetry sinks
//! - [`safety`] - Threshold evaluation
//! - [`status`] - Shared flags, enable signal and contactor state
//! - [`contactor`] - Contactor state machine and controller task
//! - [`monitor`] - Task wiring
//! - [`supervisor`] - JSON command interface
//! - [`sim`] - Simulated battery controller
//! - [`config`] - Runtime configuration

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

extern crate alloc;

pub mod bus;
pub mod config;
pub mod contactor;
pub mod monitor;
pub mod protocol;
pub mod safety;
pub mod sim;
pub mod status;
pub mod supervisor;
pub mod telemetry;

pub use bus::{BusPort, BusReceiver, Frame, MemoryBus};
pub use config::BmuConfig;
pub use contactor::{ActuatorSink, ContactorController, ContactorLogic, RecordingActuator};
pub use monitor::{Monitor, MonitorError, MonitorHandle};
pub use protocol::{ReportGroup, TransportSession};
pub use safety::{check_max, check_min, SafetyEvaluator};
pub use status::{ContactorState, Metric, StatusRegistry};
pub use telemetry::{JsonLinesSink, MemorySink, TelemetrySink, TracingSink};
