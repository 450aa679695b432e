//! `barotrack` - A barometric flight recorder
//!
//! This library fuses GPS fixes with barometric pressure into calibrated
//! altitude, derives vertical and ground speed from consecutive samples,
//! persists recordings in SQLite and exports them as GPX tracks.
//!
//! The [`SensorHandler`] owns the sensor sources and the recording state
//! machine; clients drive it through the typed [`channel`] and receive live
//! events. Persistence goes through the [`RecordingStore`] worker so sample
//! acquisition never waits on disk I/O.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod calibration;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod fusion;
pub mod handler;
pub mod logging;
pub mod recording;
pub mod sensors;
pub mod service;
pub mod storage;
pub mod store;
pub mod units;

pub use calibration::{CalibratedAltitude, CalibrationStore, CalibrationView};
pub use channel::{Client, Command, Envelope, Event, PositionUpdate};
pub use config::Config;
pub use error::{Error, FaultKind, Result};
pub use export::GpxExporter;
pub use fusion::FlightInfo;
pub use handler::{HandlerConfig, HandlerState, HandlerStatus, SensorHandler};
pub use logging::init_logging;
pub use recording::{NewEntry, Recording, RecordingEntry, RecordingWithEntries};
pub use sensors::{FeedSource, SensorKind, SensorReading, SensorSource, SensorSuite};
pub use service::FlightService;
pub use storage::{Storage, StorageStats};
pub use store::RecordingStore;
pub use units::{Distance, Pressure, Speed, Unit, UnitSystem, UnitValue};
