//! Error types for barotrack.
//!
//! This module defines all error types used throughout the barotrack crate,
//! along with the [`FaultKind`] taxonomy that is surfaced to service clients.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handler::HandlerState;

/// The main error type for barotrack operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// Appending a sample failed even after retrying.
    #[error("failed to persist sample after {attempts} attempts: {message}")]
    PersistenceFailure {
        /// How many times the write was attempted.
        attempts: u32,
        /// The last underlying failure.
        message: String,
    },

    /// The referenced recording does not exist.
    #[error("recording {0} not found")]
    RecordingNotFound(i64),

    /// The recording store worker has shut down.
    #[error("recording store is closed")]
    StoreClosed,

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Sensor Errors ===
    /// Altitude was requested before any calibration reference exists.
    #[error("no calibration reference; calibrate before computing altitude")]
    NotCalibrated,

    /// A sensor is missing, denied, or failed to attach.
    #[error("sensor '{sensor}' unavailable: {reason}")]
    SensorUnavailable {
        /// Name of the sensor.
        sensor: String,
        /// Why it could not be used.
        reason: String,
    },

    /// A calibration reference with unusable values.
    #[error("invalid calibration: {message}")]
    InvalidCalibration {
        /// Which value was rejected.
        message: String,
    },

    /// Two samples were handed to fusion in the wrong order.
    #[error("samples are not in ascending time order")]
    NonMonotonicSamples,

    /// Two samples share a timestamp, so no rate can be derived.
    #[error("samples have identical timestamps")]
    ZeroTimeDelta,

    // === Service Errors ===
    /// A command is not valid in the handler's current state.
    #[error("cannot {action} while {state}")]
    InvalidStateTransition {
        /// The state the handler was in.
        state: HandlerState,
        /// The rejected action.
        action: &'static str,
    },

    /// The sensor handler is no longer running.
    #[error("sensor handler is not running")]
    HandlerStopped,

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for barotrack operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a sensor unavailable error.
    #[must_use]
    pub fn sensor_unavailable(sensor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SensorUnavailable {
            sensor: sensor.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state transition error.
    #[must_use]
    pub fn invalid_transition(state: HandlerState, action: &'static str) -> Self {
        Self::InvalidStateTransition { state, action }
    }

    /// Check if this error means calibration is missing.
    #[must_use]
    pub fn is_not_calibrated(&self) -> bool {
        matches!(self, Self::NotCalibrated)
    }

    /// Check if this error is a rejected state transition.
    #[must_use]
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidStateTransition { .. })
    }

    /// Classify this error for delivery to service clients.
    #[must_use]
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Self::NotCalibrated => FaultKind::NotCalibrated,
            Self::SensorUnavailable { .. } => FaultKind::SensorUnavailable,
            Self::NonMonotonicSamples | Self::ZeroTimeDelta => FaultKind::InvalidSamples,
            Self::InvalidStateTransition { .. } => FaultKind::InvalidStateTransition,
            Self::PersistenceFailure { .. }
            | Self::DatabaseOpen { .. }
            | Self::DatabaseQuery(_)
            | Self::DatabaseMigration { .. }
            | Self::RecordingNotFound(_)
            | Self::StoreClosed => FaultKind::PersistenceFailure,
            _ => FaultKind::Internal,
        }
    }
}

/// Error categories reported to clients as `SensorError` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Calibration is required first.
    NotCalibrated,
    /// A sensor could not be attached.
    SensorUnavailable,
    /// A sample pair could not be fused.
    InvalidSamples,
    /// A sample could not be written.
    PersistenceFailure,
    /// A command was rejected in the current state.
    InvalidStateTransition,
    /// Anything else.
    Internal,
}
