//! Barometric calibration.
//!
//! Altitude is derived from pressure relative to a single reference pair
//! captured on the ground. The formula is differential: it ignores absolute
//! sea-level pressure and temperature, so accuracy drops with large excursions
//! from the calibration point and as the weather drifts over time.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Exponent of the international barometric formula.
const BAROMETRIC_EXPONENT: f64 = 1.0 / 5.255;

/// Scale height term of the international barometric formula, in meters.
const BAROMETRIC_SCALE_M: f64 = 44_330.0;

/// The calibration reference: pressure observed at a known altitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibratedAltitude {
    /// Pressure at calibration time, in hPa.
    pub pressure: f64,
    /// True altitude at calibration time, in meters.
    pub altitude: f64,
    /// When the calibration was taken.
    pub timestamp: DateTime<Utc>,
}

impl CalibratedAltitude {
    /// Create a reference stamped with the current time.
    #[must_use]
    pub fn new(pressure: f64, altitude: f64) -> Self {
        Self {
            pressure,
            altitude,
            timestamp: Utc::now(),
        }
    }
}

/// Altitude in meters for `current_pressure` relative to `reference`.
///
/// Returns exactly `reference.altitude` when the pressures are equal.
#[must_use]
pub fn compute_altitude(current_pressure: f64, reference: &CalibratedAltitude) -> f64 {
    BAROMETRIC_SCALE_M * (1.0 - (current_pressure / reference.pressure).powf(BAROMETRIC_EXPONENT))
        + reference.altitude
}

/// Single-slot holder for the active calibration.
///
/// Cloning shares the slot. Writers replace the whole value under an
/// exclusive lock, so readers never see a half-written reference.
#[derive(Debug, Clone, Default)]
pub struct CalibrationStore {
    slot: Arc<RwLock<Option<CalibratedAltitude>>>,
}

impl CalibrationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-loaded with a reference.
    #[must_use]
    pub fn with_reference(reference: Option<CalibratedAltitude>) -> Self {
        Self {
            slot: Arc::new(RwLock::new(reference)),
        }
    }

    /// The current reference, if any.
    #[must_use]
    pub fn get(&self) -> Option<CalibratedAltitude> {
        *self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the reference and return it.
    pub fn set(&self, pressure: f64, altitude: f64) -> CalibratedAltitude {
        let reference = CalibratedAltitude::new(pressure, altitude);
        self.replace(reference);
        reference
    }

    /// Replace the reference with an existing value.
    pub fn replace(&self, reference: CalibratedAltitude) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(reference);
    }

    /// Whether a reference exists.
    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.get().is_some()
    }

    /// Altitude for a live pressure reading.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotCalibrated`] when no reference has been set.
    pub fn altitude_at(&self, pressure: f64) -> Result<f64> {
        self.get()
            .map(|reference| compute_altitude(pressure, &reference))
            .ok_or(Error::NotCalibrated)
    }

    /// A read-only handle onto this slot.
    #[must_use]
    pub fn view(&self) -> CalibrationView {
        CalibrationView(self.clone())
    }
}

/// Read access to a [`CalibrationStore`] whose writes go elsewhere.
///
/// The sensor handler hands these out so that every change to the live
/// reference also reaches the database.
#[derive(Debug, Clone)]
pub struct CalibrationView(CalibrationStore);

impl CalibrationView {
    /// The current reference, if any.
    #[must_use]
    pub fn get(&self) -> Option<CalibratedAltitude> {
        self.0.get()
    }

    /// Whether a reference exists.
    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.0.is_calibrated()
    }

    /// Altitude for a live pressure reading.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotCalibrated`] when no reference has been set.
    pub fn altitude_at(&self, pressure: f64) -> Result<f64> {
        self.0.altitude_at(pressure)
    }
}
