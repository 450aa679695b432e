//! Derived flight metrics from pairs of samples.
//!
//! Everything here is a pure function of its inputs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::recording::RecordingEntry;
use crate::units::{Distance, Speed, UnitValue};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A snapshot of derived flight metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlightInfo {
    /// Vertical speed in m/s; negative when sinking.
    pub ascending_speed: f64,
    /// Horizontal speed in km/h.
    pub ground_speed: f64,
    /// Altitude of the newer sample in meters.
    pub altitude: f64,
}

impl FlightInfo {
    /// Vertical speed as a typed value.
    #[must_use]
    pub fn ascending_speed(&self) -> UnitValue<Speed> {
        UnitValue::new(self.ascending_speed, Speed::MetersPerSecond)
    }

    /// Ground speed as a typed value.
    #[must_use]
    pub fn ground_speed(&self) -> UnitValue<Speed> {
        UnitValue::new(self.ground_speed, Speed::KilometersPerHour)
    }

    /// Altitude as a typed value.
    #[must_use]
    pub fn altitude(&self) -> UnitValue<Distance> {
        UnitValue::new(self.altitude, Distance::Meter)
    }
}

// Values are truncated toward zero, not rounded.
impl fmt::Display for FlightInfo {
    #[allow(clippy::cast_possible_truncation)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} m/s | {} km/h | {} m",
            self.ascending_speed.trunc() as i64,
            self.ground_speed.trunc() as i64,
            self.altitude.trunc() as i64
        )
    }
}

/// Great-circle distance in meters between two lat/lon points given in degrees.
#[must_use]
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Initial great-circle bearing from `first` to `second`, in degrees `[0, 360)`.
#[must_use]
pub fn bearing(first: &RecordingEntry, second: &RecordingEntry) -> f64 {
    let phi1 = first.latitude.to_radians();
    let phi2 = second.latitude.to_radians();
    let dlambda = (second.longitude - first.longitude).to_radians();

    let y = dlambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlambda.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

/// Altitude gained (or lost, if negative) between two samples.
#[must_use]
pub fn altitude_delta(first: &RecordingEntry, second: &RecordingEntry) -> f64 {
    second.altitude - first.altitude
}

/// Seconds elapsed from `first` to `second`.
///
/// # Errors
///
/// Returns [`Error::ZeroTimeDelta`] for identical timestamps and
/// [`Error::NonMonotonicSamples`] when `second` is older than `first`.
pub fn elapsed_seconds(first: &RecordingEntry, second: &RecordingEntry) -> Result<f64> {
    let delta = second.timestamp - first.timestamp;
    let Some(micros) = delta.num_microseconds() else {
        return Err(Error::internal("sample interval out of range"));
    };
    match micros {
        0 => Err(Error::ZeroTimeDelta),
        m if m < 0 => Err(Error::NonMonotonicSamples),
        #[allow(clippy::cast_precision_loss)]
        m => Ok(m as f64 / 1_000_000.0),
    }
}

/// Derive vertical and ground speed from two time-ordered samples.
///
/// # Errors
///
/// Fails when the samples are not strictly ascending in time; see
/// [`elapsed_seconds`]. Callers should discard such pairs.
pub fn fuse(first: &RecordingEntry, second: &RecordingEntry) -> Result<FlightInfo> {
    let seconds = elapsed_seconds(first, second)?;
    let distance = haversine(
        first.latitude,
        first.longitude,
        second.latitude,
        second.longitude,
    );

    Ok(FlightInfo {
        ascending_speed: altitude_delta(first, second) / seconds,
        ground_speed: distance / seconds * 3600.0 / 1000.0,
        altitude: second.altitude,
    })
}
