//! Typed physical quantities.
//!
//! Each unit family is a closed enum whose variants carry a conversion factor
//! to the family's base unit. [`UnitValue`] pairs a magnitude with one of those
//! variants and converts between them by going through the base unit.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A family of units sharing one base unit.
pub trait Unit: Copy + PartialEq + fmt::Debug {
    /// The canonical unit of this family.
    const BASE: Self;

    /// How many base units one of `self` is worth.
    fn factor(self) -> f64;

    /// Short display label, e.g. `"km"`.
    fn label(self) -> &'static str;
}

/// Length units. Base: meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distance {
    /// Meters.
    Meter,
    /// Kilometers.
    Kilometer,
    /// International feet.
    Foot,
    /// Statute miles.
    Mile,
    /// Nautical miles.
    NauticalMile,
}

impl Unit for Distance {
    const BASE: Self = Self::Meter;

    fn factor(self) -> f64 {
        match self {
            Self::Meter => 1.0,
            Self::Kilometer => 1000.0,
            Self::Foot => 0.3048,
            Self::Mile => 1609.344,
            Self::NauticalMile => 1852.0,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Meter => "m",
            Self::Kilometer => "km",
            Self::Foot => "ft",
            Self::Mile => "mi",
            Self::NauticalMile => "nm",
        }
    }
}

/// Speed units. Base: meters per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speed {
    /// Meters per second.
    MetersPerSecond,
    /// Kilometers per hour.
    KilometersPerHour,
    /// Statute miles per hour.
    MilesPerHour,
    /// Nautical miles per hour.
    Knot,
    /// Feet per minute, common for vertical speed.
    FeetPerMinute,
}

impl Unit for Speed {
    const BASE: Self = Self::MetersPerSecond;

    fn factor(self) -> f64 {
        match self {
            Self::MetersPerSecond => 1.0,
            Self::KilometersPerHour => 1000.0 / 3600.0,
            Self::MilesPerHour => 1609.344 / 3600.0,
            Self::Knot => 1852.0 / 3600.0,
            Self::FeetPerMinute => 0.3048 / 60.0,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::MetersPerSecond => "m/s",
            Self::KilometersPerHour => "km/h",
            Self::MilesPerHour => "mph",
            Self::Knot => "kt",
            Self::FeetPerMinute => "ft/min",
        }
    }
}

/// Pressure units. Base: hectopascal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pressure {
    /// Hectopascals (numerically equal to millibars).
    Hectopascal,
    /// Kilopascals.
    Kilopascal,
    /// Inches of mercury.
    InchOfMercury,
}

impl Unit for Pressure {
    const BASE: Self = Self::Hectopascal;

    fn factor(self) -> f64 {
        match self {
            Self::Hectopascal => 1.0,
            Self::Kilopascal => 10.0,
            Self::InchOfMercury => 33.863_886_666_7,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Hectopascal => "hPa",
            Self::Kilopascal => "kPa",
            Self::InchOfMercury => "inHg",
        }
    }
}

/// An immutable magnitude tagged with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitValue<U> {
    value: f64,
    unit: U,
}

impl<U: Unit> UnitValue<U> {
    /// Create a new value.
    #[must_use]
    pub const fn new(value: f64, unit: U) -> Self {
        Self { value, unit }
    }

    /// Create a value expressed in the base unit.
    #[must_use]
    pub fn base(value: f64) -> Self {
        Self::new(value, U::BASE)
    }

    /// The magnitude in this value's own unit.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// The unit tag.
    #[must_use]
    pub const fn unit(&self) -> U {
        self.unit
    }

    /// The magnitude expressed in the family's base unit.
    #[must_use]
    pub fn to_base(&self) -> f64 {
        self.value * self.unit.factor()
    }

    /// Convert to another unit of the same family.
    #[must_use]
    pub fn convert(&self, to: U) -> Self {
        Self::new(self.to_base() / to.factor(), to)
    }
}

impl<U: Unit> fmt::Display for UnitValue<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match f.precision() {
            Some(p) => write!(f, "{:.*} {}", p, self.value, self.unit.label()),
            None => write!(f, "{} {}", self.value, self.unit.label()),
        }
    }
}

/// Which unit set the CLI renders quantities in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSystem {
    /// Meters, km/h and m/s.
    #[default]
    Metric,
    /// Feet, mph and ft/min.
    Imperial,
}

impl UnitSystem {
    /// Unit for altitudes.
    #[must_use]
    pub const fn altitude(self) -> Distance {
        match self {
            Self::Metric => Distance::Meter,
            Self::Imperial => Distance::Foot,
        }
    }

    /// Unit for track lengths.
    #[must_use]
    pub const fn distance(self) -> Distance {
        match self {
            Self::Metric => Distance::Kilometer,
            Self::Imperial => Distance::Mile,
        }
    }

    /// Unit for horizontal speed.
    #[must_use]
    pub const fn ground_speed(self) -> Speed {
        match self {
            Self::Metric => Speed::KilometersPerHour,
            Self::Imperial => Speed::MilesPerHour,
        }
    }

    /// Unit for vertical speed.
    #[must_use]
    pub const fn vertical_speed(self) -> Speed {
        match self {
            Self::Metric => Speed::MetersPerSecond,
            Self::Imperial => Speed::FeetPerMinute,
        }
    }
}
