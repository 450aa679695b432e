//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::units::{Pressure, UnitSystem};

/// Record command arguments.
#[derive(Debug, Args)]
pub struct RecordCommand {
    /// JSON-lines sensor log to replay through the recorder
    #[arg(long, value_name = "FILE")]
    pub replay: PathBuf,

    /// Name for the new recording
    #[arg(short, long)]
    pub name: Option<String>,

    /// Delay between replayed readings in milliseconds
    #[arg(long, default_value = "0")]
    pub interval_ms: u64,

    /// Print events as JSON envelopes
    #[arg(short, long)]
    pub json: bool,
}

/// Recording management commands.
#[derive(Debug, Subcommand)]
pub enum RecordingsCommand {
    /// List all recordings, newest first
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show a recording and its summary
    Show {
        /// Recording ID
        id: i64,

        /// Unit system for the summary
        #[arg(short, long, value_enum, default_value = "metric")]
        units: UnitsArg,

        /// Output as JSON, including all entries
        #[arg(short, long)]
        json: bool,
    },

    /// Rename a recording
    Rename {
        /// Recording ID
        id: i64,

        /// New name
        name: String,
    },

    /// Delete recordings and their entries
    Delete {
        /// Recording IDs
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

/// Export command arguments.
#[derive(Debug, Args)]
pub struct ExportCommand {
    /// Recording ID
    pub id: i64,

    /// Output file, or `-` for stdout.
    /// Defaults to `recording-<ID>.gpx` in the export directory.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Calibration commands.
#[derive(Debug, Subcommand)]
pub enum CalibrationCommand {
    /// Show the stored calibration reference
    Show,

    /// Store a new calibration reference
    #[command(allow_negative_numbers = true)]
    Set {
        /// Pressure at the reference point
        pressure: f64,

        /// True altitude of the reference point in meters
        altitude: f64,

        /// Unit of the pressure argument
        #[arg(long, value_enum, default_value = "hpa")]
        unit: PressureArg,
    },
}

/// Altitude command arguments.
#[derive(Debug, Args)]
pub struct AltitudeCommand {
    /// Current pressure
    pub pressure: f64,

    /// Unit of the pressure argument
    #[arg(long, value_enum, default_value = "hpa")]
    pub unit: PressureArg,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Unit system argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum UnitsArg {
    /// Meters, km/h, m/s
    #[default]
    Metric,
    /// Feet, mph, ft/min
    Imperial,
}

impl From<UnitsArg> for UnitSystem {
    fn from(arg: UnitsArg) -> Self {
        match arg {
            UnitsArg::Metric => Self::Metric,
            UnitsArg::Imperial => Self::Imperial,
        }
    }
}

/// Pressure unit argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum PressureArg {
    /// Hectopascals (millibars)
    #[default]
    Hpa,
    /// Kilopascals
    Kpa,
    /// Inches of mercury
    Inhg,
}

impl From<PressureArg> for Pressure {
    fn from(arg: PressureArg) -> Self {
        match arg {
            PressureArg::Hpa => Self::Hectopascal,
            PressureArg::Kpa => Self::Kilopascal,
            PressureArg::Inhg => Self::InchOfMercury,
        }
    }
}
