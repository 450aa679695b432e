//! Command-line interface for barotrack.
//!
//! This module provides the CLI structure for the `barotrack` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    AltitudeCommand, CalibrationCommand, ConfigCommand, ExportCommand, PressureArg, RecordCommand,
    RecordingsCommand, StatusCommand, UnitsArg,
};

/// barotrack - Barometric flight recorder
///
/// Records GPS tracks with barometric altitude, keeps them in a local
/// database and exports them as GPX.
#[derive(Debug, Parser)]
#[command(name = "barotrack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Record a flight by replaying a sensor log
    Record(RecordCommand),

    /// Browse and manage recordings
    #[command(subcommand)]
    Recordings(RecordingsCommand),

    /// Export a recording as GPX
    Export(ExportCommand),

    /// Show or set the altitude calibration
    #[command(subcommand)]
    Calibration(CalibrationCommand),

    /// Compute calibrated altitude for a pressure
    Altitude(AltitudeCommand),

    /// Show database and calibration status
    Status(StatusCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        crate::logging::Verbosity::from_flags(self.verbose, self.quiet)
    }
}
