//! `barotrack` - CLI for the barometric flight recorder
//!
//! This binary records flights from sensor logs, manages stored recordings
//! and calibration, and exports tracks as GPX.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Local;
use clap::Parser;

use barotrack::cli::{
    AltitudeCommand, CalibrationCommand, Cli, Command, ConfigCommand, ExportCommand,
    RecordCommand, RecordingsCommand, StatusCommand,
};
use barotrack::sensors::load_readings;
use barotrack::{
    init_logging, CalibratedAltitude, CalibrationStore, Config, Envelope, Event, FeedSource,
    FlightService, GpxExporter, Pressure, RecordingStore, SensorKind, SensorReading, SensorSuite,
    Storage, UnitSystem, UnitValue,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone())?;

    match cli.command {
        Command::Record(cmd) => handle_record(&config, cmd).await,
        Command::Recordings(cmd) => handle_recordings(&config, cmd).await,
        Command::Export(cmd) => handle_export(&config, cmd).await,
        Command::Calibration(cmd) => handle_calibration(&config, cmd).await,
        Command::Altitude(cmd) => handle_altitude(&config, &cmd).await,
        Command::Status(cmd) => handle_status(&config, &cmd).await,
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

fn open_store(config: &Config) -> anyhow::Result<RecordingStore> {
    let path = config.database_path();
    let storage = Storage::open(&path)
        .with_context(|| format!("opening database {}", path.display()))?;
    let (store, _worker) = RecordingStore::spawn(storage)?;
    Ok(store)
}

fn print_event(event: Event, json: bool) {
    if json {
        match Envelope::Event(event).to_json() {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("Failed to encode event: {e}"),
        }
        return;
    }
    match event {
        Event::Position(update) => println!(
            "{}  {:>10.5} {:>10.5}  {:>7.1} m{}",
            update.timestamp.with_timezone(&Local).format("%H:%M:%S"),
            update.latitude,
            update.longitude,
            update.altitude,
            update
                .entry_id
                .map(|id| format!("  #{id}"))
                .unwrap_or_default()
        ),
        Event::FlightInfo(info) => println!("          {info}"),
        Event::RecordingStateChanged(status) => match status.recording_id {
            Some(id) => println!("[{}] recording {id}", status.state),
            None => println!("[{}]", status.state),
        },
        Event::SensorError { kind, message } => eprintln!("error ({kind:?}): {message}"),
    }
}

async fn handle_record(config: &Config, cmd: RecordCommand) -> anyhow::Result<()> {
    let readings = load_readings(&cmd.replay)
        .with_context(|| format!("reading sensor log {}", cmd.replay.display()))?;
    if readings.is_empty() {
        bail!("sensor log {} is empty", cmd.replay.display());
    }

    let gps = FeedSource::new(SensorKind::Gps);
    let barometer = FeedSource::new(SensorKind::Barometer);
    let sensors = SensorSuite::new(gps.clone()).with_barometer(barometer.clone());
    let service = FlightService::open(config, sensors).await?;

    let mut client = service.on_bind().await?;
    let status = client
        .send(barotrack::Command::StartRecording {
            name: cmd.name.clone(),
        })
        .await?;
    let recording_id = status
        .recording_id
        .context("handler did not report a recording id")?;

    let json = cmd.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = client.recv().await {
            print_event(event, json);
        }
    });

    let interval = Duration::from_millis(cmd.interval_ms);
    for reading in readings {
        let feed = match reading {
            SensorReading::Position(_) => &gps,
            SensorReading::Pressure(_) => &barometer,
        };
        feed.send(reading).await;
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    service
        .handler()
        .execute(barotrack::Command::StopRecording)
        .await?;
    service.store().flush().await?;
    let recording = service
        .store()
        .get_recording_with_entries(recording_id)
        .await?
        .context("recording disappeared")?;
    service.teardown().await?;
    let _ = printer.await;

    if !json {
        println!();
        println!(
            "Recorded {} points to recording {} ('{}')",
            recording.entries.len(),
            recording.recording.id,
            recording.recording.name
        );
    }
    Ok(())
}

async fn handle_recordings(config: &Config, cmd: RecordingsCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    match cmd {
        RecordingsCommand::List { json } => {
            let recordings = store.list_recordings().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&recordings)?);
            } else if recordings.is_empty() {
                println!("No recordings.");
            } else {
                println!("{:>6}  {:<19}  NAME", "ID", "CREATED");
                for recording in recordings {
                    println!(
                        "{:>6}  {:<19}  {}",
                        recording.id,
                        recording
                            .timestamp
                            .with_timezone(&Local)
                            .format("%Y-%m-%d %H:%M:%S"),
                        recording.name
                    );
                }
            }
        }
        RecordingsCommand::Show { id, units, json } => {
            let recording = store
                .get_recording_with_entries(id)
                .await?
                .with_context(|| format!("recording {id} not found"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&recording)?);
                return Ok(());
            }

            let units = UnitSystem::from(units);
            let length = UnitValue::base(recording.track_length()).convert(units.distance());
            println!("Recording {}", recording.recording.id);
            println!("-----------------");
            println!("Name:          {}", recording.recording.name);
            println!(
                "Created:       {}",
                recording
                    .recording
                    .timestamp
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
            );
            println!("Points:        {}", recording.entries.len());
            println!("Track length:  {length:.2}");
            if let Some(duration) = recording.duration() {
                println!(
                    "Duration:      {:02}:{:02}:{:02}",
                    duration.num_hours(),
                    duration.num_minutes() % 60,
                    duration.num_seconds() % 60
                );
            }
            if let Some(max) = recording.max_altitude() {
                let max = UnitValue::base(max).convert(units.altitude());
                println!("Max altitude:  {max:.0}");
            }
        }
        RecordingsCommand::Rename { id, name } => {
            let recording = store.rename_recording(id, name).await?;
            println!("Renamed recording {} to '{}'", recording.id, recording.name);
        }
        RecordingsCommand::Delete { ids } => {
            let removed = store.remove_recordings(ids).await?;
            println!("Deleted {removed} recording(s).");
        }
    }
    Ok(())
}

async fn handle_export(config: &Config, cmd: ExportCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let exporter = GpxExporter::new(config.export.creator.clone());
    let recording = store.get_recording_with_entries(cmd.id).await?;

    if cmd.output.as_deref() == Some(Path::new("-")) {
        let Some(document) = exporter.export(recording.as_ref()) else {
            bail!("recording {} not found", cmd.id);
        };
        print!("{document}");
        return Ok(());
    }

    let recording = recording.with_context(|| format!("recording {} not found", cmd.id))?;
    let path = cmd
        .output
        .unwrap_or_else(|| config.export_dir().join(format!("recording-{}.gpx", cmd.id)));
    exporter.write_to(&recording, &path)?;
    println!("Exported {} points to {}", recording.entries.len(), path.display());
    Ok(())
}

async fn handle_calibration(config: &Config, cmd: CalibrationCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    match cmd {
        CalibrationCommand::Show => match store.calibration().await? {
            Some(reference) => {
                println!("Pressure:   {:.2} hPa", reference.pressure);
                println!("Altitude:   {:.1} m", reference.altitude);
                println!(
                    "Calibrated: {}",
                    reference
                        .timestamp
                        .with_timezone(&Local)
                        .format("%Y-%m-%d %H:%M:%S")
                );
            }
            None => println!("Not calibrated."),
        },
        CalibrationCommand::Set {
            pressure,
            altitude,
            unit,
        } => {
            let hpa = UnitValue::new(pressure, Pressure::from(unit)).to_base();
            if !hpa.is_finite() || hpa <= 0.0 {
                bail!("pressure must be positive");
            }
            store
                .set_calibration(CalibratedAltitude::new(hpa, altitude))
                .await?;
            println!("Calibrated {hpa:.2} hPa at {altitude:.1} m");
        }
    }
    Ok(())
}

async fn handle_altitude(config: &Config, cmd: &AltitudeCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let calibration = CalibrationStore::with_reference(store.calibration().await?);
    let hpa = UnitValue::new(cmd.pressure, Pressure::from(cmd.unit)).to_base();

    match calibration.altitude_at(hpa) {
        Ok(altitude) => {
            let meters = UnitValue::base(altitude);
            let feet = meters.convert(UnitSystem::Imperial.altitude());
            println!("{meters:.1} ({feet:.0})");
            Ok(())
        }
        Err(e) if e.is_not_calibrated() => {
            bail!("not calibrated; run `barotrack calibration set PRESSURE ALTITUDE` first")
        }
        Err(e) => Err(e.into()),
    }
}

async fn handle_status(config: &Config, cmd: &StatusCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let stats = store.stats().await?;
    let calibration = store.calibration().await?;

    if cmd.json {
        let status = serde_json::json!({
            "database_path": config.database_path(),
            "db_size_bytes": stats.db_size_bytes,
            "total_recordings": stats.total_recordings,
            "total_entries": stats.total_entries,
            "newest_recording": stats.newest_recording,
            "calibration": calibration,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("barotrack status");
        println!("----------------");
        println!("Database:      {}", config.database_path().display());
        println!("Size:          {} bytes", stats.db_size_bytes);
        println!("Recordings:    {}", stats.total_recordings);
        println!("Entries:       {}", stats.total_entries);
        if let Some(newest) = stats.newest_recording {
            println!(
                "Newest:        {}",
                newest.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            );
        }
        match calibration {
            Some(reference) => println!(
                "Calibration:   {:.2} hPa at {:.1} m",
                reference.pressure, reference.altitude
            ),
            None => println!("Calibration:   none"),
        }
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!();
                println!("[Sensors]");
                println!("  Barometer:          {}", config.sensors.barometer_enabled);
                println!("  Reading buffer:     {}", config.sensors.reading_buffer);
                println!();
                println!("[Service]");
                println!("  Command buffer:     {}", config.service.command_buffer);
                println!();
                println!("[Recording]");
                println!("  Name format:        {}", config.recording.name_format);
                println!();
                println!("[Export]");
                println!("  Creator:            {}", config.export.creator);
                println!("  Output directory:   {}", config.export_dir().display());
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path: PathBuf = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
