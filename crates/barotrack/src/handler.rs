//! The sensor handler.
//!
//! A single task owns the sensor sources, the current state and the client
//! registry. Sensor readings and client messages are serialized through it,
//! readings first, so every fix is handled in arrival order and a command
//! never observes a half-processed fix.
//!
//! ```text
//!            bind / StartSensors          StartRecording
//!   Idle  ------------------------>  Listening  ------------>  Recording
//!         <------------------------            <------------
//!          last unbind / StopSensors               StopRecording
//! ```
//!
//! While recording, each fix is queued on the [`RecordingStore`]. A follower
//! task awaits the commits in queue order and hands them back to the handler,
//! which then broadcasts the persisted position and the [`FlightInfo`]
//! derived from it and the previous entry.
//!
//! [`FlightInfo`]: crate::fusion::FlightInfo

use std::fmt;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::calibration::{CalibratedAltitude, CalibrationStore, CalibrationView};
use crate::channel::{Client, ClientId, ClientRegistry, Command, Event, PositionUpdate};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fusion;
use crate::recording::NewEntry;
use crate::sensors::{PositionFix, PressureReading, SensorReading, SensorSuite};
use crate::store::{AppendOutcome, Pending, RecordingStore};

/// Pattern used for unnamed recordings when none is configured.
pub const DEFAULT_NAME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Lifecycle state of the sensor handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    /// Sensors detached.
    Idle,
    /// Sensors attached; samples are streamed but not stored.
    Listening,
    /// Sensors attached; samples are stored in a recording.
    Recording,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Listening => write!(f, "listening"),
            Self::Recording => write!(f, "recording"),
        }
    }
}

/// Snapshot of the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerStatus {
    /// Current state.
    pub state: HandlerState,
    /// The active recording, only set while recording.
    pub recording_id: Option<i64>,
    /// Number of bound clients.
    pub clients: usize,
}

impl HandlerStatus {
    /// Whether a recording is in progress.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.state == HandlerState::Recording
    }
}

/// Tuning for the sensor handler.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Attach the barometer when one is available.
    pub barometer_enabled: bool,
    /// Capacity of the sensor reading queue.
    pub reading_buffer: usize,
    /// Capacity of the client message queue.
    pub command_buffer: usize,
    /// `strftime` pattern for default recording names, in local time.
    pub name_format: String,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            barometer_enabled: true,
            reading_buffer: 256,
            command_buffer: 32,
            name_format: DEFAULT_NAME_FORMAT.to_string(),
        }
    }
}

impl From<&Config> for HandlerConfig {
    fn from(config: &Config) -> Self {
        Self {
            barometer_enabled: config.sensors.barometer_enabled,
            reading_buffer: config.sensors.reading_buffer,
            command_buffer: config.service.command_buffer,
            name_format: config.recording.name_format.clone(),
        }
    }
}

enum Message {
    Execute {
        command: Command,
        reply: oneshot::Sender<Result<HandlerStatus>>,
    },
    Bind {
        reply: oneshot::Sender<(ClientId, mpsc::UnboundedReceiver<Event>)>,
    },
    Unbind {
        id: ClientId,
        reply: oneshot::Sender<HandlerStatus>,
    },
    Status {
        reply: oneshot::Sender<HandlerStatus>,
    },
    Committed(Result<AppendOutcome>),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running sensor handler.
///
/// Clones address the same handler.
#[derive(Debug, Clone)]
pub struct SensorHandler {
    tx: mpsc::Sender<Message>,
    calibration: CalibrationView,
}

impl SensorHandler {
    /// Start a handler over `sensors`, persisting to `store`.
    ///
    /// The persisted calibration reference is loaded before the handler
    /// accepts messages. The handler starts [`HandlerState::Idle`].
    ///
    /// # Errors
    ///
    /// Returns an error if the calibration cannot be read from the store.
    pub async fn spawn(
        store: RecordingStore,
        sensors: SensorSuite,
        config: HandlerConfig,
    ) -> Result<Self> {
        let calibration = CalibrationStore::with_reference(store.calibration().await?);
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();

        tokio::spawn(follow_commits(pending_rx, tx.downgrade()));

        let actor = Actor {
            store,
            sensors,
            config,
            calibration: calibration.clone(),
            clients: ClientRegistry::default(),
            state: HandlerState::Idle,
            recording_id: None,
            explicit_start: false,
            readings: None,
            last_pressure: None,
            last_fix: None,
            uncalibrated_reported: false,
            pending: Some(pending_tx),
        };
        tokio::spawn(actor.run(rx));

        Ok(Self {
            tx,
            calibration: calibration.view(),
        })
    }

    async fn request<T>(&self, message: impl FnOnce(oneshot::Sender<T>) -> Message) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(message(reply))
            .await
            .map_err(|_| Error::HandlerStopped)?;
        rx.await.map_err(|_| Error::HandlerStopped)
    }

    /// Run a command and return the resulting status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] for commands not allowed in
    /// the current state, the underlying failure for sensor, store or
    /// calibration problems, or [`Error::HandlerStopped`].
    pub async fn execute(&self, command: Command) -> Result<HandlerStatus> {
        self.request(|reply| Message::Execute { command, reply })
            .await?
    }

    /// Bind a new client. The first client attaches the sensors.
    ///
    /// A sensor failure during attach is reported on the client's event
    /// stream rather than as an error here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerStopped`] if the handler is gone.
    pub async fn bind(&self) -> Result<Client> {
        let (id, events) = self.request(|reply| Message::Bind { reply }).await?;
        Ok(Client::new(id, events, self.clone()))
    }

    /// Release a client. The last release detaches the sensors unless they
    /// were started explicitly or a recording is running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerStopped`] if the handler is gone.
    pub async fn unbind(&self, id: ClientId) -> Result<HandlerStatus> {
        self.request(|reply| Message::Unbind { id, reply }).await
    }

    /// Current status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerStopped`] if the handler is gone.
    pub async fn status(&self) -> Result<HandlerStatus> {
        self.request(|reply| Message::Status { reply }).await
    }

    /// Whether a recording is in progress.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerStopped`] if the handler is gone.
    pub async fn is_recording(&self) -> Result<bool> {
        Ok(self.status().await?.is_recording())
    }

    /// Read access to the live calibration.
    ///
    /// Changes go through [`Command::Calibrate`] so they are persisted too.
    #[must_use]
    pub fn calibration(&self) -> &CalibrationView {
        &self.calibration
    }

    /// Detach sensors, close any recording and wait for queued writes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerStopped`] if the handler already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Message::Shutdown { reply }).await
    }
}

/// Forward store commits to the handler in the order they were queued.
async fn follow_commits(
    mut pending: mpsc::UnboundedReceiver<Pending<AppendOutcome>>,
    handler: mpsc::WeakSender<Message>,
) {
    while let Some(commit) = pending.recv().await {
        let outcome = commit.await.unwrap_or(Err(Error::StoreClosed));
        let Some(tx) = handler.upgrade() else {
            break;
        };
        if tx.send(Message::Committed(outcome)).await.is_err() {
            break;
        }
    }
    trace!("Commit follower stopped");
}

/// Whether `format` is a usable `strftime` pattern.
pub(crate) fn is_valid_name_format(format: &str) -> bool {
    !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

fn default_name(format: &str) -> String {
    let now = Local::now();
    if is_valid_name_format(format) {
        now.format(format).to_string()
    } else {
        warn!("Invalid recording name format '{}', using default", format);
        now.format(DEFAULT_NAME_FORMAT).to_string()
    }
}

async fn next_reading(readings: &mut Option<mpsc::Receiver<SensorReading>>) -> Option<SensorReading> {
    match readings {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct Actor {
    store: RecordingStore,
    sensors: SensorSuite,
    config: HandlerConfig,
    calibration: CalibrationStore,
    clients: ClientRegistry,
    state: HandlerState,
    recording_id: Option<i64>,
    explicit_start: bool,
    readings: Option<mpsc::Receiver<SensorReading>>,
    last_pressure: Option<PressureReading>,
    last_fix: Option<DateTime<Utc>>,
    /// Set once clients have been told this attach runs uncalibrated.
    uncalibrated_reported: bool,
    pending: Option<mpsc::UnboundedSender<Pending<AppendOutcome>>>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        debug!("Sensor handler started");
        loop {
            tokio::select! {
                biased;
                reading = next_reading(&mut self.readings) => match reading {
                    Some(reading) => self.on_reading(reading),
                    None => {
                        debug!("All sensor sources closed their feeds");
                        self.readings = None;
                    }
                },
                message = rx.recv() => match message {
                    Some(Message::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(message) => self.on_message(message).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
        debug!("Sensor handler stopped");
    }

    async fn on_message(&mut self, message: Message) {
        match message {
            Message::Execute { command, reply } => {
                let result = self.execute(command).await;
                let _ = reply.send(result);
            }
            Message::Bind { reply } => {
                let registration = self.clients.register();
                // The attach failure has already been broadcast to the new client.
                let _ = self.attach().await;
                let _ = reply.send(registration);
            }
            Message::Unbind { id, reply } => {
                self.clients.remove(id);
                self.release_if_unused();
                let _ = reply.send(self.status());
            }
            Message::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Message::Committed(outcome) => self.on_committed(outcome),
            Message::Shutdown { .. } => {}
        }
    }

    fn status(&self) -> HandlerStatus {
        HandlerStatus {
            state: self.state,
            recording_id: self.recording_id,
            clients: self.clients.len(),
        }
    }

    fn set_state(&mut self, state: HandlerState) {
        if self.state == state {
            return;
        }
        info!("Sensor handler {} -> {}", self.state, state);
        self.state = state;
        self.broadcast(Event::RecordingStateChanged(self.status()));
    }

    fn broadcast(&mut self, event: Event) {
        if self.clients.broadcast(&event) > 0 {
            self.release_if_unused();
        }
    }

    // === Commands ===

    async fn execute(&mut self, command: Command) -> Result<HandlerStatus> {
        match command {
            Command::StartSensors => {
                self.explicit_start = true;
                if let Err(e) = self.attach().await {
                    self.explicit_start = false;
                    return Err(e);
                }
            }
            Command::StopSensors => self.stop_sensors()?,
            Command::StartRecording { name } => self.start_recording(name).await?,
            Command::StopRecording => self.stop_recording()?,
            Command::Calibrate { pressure, altitude } => self.calibrate(pressure, altitude)?,
            Command::CalibrateAtCurrentPressure { altitude } => {
                let sample = self.last_pressure.ok_or_else(|| {
                    Error::sensor_unavailable("barometer", "no pressure reading received yet")
                })?;
                self.calibrate(sample.pressure, altitude)?;
            }
        }
        Ok(self.status())
    }

    async fn attach(&mut self) -> Result<()> {
        if self.state != HandlerState::Idle {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(self.config.reading_buffer.max(1));
        if let Err(e) = self.sensors.gps.start(tx.clone()).await {
            warn!("GPS unavailable: {}", e);
            self.broadcast(Event::sensor_error(&e));
            return Err(e);
        }

        if self.config.barometer_enabled {
            if let Some(barometer) = self.sensors.barometer.as_mut() {
                if let Err(e) = barometer.start(tx.clone()).await {
                    warn!("Barometer unavailable, using GPS altitude: {}", e);
                    self.broadcast(Event::sensor_error(&e));
                }
            }
        }

        self.readings = Some(rx);
        self.last_pressure = None;
        self.last_fix = None;
        self.uncalibrated_reported = false;
        self.set_state(HandlerState::Listening);
        Ok(())
    }

    fn detach(&mut self) {
        self.sensors.gps.stop();
        if let Some(barometer) = self.sensors.barometer.as_mut() {
            barometer.stop();
        }
        self.readings = None;
        self.last_pressure = None;
        self.set_state(HandlerState::Idle);
    }

    fn release_if_unused(&mut self) {
        if self.state == HandlerState::Listening && self.clients.is_empty() && !self.explicit_start {
            debug!("No clients left, detaching sensors");
            self.detach();
        }
    }

    fn stop_sensors(&mut self) -> Result<()> {
        match self.state {
            HandlerState::Recording => Err(Error::invalid_transition(self.state, "stop sensors")),
            HandlerState::Listening => {
                self.explicit_start = false;
                self.detach();
                Ok(())
            }
            HandlerState::Idle => {
                self.explicit_start = false;
                Ok(())
            }
        }
    }

    async fn start_recording(&mut self, name: Option<String>) -> Result<()> {
        if self.state != HandlerState::Listening {
            return Err(Error::invalid_transition(self.state, "start recording"));
        }

        let name = name.unwrap_or_else(|| default_name(&self.config.name_format));
        let recording = self.store.add_recording(name).await?;
        info!("Recording {} ('{}') started", recording.id, recording.name);

        self.recording_id = Some(recording.id);
        self.set_state(HandlerState::Recording);
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<()> {
        if self.state != HandlerState::Recording {
            return Err(Error::invalid_transition(self.state, "stop recording"));
        }
        if let Some(id) = self.recording_id.take() {
            info!("Recording {} stopped", id);
        }
        self.set_state(HandlerState::Listening);
        self.release_if_unused();
        Ok(())
    }

    fn calibrate(&mut self, pressure: f64, altitude: f64) -> Result<()> {
        if !pressure.is_finite() || pressure <= 0.0 {
            return Err(Error::InvalidCalibration {
                message: format!("pressure must be positive, got {pressure}"),
            });
        }
        if !altitude.is_finite() {
            return Err(Error::InvalidCalibration {
                message: format!("altitude must be finite, got {altitude}"),
            });
        }

        let reference = CalibratedAltitude::new(pressure, altitude);
        let write = self.store.enqueue_calibration(reference)?;
        self.calibration.replace(reference);
        info!("Calibrated: {:.2} hPa at {:.1} m", pressure, altitude);

        tokio::spawn(async move {
            match write.await {
                Ok(Ok(())) => trace!("Calibration persisted"),
                Ok(Err(e)) => warn!("Failed to persist calibration: {}", e),
                Err(_) => warn!("Recording store closed before calibration was persisted"),
            }
        });
        Ok(())
    }

    // === Samples ===

    fn on_reading(&mut self, reading: SensorReading) {
        match reading {
            SensorReading::Pressure(sample) => {
                if !self.config.barometer_enabled {
                    return;
                }
                if !sample.pressure.is_finite() || sample.pressure <= 0.0 {
                    warn!("Dropping invalid pressure reading: {} hPa", sample.pressure);
                    let e = Error::sensor_unavailable(
                        "barometer",
                        format!("invalid pressure reading {} hPa", sample.pressure),
                    );
                    self.broadcast(Event::sensor_error(&e));
                    return;
                }
                self.last_pressure = Some(sample);
            }
            SensorReading::Position(fix) => self.on_fix(fix),
        }
    }

    fn on_fix(&mut self, fix: PositionFix) {
        if self.last_fix.is_some_and(|last| fix.timestamp < last) {
            debug!("Dropping out-of-order fix at {}", fix.timestamp);
            return;
        }
        self.last_fix = Some(fix.timestamp);
        let altitude = self.altitude_for(&fix);

        match (self.state, self.recording_id) {
            (HandlerState::Recording, Some(recording_id)) => {
                let entry = NewEntry {
                    recording_id,
                    timestamp: fix.timestamp,
                    latitude: fix.latitude,
                    longitude: fix.longitude,
                    altitude,
                };
                self.persist(entry);
            }
            _ => self.broadcast(Event::Position(PositionUpdate {
                timestamp: fix.timestamp,
                latitude: fix.latitude,
                longitude: fix.longitude,
                altitude,
                recording_id: None,
                entry_id: None,
            })),
        }
    }

    fn altitude_for(&mut self, fix: &PositionFix) -> f64 {
        let Some(sample) = self.last_pressure else {
            return fix.altitude;
        };
        match self.calibration.altitude_at(sample.pressure) {
            Ok(altitude) if altitude.is_finite() => altitude,
            Ok(altitude) => {
                warn!("Barometric altitude {} unusable, using GPS altitude", altitude);
                fix.altitude
            }
            Err(e) => {
                if !self.uncalibrated_reported {
                    self.uncalibrated_reported = true;
                    info!("Not calibrated, using GPS altitude");
                    self.broadcast(Event::sensor_error(&e));
                }
                fix.altitude
            }
        }
    }

    fn persist(&mut self, entry: NewEntry) {
        let queued = self.store.enqueue_append(entry).and_then(|commit| {
            self.pending
                .as_ref()
                .and_then(|pending| pending.send(commit).ok())
                .ok_or(Error::HandlerStopped)
        });
        if let Err(e) = queued {
            warn!("Could not queue sample: {}", e);
            self.broadcast(Event::sensor_error(&e));
        }
    }

    fn on_committed(&mut self, outcome: Result<AppendOutcome>) {
        match outcome {
            Ok(AppendOutcome { entry, previous }) => {
                self.broadcast(Event::Position(PositionUpdate::from(&entry)));
                if let Some(previous) = previous {
                    match fusion::fuse(&previous, &entry) {
                        Ok(info) => self.broadcast(Event::FlightInfo(info)),
                        Err(e) => debug!("No flight info for entry {}: {}", entry.id, e),
                    }
                }
            }
            Err(e) => {
                warn!("Sample lost: {}", e);
                self.broadcast(Event::sensor_error(&e));
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(id) = self.recording_id.take() {
            info!("Closing recording {} on shutdown", id);
        }
        if self.state != HandlerState::Idle {
            self.detach();
        }
        self.pending = None;
        if let Err(e) = self.store.flush().await {
            warn!("Recording store unavailable during shutdown: {}", e);
        }
    }
}
