//! Service message channel.
//!
//! Clients talk to the sensor handler with typed [`Command`]s and receive a
//! stream of [`Event`]s. Each client has its own unbounded queue, so a slow
//! client never blocks the handler; events arrive in emission order, at most
//! once, and a client only sees events emitted after it bound.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, FaultKind, Result};
use crate::fusion::FlightInfo;
use crate::handler::{HandlerStatus, SensorHandler};
use crate::recording::RecordingEntry;

/// Control commands accepted by the sensor handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum Command {
    /// Attach sensors even with no client bound.
    StartSensors,
    /// Detach sensors. Rejected while recording.
    StopSensors,
    /// Begin persisting samples to a new recording.
    StartRecording {
        /// Recording name; a timestamped default is used when absent.
        name: Option<String>,
    },
    /// Stop persisting samples.
    StopRecording,
    /// Replace the calibration reference.
    Calibrate {
        /// Pressure in hPa.
        pressure: f64,
        /// True altitude in meters at that pressure.
        altitude: f64,
    },
    /// Calibrate against the most recent barometer reading.
    CalibrateAtCurrentPressure {
        /// True altitude in meters right now.
        altitude: f64,
    },
}

/// A live position sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    /// When the fix was taken.
    pub timestamp: DateTime<Utc>,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Altitude in meters.
    pub altitude: f64,
    /// Recording the sample was persisted to, if any.
    pub recording_id: Option<i64>,
    /// Id of the persisted entry, if any.
    pub entry_id: Option<i64>,
}

impl From<&RecordingEntry> for PositionUpdate {
    fn from(entry: &RecordingEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            latitude: entry.latitude,
            longitude: entry.longitude,
            altitude: entry.altitude,
            recording_id: Some(entry.recording_id),
            entry_id: Some(entry.id),
        }
    }
}

/// Events pushed to bound clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum Event {
    /// A new position and altitude.
    Position(PositionUpdate),
    /// Derived metrics for the latest persisted sample.
    FlightInfo(FlightInfo),
    /// The handler changed state.
    RecordingStateChanged(HandlerStatus),
    /// Something went wrong; the handler keeps running.
    SensorError {
        /// Category of the failure.
        kind: FaultKind,
        /// Human-readable description.
        message: String,
    },
}

impl Event {
    /// Build an error event from an [`Error`].
    #[must_use]
    pub fn sensor_error(error: &Error) -> Self {
        Self::SensorError {
            kind: error.fault_kind(),
            message: error.to_string(),
        }
    }
}

/// The wire envelope for either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    /// Client to service.
    Command(Command),
    /// Service to client.
    Event(Event),
}

impl Envelope {
    /// Encode as a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid envelope.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Identifies a bound client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Event queues of all bound clients.
#[derive(Debug, Default)]
pub(crate) struct ClientRegistry {
    next_id: u64,
    clients: BTreeMap<ClientId, mpsc::UnboundedSender<Event>>,
}

impl ClientRegistry {
    pub(crate) fn register(&mut self) -> (ClientId, mpsc::UnboundedReceiver<Event>) {
        self.next_id += 1;
        let id = ClientId(self.next_id);
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.insert(id, tx);
        debug!("Bound {} ({} total)", id, self.clients.len());
        (id, rx)
    }

    pub(crate) fn remove(&mut self, id: ClientId) -> bool {
        let removed = self.clients.remove(&id).is_some();
        if removed {
            debug!("Unbound {} ({} remaining)", id, self.clients.len());
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Send to every client, dropping those whose receiver is gone.
    ///
    /// Returns how many clients were dropped.
    pub(crate) fn broadcast(&mut self, event: &Event) -> usize {
        let before = self.clients.len();
        self.clients.retain(|id, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                debug!("Dropping disconnected {}", id);
            }
            alive
        });
        before - self.clients.len()
    }
}

/// A bound client of the sensor handler.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    events: mpsc::UnboundedReceiver<Event>,
    handler: SensorHandler,
}

impl Client {
    pub(crate) fn new(
        id: ClientId,
        events: mpsc::UnboundedReceiver<Event>,
        handler: SensorHandler,
    ) -> Self {
        Self {
            id,
            events,
            handler,
        }
    }

    /// This client's id.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Wait for the next event. Returns `None` once the handler has stopped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Take an event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.events.try_recv().ok()
    }

    /// Send a command to the handler.
    ///
    /// # Errors
    ///
    /// Returns the handler's rejection, or [`Error::HandlerStopped`].
    pub async fn send(&self, command: Command) -> Result<HandlerStatus> {
        self.handler.execute(command).await
    }

    /// Release this client's binding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerStopped`] if the handler is gone.
    pub async fn unbind(self) -> Result<HandlerStatus> {
        self.handler.unbind(self.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerState;
    use chrono::TimeZone;

    fn position() -> PositionUpdate {
        PositionUpdate {
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            latitude: 46.1,
            longitude: 7.2,
            altitude: 1200.0,
            recording_id: None,
            entry_id: None,
        }
    }

    #[test]
    fn test_command_wire_shape() {
        let json = Envelope::Command(Command::Calibrate {
            pressure: 1013.25,
            altitude: 0.0,
        })
        .to_json()
        .unwrap();
        assert!(json.contains("\"kind\":\"command\""));
        assert!(json.contains("\"command\":\"calibrate\""));
        assert!(json.contains("\"pressure\":1013.25"));
    }

    #[test]
    fn test_unit_command_wire_shape() {
        let json = Envelope::Command(Command::StopSensors).to_json().unwrap();
        assert!(json.contains("\"command\":\"stop_sensors\""));
        assert_eq!(
            Envelope::from_json(&json).unwrap(),
            Envelope::Command(Command::StopSensors)
        );
    }

    #[test]
    fn test_event_decode() {
        let original = Envelope::Event(Event::RecordingStateChanged(HandlerStatus {
            state: HandlerState::Recording,
            recording_id: Some(4),
            clients: 2,
        }));
        let decoded = Envelope::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_from_json_rejects_unknown_kind() {
        assert!(Envelope::from_json(r#"{"kind":"telemetry","payload":{}}"#).is_err());
    }

    #[test]
    fn test_sensor_error_event() {
        let event = Event::sensor_error(&Error::NotCalibrated);
        match event {
            Event::SensorError { kind, message } => {
                assert_eq!(kind, FaultKind::NotCalibrated);
                assert!(message.contains("calibrat"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_position_from_entry() {
        let entry = RecordingEntry {
            id: 9,
            recording_id: 3,
            timestamp: Utc.timestamp_opt(0, 0).unwrap(),
            latitude: 1.0,
            longitude: 2.0,
            altitude: 3.0,
        };
        let update = PositionUpdate::from(&entry);
        assert_eq!(update.entry_id, Some(9));
        assert_eq!(update.recording_id, Some(3));
    }

    #[test]
    fn test_registry_broadcast_in_order() {
        let mut registry = ClientRegistry::default();
        let (_, mut rx) = registry.register();

        registry.broadcast(&Event::Position(position()));
        registry.broadcast(&Event::sensor_error(&Error::ZeroTimeDelta));

        assert!(matches!(rx.try_recv(), Ok(Event::Position(_))));
        assert!(matches!(rx.try_recv(), Ok(Event::SensorError { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_registry_prunes_dropped_clients() {
        let mut registry = ClientRegistry::default();
        let (_, rx_a) = registry.register();
        let (_, _rx_b) = registry.register();
        assert_eq!(registry.len(), 2);

        drop(rx_a);
        assert_eq!(registry.broadcast(&Event::Position(position())), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_ids_unique_and_removable() {
        let mut registry = ClientRegistry::default();
        let (a, _rx_a) = registry.register();
        let (b, _rx_b) = registry.register();
        assert_ne!(a, b);

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert!(!registry.is_empty());
        assert!(registry.remove(b));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_late_registration_sees_no_replay() {
        let mut registry = ClientRegistry::default();
        let (_, mut early) = registry.register();
        registry.broadcast(&Event::Position(position()));

        let (_, mut late) = registry.register();
        assert!(early.try_recv().is_ok());
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn test_client_id_display() {
        assert_eq!(ClientId(7).to_string(), "client-7");
    }
}
