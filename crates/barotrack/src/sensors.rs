//! Sensor abstraction.
//!
//! A [`SensorSource`] delivers [`SensorReading`]s into a channel owned by the
//! sensor handler. Platform integrations bridge their callbacks through a
//! [`FeedSource`], which is also what the replay command and tests drive.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// The kind of physical sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Satellite positioning.
    Gps,
    /// Barometric pressure.
    Barometer,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gps => write!(f, "gps"),
            Self::Barometer => write!(f, "barometer"),
        }
    }
}

/// A position fix as reported by the GPS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    /// When the fix was taken.
    pub timestamp: DateTime<Utc>,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Uncalibrated GPS altitude in meters.
    pub altitude: f64,
}

/// A barometer sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureReading {
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Static pressure in hPa.
    pub pressure: f64,
}

/// One raw sensor event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorReading {
    /// A GPS fix.
    Position(PositionFix),
    /// A barometer sample.
    Pressure(PressureReading),
}

impl SensorReading {
    /// The sensor that produces this kind of reading.
    #[must_use]
    pub fn kind(&self) -> SensorKind {
        match self {
            Self::Position(_) => SensorKind::Gps,
            Self::Pressure(_) => SensorKind::Barometer,
        }
    }

    /// When the reading was taken.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Position(fix) => fix.timestamp,
            Self::Pressure(sample) => sample.timestamp,
        }
    }
}

/// A trait for sensor sources.
///
/// Implementors attach to a physical (or simulated) sensor and forward its
/// readings through the channel given to [`SensorSource::start`].
#[async_trait::async_trait]
pub trait SensorSource: Send + Sync + fmt::Debug {
    /// Which sensor this is.
    fn kind(&self) -> SensorKind;

    /// Attach to the sensor and begin delivering readings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SensorUnavailable`] when the hardware is absent or
    /// access was denied.
    async fn start(&mut self, sender: mpsc::Sender<SensorReading>) -> Result<()>;

    /// Detach from the sensor. Readings not yet delivered are dropped.
    fn stop(&mut self);

    /// Whether the source is attached.
    fn is_running(&self) -> bool;
}

#[derive(Debug, Default)]
struct FeedShared {
    sender: Mutex<Option<mpsc::Sender<SensorReading>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// A sensor source fed by an external producer.
///
/// Clones share state: hand one clone to the sensor handler and keep another
/// to [`push`](Self::push) readings as the platform reports them. Readings
/// pushed while the source is stopped are discarded.
#[derive(Debug, Clone)]
pub struct FeedSource {
    kind: SensorKind,
    unavailable: Option<String>,
    shared: Arc<FeedShared>,
}

impl FeedSource {
    /// Create a feed for the given sensor kind.
    #[must_use]
    pub fn new(kind: SensorKind) -> Self {
        Self {
            kind,
            unavailable: None,
            shared: Arc::new(FeedShared::default()),
        }
    }

    /// Create a feed whose sensor cannot be attached.
    #[must_use]
    pub fn unavailable(kind: SensorKind, reason: impl Into<String>) -> Self {
        Self {
            unavailable: Some(reason.into()),
            ..Self::new(kind)
        }
    }

    fn current_sender(&self) -> Option<mpsc::Sender<SensorReading>> {
        self.shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver a reading without waiting.
    ///
    /// Returns `false` if the source is stopped or the handler's queue is full.
    pub fn push(&self, reading: SensorReading) -> bool {
        let Some(tx) = self.current_sender() else {
            trace!("{} feed stopped, discarding reading", self.kind);
            return false;
        };
        match tx.try_send(reading) {
            Ok(()) => {
                self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("{} reading queue full, dropping reading", self.kind);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver a reading, waiting for queue capacity.
    ///
    /// Returns `false` if the source is stopped.
    pub async fn send(&self, reading: SensorReading) -> bool {
        let Some(tx) = self.current_sender() else {
            return false;
        };
        if tx.send(reading).await.is_ok() {
            self.shared.delivered.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Readings accepted so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Readings dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl SensorSource for FeedSource {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    async fn start(&mut self, sender: mpsc::Sender<SensorReading>) -> Result<()> {
        if let Some(reason) = &self.unavailable {
            return Err(Error::sensor_unavailable(self.kind.to_string(), reason.clone()));
        }
        debug!("Attaching {} feed", self.kind);
        *self
            .shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sender);
        Ok(())
    }

    fn stop(&mut self) {
        debug!("Detaching {} feed", self.kind);
        self.shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn is_running(&self) -> bool {
        self.current_sender().is_some()
    }
}

/// The set of sources a handler attaches to.
#[derive(Debug)]
pub struct SensorSuite {
    /// Position source; required.
    pub gps: Box<dyn SensorSource>,
    /// Pressure source; without one, raw GPS altitude is used.
    pub barometer: Option<Box<dyn SensorSource>>,
}

impl SensorSuite {
    /// A suite with only a GPS.
    #[must_use]
    pub fn new(gps: impl SensorSource + 'static) -> Self {
        Self {
            gps: Box::new(gps),
            barometer: None,
        }
    }

    /// Add a barometer.
    #[must_use]
    pub fn with_barometer(mut self, barometer: impl SensorSource + 'static) -> Self {
        self.barometer = Some(Box::new(barometer));
        self
    }
}

/// Parse a sensor log with one JSON reading per line. Blank lines are skipped.
///
/// # Errors
///
/// Returns [`Error::Json`] for the first malformed line.
pub fn parse_readings(text: &str) -> Result<Vec<SensorReading>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).map_err(Error::from))
        .collect()
}

/// Read a JSON-lines sensor log from disk.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a line is malformed.
pub fn load_readings(path: impl AsRef<Path>) -> Result<Vec<SensorReading>> {
    let text = std::fs::read_to_string(path)?;
    parse_readings(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fix(secs: i64) -> SensorReading {
        SensorReading::Position(PositionFix {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            latitude: 1.0,
            longitude: 2.0,
            altitude: 3.0,
        })
    }

    #[test]
    fn test_sensor_kind_display() {
        assert_eq!(SensorKind::Gps.to_string(), "gps");
        assert_eq!(SensorKind::Barometer.to_string(), "barometer");
    }

    #[test]
    fn test_reading_kind_and_timestamp() {
        let reading = fix(5);
        assert_eq!(reading.kind(), SensorKind::Gps);
        assert_eq!(reading.timestamp(), Utc.timestamp_opt(5, 0).unwrap());
    }

    #[tokio::test]
    async fn test_feed_discards_while_stopped() {
        let feed = FeedSource::new(SensorKind::Gps);
        assert!(!feed.is_running());
        assert!(!feed.push(fix(0)));
        assert_eq!(feed.delivered(), 0);
    }

    #[tokio::test]
    async fn test_feed_delivers_after_start() {
        let mut source = FeedSource::new(SensorKind::Gps);
        let producer = source.clone();
        let (tx, mut rx) = mpsc::channel(4);

        source.start(tx).await.unwrap();
        assert!(producer.is_running());
        assert!(producer.push(fix(1)));
        assert!(producer.send(fix(2)).await);

        assert_eq!(rx.recv().await, Some(fix(1)));
        assert_eq!(rx.recv().await, Some(fix(2)));
        assert_eq!(producer.delivered(), 2);

        source.stop();
        assert!(!producer.push(fix(3)));
    }

    #[tokio::test]
    async fn test_feed_drops_when_full() {
        let mut source = FeedSource::new(SensorKind::Barometer);
        let (tx, _rx) = mpsc::channel(1);
        source.start(tx).await.unwrap();

        assert!(source.push(fix(1)));
        assert!(!source.push(fix(2)));
        assert_eq!(source.dropped(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_feed_fails_to_start() {
        let mut source = FeedSource::unavailable(SensorKind::Barometer, "no hardware");
        let (tx, _rx) = mpsc::channel(1);
        let err = source.start(tx).await.unwrap_err();
        assert!(matches!(err, Error::SensorUnavailable { .. }));
        assert!(err.to_string().contains("barometer"));
        assert!(!source.is_running());
    }

    #[test]
    fn test_parse_readings() {
        let text = r#"
{"type":"pressure","timestamp":"2024-05-01T10:00:00Z","pressure":1013.25}
{"type":"position","timestamp":"2024-05-01T10:00:01Z","latitude":46.5,"longitude":7.9,"altitude":512.0}

"#;
        let readings = parse_readings(text).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].kind(), SensorKind::Barometer);
        assert!(matches!(
            readings[1],
            SensorReading::Position(PositionFix { latitude, .. }) if (latitude - 46.5).abs() < 1e-9
        ));
    }

    #[test]
    fn test_parse_readings_rejects_garbage() {
        let err = parse_readings("{\"type\":\"wind\"}").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_load_readings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let line = serde_json::to_string(&fix(0)).unwrap();
        std::fs::write(&path, format!("{line}\n{line}\n")).unwrap();

        let readings = load_readings(&path).unwrap();
        assert_eq!(readings, vec![fix(0), fix(0)]);
    }

    #[test]
    fn test_demo_log_parses() {
        let readings = parse_readings(include_str!("../../../demos/valley-flight.jsonl")).unwrap();
        assert_eq!(readings.len(), 120);
        assert_eq!(readings[0].kind(), SensorKind::Barometer);
        assert_eq!(readings[1].kind(), SensorKind::Gps);
        assert!(readings
            .windows(2)
            .all(|pair| pair[0].timestamp() <= pair[1].timestamp()));
    }
}
