//! Core recording types for barotrack.
//!
//! A [`Recording`] is a named session; a [`RecordingEntry`] is one fused,
//! persisted sample belonging to exactly one recording.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named recording session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Identifier assigned by the store.
    pub id: i64,
    /// User-visible name; the only mutable field.
    pub name: String,
    /// When the recording was created.
    pub timestamp: DateTime<Utc>,
}

/// One persisted sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingEntry {
    /// Identifier assigned by the store.
    pub id: i64,
    /// The recording this entry belongs to.
    pub recording_id: i64,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Calibrated altitude in meters.
    pub altitude: f64,
}

/// A sample that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    /// The recording to append to.
    pub recording_id: i64,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Calibrated altitude in meters.
    pub altitude: f64,
}

impl NewEntry {
    /// Attach the store-assigned id.
    #[must_use]
    pub fn with_id(self, id: i64) -> RecordingEntry {
        RecordingEntry {
            id,
            recording_id: self.recording_id,
            timestamp: self.timestamp,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
        }
    }
}

/// A recording together with all of its entries, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingWithEntries {
    /// The recording.
    pub recording: Recording,
    /// Its entries in ascending timestamp order.
    pub entries: Vec<RecordingEntry>,
}

impl RecordingWithEntries {
    /// Elapsed time between the first and last entry, if there are two or more.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.entries.first(), self.entries.last()) {
            (Some(first), Some(last)) if self.entries.len() > 1 => {
                Some(last.timestamp - first.timestamp)
            }
            _ => None,
        }
    }

    /// Highest recorded altitude.
    #[must_use]
    pub fn max_altitude(&self) -> Option<f64> {
        self.entries.iter().map(|e| e.altitude).reduce(f64::max)
    }

    /// Sum of great-circle distances between consecutive entries, in meters.
    #[must_use]
    pub fn track_length(&self) -> f64 {
        self.entries
            .windows(2)
            .map(|w| {
                crate::fusion::haversine(
                    w[0].latitude,
                    w[0].longitude,
                    w[1].latitude,
                    w[1].longitude,
                )
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: i64, secs: i64, lat: f64, alt: f64) -> RecordingEntry {
        RecordingEntry {
            id,
            recording_id: 1,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            latitude: lat,
            longitude: 0.0,
            altitude: alt,
        }
    }

    fn recording() -> Recording {
        Recording {
            id: 1,
            name: "Test".to_string(),
            timestamp: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    #[test]
    fn test_new_entry_with_id() {
        let candidate = NewEntry {
            recording_id: 7,
            timestamp: Utc.timestamp_opt(10, 0).unwrap(),
            latitude: 46.0,
            longitude: 7.0,
            altitude: 1500.0,
        };
        let entry = candidate.clone().with_id(3);
        assert_eq!(entry.id, 3);
        assert_eq!(entry.recording_id, 7);
        assert_eq!(entry.timestamp, candidate.timestamp);
        assert!((entry.altitude - 1500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_summary_empty() {
        let rwe = RecordingWithEntries {
            recording: recording(),
            entries: vec![],
        };
        assert!(rwe.duration().is_none());
        assert!(rwe.max_altitude().is_none());
        assert!(rwe.track_length().abs() < f64::EPSILON);
    }

    #[test]
    fn test_summary_with_entries() {
        let rwe = RecordingWithEntries {
            recording: recording(),
            entries: vec![
                entry(1, 0, 0.0, 100.0),
                entry(2, 10, 0.001, 130.0),
                entry(3, 20, 0.002, 110.0),
            ],
        };
        assert_eq!(rwe.duration(), Some(chrono::Duration::seconds(20)));
        assert_eq!(rwe.max_altitude(), Some(130.0));
        assert!((rwe.track_length() - 222.4).abs() < 0.5);
    }

    #[test]
    fn test_recording_serialization() {
        let rec = recording();
        let json = serde_json::to_string(&rec).unwrap();
        let back: Recording = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, back);
    }
}
