//! Storage layer for barotrack.
//!
//! This module provides the `SQLite`-backed persistence gateway for
//! recordings, their entries, and the calibration reference. It is
//! synchronous; [`crate::store::RecordingStore`] runs it on a worker thread.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::calibration::CalibratedAltitude;
use crate::error::{Error, Result};
use crate::recording::{NewEntry, Recording, RecordingEntry, RecordingWithEntries};

const ENTRY_COLUMNS: &str = "id, recording_id, timestamp, latitude, longitude, altitude";

/// Storage engine for recordings.
///
/// Provides persistent storage using `SQLite` with support for:
/// - Recording CRUD with cascading deletion of entries
/// - Append-only entry insertion
/// - Transactional fetch of a recording with its entries
/// - A single-row calibration reference
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Connection,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let mut conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        migrations::initialize_schema(&mut conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self { path, conn })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::initialize_schema(&mut conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // === Recordings ===

    /// Create a recording. The store assigns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn add_recording(&self, name: &str, timestamp: DateTime<Utc>) -> Result<Recording> {
        let millis = timestamp.timestamp_millis();
        self.conn.execute(
            "INSERT INTO recordings (name, timestamp) VALUES (?1, ?2)",
            params![name, millis],
        )?;

        let id = self.conn.last_insert_rowid();
        debug!("Inserted recording {} ({})", id, name);
        Ok(Recording {
            id,
            name: name.to_string(),
            timestamp: from_millis(millis),
        })
    }

    /// Create several recordings in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails; nothing is written in that case.
    pub fn add_recordings(&self, names: &[String], timestamp: DateTime<Utc>) -> Result<Vec<Recording>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut created = Vec::with_capacity(names.len());
        for name in names {
            created.push(self.add_recording(name, timestamp)?);
        }
        tx.commit()?;
        Ok(created)
    }

    /// Persist a changed name. Other fields are immutable.
    ///
    /// Returns `true` if the recording existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn update_recording(&self, recording: &Recording) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE recordings SET name = ?1 WHERE id = ?2",
            params![recording.name, recording.id],
        )?;
        Ok(affected > 0)
    }

    /// Delete a recording and, by cascade, all of its entries.
    ///
    /// Returns `true` if a recording was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn remove_recording(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM recordings WHERE id = ?1", [id])?;
        if affected > 0 {
            info!("Deleted recording {}", id);
        }
        Ok(affected > 0)
    }

    /// Delete several recordings in one transaction.
    ///
    /// Returns the ids that existed and were deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn remove_recordings(&self, ids: &[i64]) -> Result<Vec<i64>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut removed = Vec::new();
        for &id in ids {
            if tx.execute("DELETE FROM recordings WHERE id = ?1", [id])? > 0 {
                removed.push(id);
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Get a recording by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_recording(&self, id: i64) -> Result<Option<Recording>> {
        Self::query_recording(&self.conn, id)
    }

    /// All recordings, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn list_recordings(&self) -> Result<Vec<Recording>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, timestamp FROM recordings ORDER BY timestamp DESC, id DESC",
        )?;
        let recordings = stmt
            .query_map([], Self::row_to_recording)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(recordings)
    }

    // === Entries ===

    /// Append one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails, including when the recording
    /// does not exist.
    pub fn add_entry(&self, entry: &NewEntry) -> Result<RecordingEntry> {
        Self::insert_entry(&self.conn, entry)
    }

    /// Append several entries in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails; nothing is written in that case.
    pub fn add_entries(&self, entries: &[NewEntry]) -> Result<Vec<RecordingEntry>> {
        let tx = self.conn.unchecked_transaction()?;
        let inserted = entries
            .iter()
            .map(|entry| Self::insert_entry(&tx, entry))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(inserted)
    }

    /// The most recent entry of a recording.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn last_entry(&self, recording_id: i64) -> Result<Option<RecordingEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM recording_entries WHERE recording_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT 1"
        );
        let entry = self
            .conn
            .query_row(&sql, [recording_id], Self::row_to_entry)
            .optional()?;
        Ok(entry)
    }

    /// Number of entries in a recording.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn entry_count(&self, recording_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM recording_entries WHERE recording_id = ?1",
            [recording_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Fetch a recording with all of its entries as one consistent read.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_recording_with_entries(&self, id: i64) -> Result<Option<RecordingWithEntries>> {
        let tx = self.conn.unchecked_transaction()?;

        let Some(recording) = Self::query_recording(&tx, id)? else {
            return Ok(None);
        };

        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM recording_entries WHERE recording_id = ?1
             ORDER BY timestamp ASC, id ASC"
        );
        let entries = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map([id], Self::row_to_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        tx.commit()?;
        Ok(Some(RecordingWithEntries { recording, entries }))
    }

    // === Calibration ===

    /// The stored calibration reference, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn calibration(&self) -> Result<Option<CalibratedAltitude>> {
        let reference = self
            .conn
            .query_row(
                "SELECT pressure, altitude, timestamp FROM calibrated_altitude WHERE id = 1",
                [],
                |row| {
                    Ok(CalibratedAltitude {
                        pressure: row.get(0)?,
                        altitude: row.get(1)?,
                        timestamp: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()?;
        Ok(reference)
    }

    /// Insert or replace the calibration reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_calibration(&self, reference: &CalibratedAltitude) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO calibrated_altitude (id, pressure, altitude, timestamp)
             VALUES (1, ?1, ?2, ?3)",
            params![
                reference.pressure,
                reference.altitude,
                reference.timestamp.timestamp_millis()
            ],
        )?;
        info!(
            "Calibration set to {:.2} hPa at {:.1} m",
            reference.pressure, reference.altitude
        );
        Ok(())
    }

    // === Statistics ===

    /// Get database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let total_recordings: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM recordings", [], |row| row.get(0))?;
        let total_entries: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM recording_entries", [], |row| {
                    row.get(0)
                })?;
        let newest: Option<i64> = self.conn.query_row(
            "SELECT MAX(timestamp) FROM recordings",
            [],
            |row| row.get(0),
        )?;

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            total_recordings,
            total_entries,
            newest_recording: newest.map(from_millis),
            calibrated: self.calibration()?.is_some(),
            db_size_bytes,
        })
    }

    fn insert_entry(conn: &Connection, entry: &NewEntry) -> Result<RecordingEntry> {
        let millis = entry.timestamp.timestamp_millis();
        conn.execute(
            r"
            INSERT INTO recording_entries (recording_id, timestamp, latitude, longitude, altitude)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                entry.recording_id,
                millis,
                entry.latitude,
                entry.longitude,
                entry.altitude
            ],
        )?;

        let mut stored = entry.clone().with_id(conn.last_insert_rowid());
        stored.timestamp = from_millis(millis);
        Ok(stored)
    }

    fn query_recording(conn: &Connection, id: i64) -> Result<Option<Recording>> {
        let recording = conn
            .query_row(
                "SELECT id, name, timestamp FROM recordings WHERE id = ?1",
                [id],
                Self::row_to_recording,
            )
            .optional()?;
        Ok(recording)
    }

    fn row_to_recording(row: &rusqlite::Row) -> rusqlite::Result<Recording> {
        Ok(Recording {
            id: row.get(0)?,
            name: row.get(1)?,
            timestamp: from_millis(row.get(2)?),
        })
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<RecordingEntry> {
        Ok(RecordingEntry {
            id: row.get(0)?,
            recording_id: row.get(1)?,
            timestamp: from_millis(row.get(2)?),
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            altitude: row.get(5)?,
        })
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(|| {
        warn!("Timestamp {} out of range, defaulting to epoch", millis);
        DateTime::default()
    })
}

/// Statistics about the storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of recordings.
    pub total_recordings: i64,
    /// Number of entries across all recordings.
    pub total_entries: i64,
    /// Creation time of the newest recording.
    pub newest_recording: Option<DateTime<Utc>>,
    /// Whether a calibration reference is stored.
    pub calibrated: bool,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn create_test_storage() -> Storage {
        Storage::open_in_memory().expect("failed to create test storage")
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn new_entry(recording_id: i64, secs: i64, alt: f64) -> NewEntry {
        NewEntry {
            recording_id,
            timestamp: t(secs),
            latitude: 46.0,
            longitude: 7.0,
            altitude: alt,
        }
    }

    #[test]
    fn test_open_in_memory() {
        assert!(Storage::open_in_memory().is_ok());
    }

    #[test]
    fn test_open_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tracks.db");
        let storage = Storage::open(&path).unwrap();
        assert_eq!(storage.path(), path.as_path());
        assert!(path.exists());
    }

    #[test]
    fn test_add_and_get_recording() {
        let storage = create_test_storage();
        let rec = storage.add_recording("Morning flight", t(0)).unwrap();

        let fetched = storage.get_recording(rec.id).unwrap().unwrap();
        assert_eq!(fetched, rec);
        assert_eq!(fetched.name, "Morning flight");
    }

    #[test]
    fn test_recording_ids_are_unique() {
        let storage = create_test_storage();
        let a = storage.add_recording("a", t(0)).unwrap();
        let b = storage.add_recording("b", t(0)).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_add_recordings_batch() {
        let storage = create_test_storage();
        let names = vec!["one".to_string(), "two".to_string()];
        let created = storage.add_recordings(&names, t(0)).unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(storage.list_recordings().unwrap().len(), 2);
    }

    #[test]
    fn test_update_recording_renames() {
        let storage = create_test_storage();
        let mut rec = storage.add_recording("old", t(0)).unwrap();
        rec.name = "new".to_string();

        assert!(storage.update_recording(&rec).unwrap());
        assert_eq!(storage.get_recording(rec.id).unwrap().unwrap().name, "new");
    }

    #[test]
    fn test_update_nonexistent() {
        let storage = create_test_storage();
        let ghost = Recording {
            id: 999,
            name: "ghost".to_string(),
            timestamp: t(0),
        };
        assert!(!storage.update_recording(&ghost).unwrap());
    }

    #[test]
    fn test_list_recordings_newest_first() {
        let storage = create_test_storage();
        storage.add_recording("old", t(0)).unwrap();
        storage.add_recording("new", t(100)).unwrap();

        let names: Vec<_> = storage
            .list_recordings()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["new", "old"]);
    }

    #[test]
    fn test_remove_recording_cascades() {
        let storage = create_test_storage();
        let rec = storage.add_recording("doomed", t(0)).unwrap();
        storage.add_entry(&new_entry(rec.id, 1, 100.0)).unwrap();
        storage.add_entry(&new_entry(rec.id, 2, 101.0)).unwrap();
        assert_eq!(storage.entry_count(rec.id).unwrap(), 2);

        assert!(storage.remove_recording(rec.id).unwrap());
        assert_eq!(storage.entry_count(rec.id).unwrap(), 0);
        assert!(!storage.remove_recording(rec.id).unwrap());
    }

    #[test]
    fn test_remove_recordings_batch() {
        let storage = create_test_storage();
        let a = storage.add_recording("a", t(0)).unwrap();
        let b = storage.add_recording("b", t(0)).unwrap();
        let c = storage.add_recording("c", t(0)).unwrap();

        assert_eq!(
            storage.remove_recordings(&[a.id, c.id, 999]).unwrap(),
            vec![a.id, c.id]
        );
        let remaining = storage.list_recordings().unwrap();
        assert_eq!(remaining, vec![b]);
    }

    #[test]
    fn test_entry_requires_existing_recording() {
        let storage = create_test_storage();
        let result = storage.add_entry(&new_entry(42, 0, 0.0));
        assert!(matches!(result, Err(Error::DatabaseQuery(_))));
    }

    #[test]
    fn test_add_entries_is_atomic() {
        let storage = create_test_storage();
        let rec = storage.add_recording("r", t(0)).unwrap();

        let batch = vec![new_entry(rec.id, 1, 1.0), new_entry(999, 2, 2.0)];
        assert!(storage.add_entries(&batch).is_err());
        assert_eq!(storage.entry_count(rec.id).unwrap(), 0);

        let batch = vec![new_entry(rec.id, 1, 1.0), new_entry(rec.id, 2, 2.0)];
        let inserted = storage.add_entries(&batch).unwrap();
        assert_eq!(inserted.len(), 2);
        assert!(inserted[0].id < inserted[1].id);
    }

    #[test]
    fn test_recording_with_entries_ordered_by_time() {
        let storage = create_test_storage();
        let rec = storage.add_recording("r", t(0)).unwrap();
        storage.add_entry(&new_entry(rec.id, 30, 3.0)).unwrap();
        storage.add_entry(&new_entry(rec.id, 10, 1.0)).unwrap();
        storage.add_entry(&new_entry(rec.id, 20, 2.0)).unwrap();

        let rwe = storage.get_recording_with_entries(rec.id).unwrap().unwrap();
        let alts: Vec<f64> = rwe.entries.iter().map(|e| e.altitude).collect();
        assert_eq!(alts, vec![1.0, 2.0, 3.0]);
        assert_eq!(rwe.recording, rec);
    }

    #[test]
    fn test_recording_with_entries_isolated() {
        let storage = create_test_storage();
        let a = storage.add_recording("a", t(0)).unwrap();
        let b = storage.add_recording("b", t(0)).unwrap();
        storage.add_entry(&new_entry(a.id, 1, 1.0)).unwrap();
        storage.add_entry(&new_entry(b.id, 1, 1.0)).unwrap();
        storage.add_entry(&new_entry(b.id, 2, 2.0)).unwrap();

        let rwe = storage.get_recording_with_entries(a.id).unwrap().unwrap();
        assert_eq!(rwe.entries.len(), 1);
        assert!(rwe.entries.iter().all(|e| e.recording_id == a.id));
    }

    #[test]
    fn test_recording_with_entries_missing() {
        let storage = create_test_storage();
        assert!(storage.get_recording_with_entries(5).unwrap().is_none());
    }

    #[test]
    fn test_last_entry() {
        let storage = create_test_storage();
        let rec = storage.add_recording("r", t(0)).unwrap();
        assert!(storage.last_entry(rec.id).unwrap().is_none());

        storage.add_entry(&new_entry(rec.id, 1, 1.0)).unwrap();
        let second = storage.add_entry(&new_entry(rec.id, 2, 2.0)).unwrap();
        assert_eq!(storage.last_entry(rec.id).unwrap(), Some(second));
    }

    #[test]
    fn test_entry_timestamp_millis_precision() {
        let storage = create_test_storage();
        let rec = storage.add_recording("r", t(0)).unwrap();
        let mut candidate = new_entry(rec.id, 0, 0.0);
        candidate.timestamp += Duration::microseconds(1_500);

        let stored = storage.add_entry(&candidate).unwrap();
        assert_eq!(stored.timestamp, t(0) + Duration::milliseconds(1));
        assert_eq!(storage.last_entry(rec.id).unwrap(), Some(stored));
    }

    #[test]
    fn test_calibration_insert_or_replace() {
        let storage = create_test_storage();
        assert!(storage.calibration().unwrap().is_none());

        let first = CalibratedAltitude {
            pressure: 1013.25,
            altitude: 0.0,
            timestamp: t(0),
        };
        storage.set_calibration(&first).unwrap();
        assert_eq!(storage.calibration().unwrap(), Some(first));

        let second = CalibratedAltitude {
            pressure: 950.0,
            altitude: 540.0,
            timestamp: t(60),
        };
        storage.set_calibration(&second).unwrap();
        assert_eq!(storage.calibration().unwrap(), Some(second));

        let rows: i64 = storage
            .conn
            .query_row("SELECT COUNT(*) FROM calibrated_altitude", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_stats() {
        let storage = create_test_storage();
        let empty = storage.stats().unwrap();
        assert_eq!(empty.total_recordings, 0);
        assert!(empty.newest_recording.is_none());
        assert!(!empty.calibrated);

        let rec = storage.add_recording("r", t(5)).unwrap();
        storage.add_entry(&new_entry(rec.id, 6, 1.0)).unwrap();
        storage
            .set_calibration(&CalibratedAltitude::new(1000.0, 0.0))
            .unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.total_recordings, 1);
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.newest_recording, Some(t(5)));
        assert!(stats.calibrated);
        assert_eq!(stats.db_size_bytes, 0);
    }
}
