//! `SQLite` schema definitions for barotrack.
//!
//! Timestamps are stored as Unix milliseconds so that ordering in SQL matches
//! chronological order.

/// SQL statement to create the recordings table.
pub const CREATE_RECORDINGS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS recordings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    timestamp INTEGER NOT NULL
)
";

/// SQL statement to create the recording entries table.
pub const CREATE_ENTRIES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS recording_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recording_id INTEGER NOT NULL REFERENCES recordings(id) ON DELETE CASCADE,
    timestamp INTEGER NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    altitude REAL NOT NULL
)
";

/// SQL statement to create the calibration table.
///
/// The primary key is pinned to one value so at most one row can exist.
pub const CREATE_CALIBRATION_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS calibrated_altitude (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    pressure REAL NOT NULL,
    altitude REAL NOT NULL,
    timestamp INTEGER NOT NULL
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_RECORDINGS_TABLE,
    CREATE_ENTRIES_TABLE,
    CREATE_CALIBRATION_TABLE,
    CREATE_METADATA_TABLE,
];
