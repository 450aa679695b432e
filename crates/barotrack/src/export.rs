//! GPX 1.1 track export.
//!
//! A recording becomes one `<trk>` with one `<trkseg>`, points in store
//! order. Times are written in local time without an offset.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, FixedOffset, Local, Utc};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::recording::RecordingWithEntries;

/// GPX namespace for version 1.1.
pub const GPX_NAMESPACE: &str = "http://www.topografix.com/GPX/1/1";

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Writes recordings as GPX documents.
#[derive(Debug, Clone)]
pub struct GpxExporter {
    creator: String,
    offset: Option<FixedOffset>,
}

impl GpxExporter {
    /// Create an exporter that stamps documents with `creator`.
    #[must_use]
    pub fn new(creator: impl Into<String>) -> Self {
        Self {
            creator: creator.into(),
            offset: None,
        }
    }

    /// Render times at a fixed UTC offset instead of the system zone.
    #[must_use]
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = Some(offset);
        self
    }

    /// The `creator` attribute.
    #[must_use]
    pub fn creator(&self) -> &str {
        &self.creator
    }

    /// Render a recording as a GPX document.
    #[must_use]
    pub fn serialize(&self, recording: &RecordingWithEntries) -> String {
        GpxDocument {
            exporter: self,
            recording,
        }
        .to_string()
    }

    /// Render a recording if there is one.
    ///
    /// Missing input yields `None` rather than an error.
    #[must_use]
    pub fn export(&self, recording: Option<&RecordingWithEntries>) -> Option<String> {
        let Some(recording) = recording else {
            debug!("Nothing to export");
            return None;
        };
        Some(self.serialize(recording))
    }

    /// Write a recording to `path` as GPX.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// file cannot be written.
    pub fn write_to(&self, recording: &RecordingWithEntries, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::DirectoryCreate {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(path, self.serialize(recording))?;
        info!(
            "Exported recording {} ({} points) to {}",
            recording.recording.id,
            recording.entries.len(),
            path.display()
        );
        Ok(())
    }

    fn format_time(&self, timestamp: DateTime<Utc>) -> String {
        match self.offset {
            Some(offset) => timestamp.with_timezone(&offset).format(TIME_FORMAT).to_string(),
            None => timestamp.with_timezone(&Local).format(TIME_FORMAT).to_string(),
        }
    }
}

struct GpxDocument<'a> {
    exporter: &'a GpxExporter,
    recording: &'a RecordingWithEntries,
}

impl fmt::Display for GpxDocument<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recording = &self.recording.recording;

        writeln!(f, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
        writeln!(
            f,
            r#"<gpx xmlns="{GPX_NAMESPACE}" version="1.1" creator="{}">"#,
            escape(&self.exporter.creator)
        )?;
        writeln!(
            f,
            "  <metadata><name>{}</name><time>{}</time></metadata>",
            escape(&recording.name),
            self.exporter.format_time(recording.timestamp)
        )?;

        if self.recording.entries.is_empty() {
            writeln!(f, "  <trk><trkseg/></trk>")?;
        } else {
            writeln!(f, "  <trk><trkseg>")?;
            for entry in &self.recording.entries {
                writeln!(
                    f,
                    r#"    <trkpt lat="{}" lon="{}"><ele>{}</ele><time>{}</time></trkpt>"#,
                    entry.latitude,
                    entry.longitude,
                    entry.altitude,
                    self.exporter.format_time(entry.timestamp)
                )?;
            }
            writeln!(f, "  </trkseg></trk>")?;
        }

        writeln!(f, "</gpx>")
    }
}

/// Escape the five XML special characters.
fn escape(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(text);
    }
    let mut escaped = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}
