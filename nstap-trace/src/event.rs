//! Trace event model and line codec
//!
//! Traced processes submit one JSON object per line:
//!
//! ```text
//! {"index":3,"message":"Hello","timestamp":"2024-05-01T12:00:00.123456789Z","pid":812}
//! ```
//!
//! The tracer wraps every accepted record into a [`TraceEvent`] carrying its
//! own arrival sequence number and arrival time.

use chrono::{DateTime, Utc};
use nstap_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

/// A trace record as submitted by a traced process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Caller-assigned index
    pub index: u64,
    /// Free-form message
    pub message: String,
    /// Optional structured payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Name of the submitting component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Process id of the submitter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Sender clock at submission
    pub timestamp: DateTime<Utc>,
}

impl TraceRecord {
    /// Record stamped with the current time and process id
    pub fn new<S: Into<String>>(index: u64, message: S) -> Self {
        Self {
            index,
            message: message.into(),
            data: None,
            source: None,
            pid: Some(std::process::id()),
            timestamp: Utc::now(),
        }
    }

    /// Attach a structured payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Name the submitting component
    pub fn with_source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Encode as a single newline-terminated line
    pub fn encode(&self) -> Result<String> {
        let mut line =
            serde_json::to_string(self).map_err(|e| Error::MalformedEvent(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line, surrounding whitespace ignored
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).map_err(|e| Error::MalformedEvent(e.to_string()))
    }
}

/// A record as accepted by the tracer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Arrival order at the tracer, starting at zero
    pub seq: u64,
    #[serde(flatten)]
    pub record: TraceRecord,
    /// Tracer clock at arrival
    pub arrival: DateTime<Utc>,
}

impl TraceEvent {
    pub fn new(seq: u64, record: TraceRecord, arrival: DateTime<Utc>) -> Self {
        Self {
            seq,
            record,
            arrival,
        }
    }

    /// Caller-assigned index
    pub fn index(&self) -> u64 {
        self.record.index
    }

    /// Free-form message
    pub fn message(&self) -> &str {
        &self.record.message
    }

    /// Arrival time as an offset from the Unix epoch
    ///
    /// This is the clock domain of packet timestamps in a capture container.
    pub fn since_epoch(&self) -> Duration {
        let secs = self.arrival.timestamp().max(0) as u64;
        Duration::new(secs, self.arrival.timestamp_subsec_nanos())
    }

    /// JSON encoding without the trailing newline
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::MalformedEvent(e.to_string()))
    }

    /// Decode one event log line
    pub fn from_json(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).map_err(|e| Error::MalformedEvent(e.to_string()))
    }
}

/// Read an event log written by a tracer
///
/// Blank lines are skipped; any other undecodable line is an error.
pub fn read_log<P: AsRef<Path>>(path: P) -> Result<Vec<TraceEvent>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(TraceEvent::from_json(&line)?);
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_line_has_no_embedded_newline() {
        let record = TraceRecord::new(4, "multi\nline").with_data(json!({"k": "v"}));
        let line = record.encode().unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(TraceRecord::decode(&line).unwrap(), record);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let mut record = TraceRecord::new(0, "x");
        record.pid = None;
        let line = record.encode().unwrap();

        assert!(!line.contains("data"));
        assert!(!line.contains("source"));
        assert!(!line.contains("pid"));
    }

    #[test]
    fn test_decode_minimal_record() {
        let record = TraceRecord::decode(
            r#"{"index":2,"message":"hi","timestamp":"2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();

        assert_eq!(record.index, 2);
        assert_eq!(record.message, "hi");
        assert_eq!(record.pid, None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            TraceRecord::decode("not json"),
            Err(Error::MalformedEvent(_))
        ));
        // timestamp is required
        assert!(TraceRecord::decode(r#"{"index":1,"message":"m"}"#).is_err());
        assert!(TraceRecord::decode(r#"{"index":-1,"message":"m","timestamp":"2024-05-01T12:00:00Z"}"#).is_err());
    }

    #[test]
    fn test_event_flattens_record() {
        let arrival = DateTime::parse_from_rfc3339("2024-05-01T12:00:01.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = TraceEvent::new(9, TraceRecord::new(3, "m").with_source("h1"), arrival);
        let text = event.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["seq"], 9);
        assert_eq!(value["index"], 3);
        assert_eq!(value["source"], "h1");
        assert_eq!(TraceEvent::from_json(&text).unwrap(), event);
        assert_eq!(event.since_epoch(), Duration::new(1714564801, 500_000_000));
    }

    #[test]
    fn test_read_log_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let a = TraceEvent::new(0, TraceRecord::new(0, "a"), Utc::now());
        let b = TraceEvent::new(1, TraceRecord::new(1, "b"), Utc::now());
        let text = format!("{}\n\n{}\n", a.to_json().unwrap(), b.to_json().unwrap());
        std::fs::write(&path, text).unwrap();

        let events = read_log(&path).unwrap();
        assert_eq!(events, vec![a, b]);
    }
}
