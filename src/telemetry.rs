//! Structured per-transition telemetry.
//!
//! Every controller transition appends one single-line JSON record to the
//! session log and mirrors it through `tracing`. The record layout is
//! stable: `{ts, session, cycle, state, event, resources, ...}` with
//! latency, size, and error fields present only when they apply.

use crate::error::Result;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Resource ledger snapshot embedded in each record.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceSnapshot {
    /// Microphone owner label.
    pub mic: &'static str,
    /// Speaker owner label.
    pub spk: &'static str,
}

/// One transition record.
#[derive(Debug, Serialize)]
pub struct TransitionRecord<'a> {
    /// RFC 3339 wall-clock timestamp.
    pub ts: String,
    /// Session identifier.
    pub session: &'a str,
    /// Cycle ordinal, absent outside a cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    /// State after the transition.
    pub state: &'static str,
    /// Event label that caused it.
    pub event: &'a str,
    /// Resource ownership after the transition.
    pub resources: ResourceSnapshot,
    /// Stage latency, when the event completes a stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Payload size, when the event carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Error cause, for failure transitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

/// Append-only transition log sink.
pub struct TransitionLog {
    writer: Option<BufWriter<File>>,
}

impl TransitionLog {
    /// Open (or create) the log file for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or its parent directory cannot be
    /// created.
    pub fn to_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
        })
    }

    /// A log that only mirrors records through `tracing`.
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    /// Append one record.
    pub fn record(&mut self, record: &TransitionRecord<'_>) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                // A record that cannot serialize is a bug, but telemetry
                // must never take the controller down.
                tracing::error!("transition record serialization failed: {e}");
                return;
            }
        };
        info!(target: "voicebridge::transition", "{line}");
        if let Some(writer) = &mut self.writer {
            let _ = writeln!(writer, "{line}");
            let _ = writer.flush();
        }
    }

    /// Flush buffered records to disk.
    pub fn flush(&mut self) {
        if let Some(writer) = &mut self.writer {
            let _ = writer.flush();
        }
    }
}

/// Current wall-clock time in RFC 3339 with millisecond precision.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
