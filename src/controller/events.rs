//! Controller event vocabulary.
//!
//! Every producer (link reader, mic ingest, stage tasks, watchdog timers)
//! communicates with the controller exclusively through these events on a
//! single-consumer queue. No producer mutates controller state directly.

use crate::playback::PlaybackReport;
use crate::segmenter::SegmentBounds;
use crate::stages::SynthesisJob;
use std::time::Instant;

/// Pipeline stage identifiers, used for watchdogs and stage results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Utterance capture (segment still open).
    Capture,
    /// Speech recognition.
    Recognize,
    /// Transcript rewrite.
    Rewrite,
    /// Speech synthesis up to the first chunk.
    Synthesis,
    /// Playback streaming and device acknowledgement.
    Playback,
}

impl StageKind {
    /// Stable label for telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Recognize => "recognize",
            Self::Rewrite => "rewrite",
            Self::Synthesis => "synthesis",
            Self::Playback => "playback",
        }
    }
}

/// Why a cycle failed. Labels match the persisted error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCause {
    /// Capture exceeded its maximum duration.
    CaptureTimedOut,
    /// Recognition collaborator failed.
    RecognizerFailed,
    /// Recognition watchdog fired.
    RecognizerTimedOut,
    /// Rewrite collaborator failed.
    RewriterFailed,
    /// Rewrite watchdog fired.
    RewriterTimedOut,
    /// No first synthesis chunk before the watchdog fired.
    SynthesisFirstChunkTimedOut,
    /// The synthesis stream failed mid-cycle.
    SynthesisInterrupted,
    /// Playback streaming exceeded the watchdog.
    PlaybackTimedOut,
    /// The device never acknowledged a fully streamed playback job.
    DeviceAckMissing,
    /// The rolling buffer could not evict under a live segment.
    BufferPressure,
    /// The serial link failed while a cycle held it.
    LinkFailed,
    /// An operator asked for the cycle to be abandoned.
    OperatorReset,
}

impl ErrorCause {
    /// Stable label for telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CaptureTimedOut => "capture_timed_out",
            Self::RecognizerFailed => "recognizer_failed",
            Self::RecognizerTimedOut => "recognizer_timed_out",
            Self::RewriterFailed => "rewriter_failed",
            Self::RewriterTimedOut => "rewriter_timed_out",
            Self::SynthesisFirstChunkTimedOut => "synthesis_first_chunk_timed_out",
            Self::SynthesisInterrupted => "synthesis_interrupted",
            Self::PlaybackTimedOut => "playback_timed_out",
            Self::DeviceAckMissing => "device_ack_missing",
            Self::BufferPressure => "buffer_pressure",
            Self::LinkFailed => "link_failed",
            Self::OperatorReset => "operator_reset",
        }
    }
}

/// Payload of a completed stage.
pub enum StageResult {
    /// Recognizer output (already hygiene-normalized by the stage task).
    Transcript(String),
    /// Rewriter output.
    Rewritten(String),
    /// Synthesis stream with its first chunk resolved.
    Synthesis(SynthesisJob),
    /// Playback pump finished streaming (acknowledgement still pending).
    PlaybackFinished(PlaybackReport),
}

impl std::fmt::Debug for StageResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transcript(t) => f.debug_tuple("Transcript").field(&t.len()).finish(),
            Self::Rewritten(t) => f.debug_tuple("Rewritten").field(&t.len()).finish(),
            Self::Synthesis(_) => f.write_str("Synthesis(..)"),
            Self::PlaybackFinished(r) => f.debug_tuple("PlaybackFinished").field(r).finish(),
        }
    }
}

/// A record on the controller's single-consumer event queue.
#[derive(Debug)]
pub enum Event {
    /// One mic frame was ingested.
    FrameArrived {
        /// Monotonic receive timestamp.
        received_at: Instant,
        /// Samples the frame carried.
        sample_count: usize,
    },
    /// The segmenter latched onto speech.
    SegmentStart {
        /// Slice start including pre-roll.
        start_index: u64,
    },
    /// The segmenter closed an utterance.
    SegmentEnd(SegmentBounds),
    /// A stage task finished.
    StageCompleted(StageKind, StageResult),
    /// A stage task failed.
    StageFailed(StageKind, ErrorCause, String),
    /// The device acknowledged playback completion (`PLAYBACK_DONE`).
    PlaybackAck,
    /// Any other device line.
    DeviceLine(String),
    /// A stage watchdog fired.
    Timeout(StageKind),
    /// The cleanup or error guard delay elapsed.
    GuardElapsed,
    /// Sustained rolling-buffer pressure; fatal to the active cycle.
    BufferPressure {
        /// Resident samples at the time of the report.
        resident_samples: usize,
    },
    /// Operator asked for the current cycle to be abandoned.
    OperatorReset,
    /// Orderly shutdown request.
    Shutdown,
}

/// Map a device line to its controller event.
pub fn classify_line(text: String) -> Event {
    if text == "PLAYBACK_DONE" {
        Event::PlaybackAck
    } else {
        Event::DeviceLine(text)
    }
}
