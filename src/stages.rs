//! Pipeline stage contracts.
//!
//! The controller drives three external collaborators through these traits:
//! recognition, rewrite, and synthesis. Each stage runs on its own task
//! with a controller-side watchdog; the traits themselves carry no timeout
//! logic. Synthesis output is a lazy finite stream with an explicit end.

use crate::error::Result;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// One chunk of synthesized audio.
///
/// The first chunk of a stream establishes the playback format; subsequent
/// chunks must match it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisChunk {
    /// Little-endian 16-bit PCM bytes.
    pub pcm: Vec<u8>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bits per sample. The playback pump requires 16.
    pub bits: u16,
    /// Channel count. The playback pump requires mono.
    pub channels: u16,
}

/// Lazy finite sequence of synthesized audio chunks. The stream ends by
/// returning `None`; errors mid-stream interrupt the playback job.
pub type SynthesisStream = Pin<Box<dyn Stream<Item = Result<SynthesisChunk>> + Send>>;

/// A synthesis stream whose first chunk has already arrived, plus the
/// moment it did. Handed from the synthesis stage to the playback pump.
pub struct SynthesisJob {
    /// The format-establishing first chunk.
    pub first_chunk: SynthesisChunk,
    /// When the first chunk arrived (first-chunk latency anchor).
    pub first_chunk_at: Instant,
    /// The remaining chunks.
    pub rest: SynthesisStream,
}

impl std::fmt::Debug for SynthesisJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisJob")
            .field("first_chunk", &self.first_chunk)
            .finish_non_exhaustive()
    }
}

/// Speech recognition collaborator.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Transcribe mono 16-bit PCM. The result may be empty.
    ///
    /// # Errors
    ///
    /// Returns an error on collaborator failure.
    async fn recognize(&self, pcm: Vec<i16>, sample_rate: u32) -> Result<String>;
}

/// Transcript rewrite collaborator.
#[async_trait]
pub trait Rewriter: Send + Sync {
    /// Rewrite a transcript into clean text, bounded by the collaborator's
    /// token cap.
    ///
    /// # Errors
    ///
    /// Returns an error on collaborator failure.
    async fn rewrite(&self, transcript: String) -> Result<String>;
}

/// Speech synthesis collaborator.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize text into a lazy audio stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened.
    async fn synthesize(&self, text: String) -> Result<SynthesisStream>;
}

/// The three collaborators a session is constructed with.
#[derive(Clone)]
pub struct StageAdapters {
    /// Recognition collaborator.
    pub recognizer: Arc<dyn Recognizer>,
    /// Rewrite collaborator.
    pub rewriter: Arc<dyn Rewriter>,
    /// Synthesis collaborator.
    pub synthesizer: Arc<dyn Synthesizer>,
}

/// Markers some recognition engines emit for non-speech audio.
const BLANK_TRANSCRIPT_MARKERS: [&str; 5] = [
    "[BLANK_AUDIO]",
    "[BLANK]",
    "[SILENCE]",
    "[EMPTY]",
    "[NO_SPEECH]",
];

/// Parenthetical annotations that describe noise rather than speech.
const PARENTHETICAL_NOISE_TOKENS: [&str; 8] = [
    "music",
    "upbeat music",
    "background music",
    "applause",
    "laughter",
    "silence",
    "noise",
    "static",
];

/// Phrases a rewrite model produces when it refuses instead of rewriting.
const REWRITE_REFUSAL_PHRASES: [&str; 6] = [
    "please provide the transcript",
    "no transcript provided",
    "there was no transcript",
    "i'm unable to correct",
    "transcript is blank",
    "it seems there was no input",
];

/// Normalize a recognizer result. Returns an empty string for blank
/// markers, noise annotations, and punctuation-only output, so the
/// controller's empty-transcript short-circuit applies uniformly.
pub fn normalize_transcript(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let upper = trimmed.to_uppercase();
    if BLANK_TRANSCRIPT_MARKERS.contains(&upper.as_str()) {
        return String::new();
    }

    let lower = trimmed.to_lowercase();
    if trimmed.starts_with('(') && trimmed.ends_with(')') {
        let inner = lower.trim_matches(|c| c == '(' || c == ')' || c == ' ');
        if inner.is_empty()
            || PARENTHETICAL_NOISE_TOKENS
                .iter()
                .any(|token| inner.contains(token))
        {
            return String::new();
        }
    }

    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        let inner = format!("[{}]", lower.trim_matches(|c| c == '[' || c == ']' || c == ' '));
        if BLANK_TRANSCRIPT_MARKERS
            .iter()
            .any(|marker| marker.eq_ignore_ascii_case(&inner))
        {
            return String::new();
        }
    }

    if trimmed
        .chars()
        .all(|c| ".,!?:;-'\"()[]{} ".contains(c))
    {
        return String::new();
    }

    trimmed.to_owned()
}

/// True when a rewrite result is a refusal or diagnostic rather than a
/// usable rewrite; the controller treats it like an empty rewrite.
pub fn is_unusable_rewrite(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_lowercase();
    if ["[no_speech]", "[blank_audio]", "[silence]"].contains(&lower.as_str()) {
        return true;
    }
    REWRITE_REFUSAL_PHRASES
        .iter()
        .any(|phrase| lower.contains(phrase))
}
