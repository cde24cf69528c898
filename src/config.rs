//! Configuration types for the session controller.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for a bridge session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Serial link settings.
    pub serial: SerialConfig,
    /// Audio buffering settings.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Per-stage watchdog settings.
    pub stages: StageConfig,
    /// Playback pump settings.
    pub playback: PlaybackConfig,
    /// Session lifecycle settings.
    pub session: SessionConfig,
    /// Rewrite collaborator endpoint settings.
    pub rewriter: RewriterConfig,
    /// Synthesis collaborator endpoint settings.
    pub synthesizer: SynthesizerConfig,
    /// Recognition collaborator settings.
    pub recognizer: RecognizerConfig,
}

/// Serial link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path (e.g. `/dev/ttyACM0`).
    pub device: String,
    /// Baud rate. The bridge firmware runs at 921 600, 8N1, no flow control.
    pub baud_rate: u32,
    /// Per-read timeout for the blocking serial reader, in milliseconds.
    pub read_timeout_ms: u64,
    /// How long to wait for the device's `READY` banner at startup, in
    /// milliseconds. The session proceeds with a warning if it never comes.
    pub ready_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyACM0".to_owned(),
            baud_rate: 921_600,
            read_timeout_ms: 200,
            ready_timeout_ms: 5_000,
        }
    }
}

/// Audio buffering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Mic sample rate in Hz. The bridge firmware captures 16 kHz mono.
    pub sample_rate: u32,
    /// Rolling buffer capacity in seconds. Must cover the longest utterance
    /// plus pre-roll; old samples are evicted past this point.
    pub buffer_capacity_secs: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            buffer_capacity_secs: 32.0,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Detection aggressiveness, 0 (permissive) to 3 (strict).
    pub aggressiveness: u8,
    /// Sub-frame duration in milliseconds.
    pub frame_duration_ms: u32,
    /// Consecutive voiced sub-frames required to open a segment.
    pub start_trigger_frames: u32,
    /// Consecutive unvoiced sub-frames required to close a segment
    /// (the hangover).
    pub stop_trigger_frames: u32,
    /// Audio included before the first voiced frame, in milliseconds.
    pub pre_roll_ms: u32,
    /// Audio included after the last voiced frame, in milliseconds.
    pub post_roll_ms: u32,
    /// Segments separated by less than this gap are merged, in milliseconds.
    pub min_gap_ms: u32,
    /// Minimum voiced duration for a segment to be accepted, in milliseconds.
    pub min_segment_duration_ms: u32,
    /// Minimum mean absolute sample amplitude for a segment to be accepted.
    pub min_segment_mean_abs: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            aggressiveness: 2,
            frame_duration_ms: 20,
            start_trigger_frames: 3,
            stop_trigger_frames: 20,
            pre_roll_ms: 200,
            post_roll_ms: 200,
            min_gap_ms: 60,
            min_segment_duration_ms: 200,
            min_segment_mean_abs: 200.0,
        }
    }
}

/// Per-stage watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Recognition watchdog in milliseconds.
    pub recognize_timeout_ms: u64,
    /// Rewrite watchdog in milliseconds.
    pub rewrite_timeout_ms: u64,
    /// Watchdog for the first synthesized chunk, in milliseconds.
    pub synthesis_first_chunk_timeout_ms: u64,
    /// Playback watchdog covering streaming and the device acknowledgement,
    /// in milliseconds.
    pub playback_timeout_ms: u64,
    /// Maximum capture duration before the cycle is abandoned, in
    /// milliseconds. `None` disables the capture watchdog.
    pub capture_timeout_ms: Option<u64>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            recognize_timeout_ms: 15_000,
            rewrite_timeout_ms: 20_000,
            synthesis_first_chunk_timeout_ms: 5_000,
            playback_timeout_ms: 20_000,
            capture_timeout_ms: Some(30_000),
        }
    }
}

/// Playback pump configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Paced write size in bytes. Bounded so the device's receive DMA is
    /// never starved and the host send buffer never overflows.
    pub chunk_bytes: usize,
    /// Pause between playback completion and re-enabling capture, in
    /// milliseconds. Avoids re-triggering on residual speaker output.
    pub guard_delay_ms: u64,
    /// Gain applied to the synthesized audio, in dB. 0.0 = passthrough.
    pub gain_db: f32,
    /// Resample the synthesized stream to this rate before playback
    /// (downsample only). `None` plays the synthesized format untouched.
    pub target_sample_rate: Option<u32>,
    /// First-order high-pass cutoff applied during playback, in Hz.
    /// `None` disables the filter.
    pub high_pass_cutoff_hz: Option<f32>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 1024,
            guard_delay_ms: 200,
            gain_db: 0.0,
            target_sample_rate: None,
            high_pass_cutoff_hz: None,
        }
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Stop after this many completed cycles. `None` runs until cancelled.
    pub max_cycles: Option<u32>,
    /// Suppress segment starts while the device reports `PRESENCE OFF`.
    /// When false, presence lines are informational only.
    pub gate_on_presence: bool,
    /// Append-only transition log path. `None` disables the persisted log.
    pub log_path: Option<PathBuf>,
}

/// Rewrite collaborator configuration (OpenAI-compatible chat endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriterConfig {
    /// Base URL of the chat completions API.
    pub base_url: String,
    /// Model name to request.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Top-p sampling threshold.
    pub top_p: f64,
    /// Token cap for the rewritten text.
    pub max_tokens: usize,
    /// System prompt establishing the rewrite task.
    pub system_prompt: String,
}

impl Default for RewriterConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/v1".to_owned(),
            model: "meta-llama/Llama-3.1-8B-Instruct".to_owned(),
            temperature: 0.2,
            top_p: 0.9,
            max_tokens: 128,
            system_prompt: "You perfect automatic speech recognition transcripts. \
                Return only the corrected transcript with no explanations, \
                headers, or meta commentary."
                .to_owned(),
        }
    }
}

/// Synthesis collaborator configuration (streaming PCM endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesizerConfig {
    /// Base URL of the speech API.
    pub base_url: String,
    /// Model name to request.
    pub model: String,
    /// Voice identifier, if the endpoint supports selection.
    pub voice: Option<String>,
    /// Sample rate of the returned PCM when the response carries no
    /// sample-rate header.
    pub sample_rate: u32,
    /// Speaking speed multiplier, if the endpoint supports it.
    pub speed: Option<f32>,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8880/v1".to_owned(),
            model: "kokoro".to_owned(),
            voice: None,
            sample_rate: 24_000,
            speed: None,
        }
    }
}

/// Recognition collaborator configuration (whisper.cpp style CLI).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Path to the transcriber executable.
    pub binary: PathBuf,
    /// Path to the model file.
    pub model: PathBuf,
    /// Transcription language.
    pub language: String,
    /// Extra arguments appended to the command line.
    pub extra_args: Vec<String>,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("whisper-cli"),
            model: PathBuf::from("models/ggml-base.en.bin"),
            language: "en".to_owned(),
            extra_args: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::BridgeError::Config(e.to_string()))
    }

    /// Rolling buffer capacity in samples.
    pub fn buffer_capacity_samples(&self) -> usize {
        (self.audio.buffer_capacity_secs * self.audio.sample_rate as f32) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_contract() {
        let config = BridgeConfig::default();
        assert_eq!(config.serial.baud_rate, 921_600);
        assert_eq!(config.audio.sample_rate, 16_000);
        assert_eq!(config.vad.frame_duration_ms, 20);
        assert_eq!(config.vad.start_trigger_frames, 3);
        assert_eq!(config.vad.stop_trigger_frames, 20);
        assert_eq!(config.stages.recognize_timeout_ms, 15_000);
        assert_eq!(config.stages.rewrite_timeout_ms, 20_000);
        assert_eq!(config.stages.synthesis_first_chunk_timeout_ms, 5_000);
        assert_eq!(config.stages.playback_timeout_ms, 20_000);
        assert_eq!(config.playback.chunk_bytes, 1024);
        assert!(config.playback.guard_delay_ms >= 200);
    }

    #[test]
    fn buffer_capacity_covers_max_capture() {
        let config = BridgeConfig::default();
        let capture_samples = config.stages.capture_timeout_ms.unwrap_or(0) as usize
            * config.audio.sample_rate as usize
            / 1000;
        assert!(config.buffer_capacity_samples() >= capture_samples);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: BridgeConfig = toml::from_str(
            r#"
            [serial]
            device = "/dev/ttyUSB3"
            baud_rate = 921600
            read_timeout_ms = 100
            ready_timeout_ms = 2000
            "#,
        )
        .expect("parse partial config");
        assert_eq!(parsed.serial.device, "/dev/ttyUSB3");
        assert_eq!(parsed.audio.sample_rate, 16_000);
        assert_eq!(parsed.vad.min_segment_duration_ms, 200);
    }
}
