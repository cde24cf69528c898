//! Recognition adapter wrapping a whisper.cpp style command-line
//! transcriber.
//!
//! The segment PCM is written to a temporary WAV file, the transcriber is
//! run with JSON output, and the per-segment texts are joined. Temp files
//! are removed on every exit path.

use crate::config::RecognizerConfig;
use crate::error::{BridgeError, Result};
use crate::stages::Recognizer;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// CLI transcriber client.
pub struct CommandRecognizer {
    config: RecognizerConfig,
}

impl CommandRecognizer {
    /// Build a client for the configured binary and model.
    pub fn new(config: RecognizerConfig) -> Self {
        Self { config }
    }

    fn scratch_paths() -> (PathBuf, PathBuf) {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let base = std::env::temp_dir().join(format!("voicebridge-asr-{token}"));
        (base.with_extension("wav"), base)
    }
}

#[async_trait]
impl Recognizer for CommandRecognizer {
    async fn recognize(&self, pcm: Vec<i16>, sample_rate: u32) -> Result<String> {
        let (wav_path, out_prefix) = Self::scratch_paths();
        let json_path = out_prefix.with_extension("json");

        write_wav(&wav_path, &pcm, sample_rate)?;

        let output = Command::new(&self.config.binary)
            .arg("-m")
            .arg(&self.config.model)
            .arg("-f")
            .arg(&wav_path)
            .arg("--language")
            .arg(&self.config.language)
            .arg("-oj")
            .arg("-of")
            .arg(&out_prefix)
            .arg("-np")
            .args(&self.config.extra_args)
            .output()
            .await;

        let result = match output {
            Ok(output) if output.status.success() => read_transcript(&json_path),
            Ok(output) => Err(BridgeError::Recognizer(format!(
                "transcriber exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Err(e) => Err(BridgeError::Recognizer(format!(
                "cannot run {}: {e}",
                self.config.binary.display()
            ))),
        };

        let _ = std::fs::remove_file(&wav_path);
        let _ = std::fs::remove_file(&json_path);
        result
    }
}

fn write_wav(path: &std::path::Path, pcm: &[i16], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| BridgeError::Recognizer(format!("cannot create {}: {e}", path.display())))?;
    for &sample in pcm {
        writer
            .write_sample(sample)
            .map_err(|e| BridgeError::Recognizer(format!("WAV write failed: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| BridgeError::Recognizer(format!("WAV finalize failed: {e}")))?;
    Ok(())
}

fn read_transcript(json_path: &std::path::Path) -> Result<String> {
    let raw = std::fs::read_to_string(json_path)
        .map_err(|e| BridgeError::Recognizer(format!("no JSON output: {e}")))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| BridgeError::Recognizer(format!("unparseable JSON output: {e}")))?;

    let segments = value
        .get("transcription")
        .and_then(|t| t.as_array())
        .ok_or_else(|| BridgeError::Recognizer("JSON output has no transcription".to_owned()))?;

    let mut parts = Vec::new();
    for segment in segments {
        if let Some(text) = segment.get("text").and_then(|t| t.as_str()) {
            let text = text.trim();
            if !text.is_empty() {
                parts.push(text.to_owned());
            }
        }
    }
    let joined = parts.join(" ");
    debug!("transcriber returned {} segment(s)", segments.len());
    Ok(joined)
}
