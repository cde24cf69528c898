//! Synthesis adapter for a streaming PCM speech endpoint.
//!
//! Speaks the OpenAI-style `/audio/speech` shape with `response_format`
//! set to raw PCM, so chunks can go straight to the playback pump as they
//! arrive. The PCM carries no header; the sample rate comes from a
//! response header when present, otherwise from configuration.

use crate::config::SynthesizerConfig;
use crate::error::{BridgeError, Result};
use crate::stages::{SynthesisChunk, SynthesisStream, Synthesizer};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;

/// Response headers that may carry the PCM sample rate.
const SAMPLE_RATE_HEADERS: [&str; 3] = ["x-audio-sample-rate", "x-sample-rate", "sample-rate"];

/// Client for a streaming text-to-speech backend.
pub struct HttpSynthesizer {
    config: SynthesizerConfig,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    /// Build a client for the configured endpoint.
    pub fn new(config: SynthesizerConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: String) -> Result<SynthesisStream> {
        if text.trim().is_empty() {
            return Err(BridgeError::Synthesis(
                "text to synthesize is empty".to_owned(),
            ));
        }

        let mut payload = json!({
            "model": self.config.model,
            "input": text,
            "response_format": "pcm",
        });
        if let Some(voice) = &self.config.voice {
            payload["voice"] = json!(voice);
        }
        if let Some(speed) = self.config.speed {
            payload["speed"] = json!(speed);
        }

        let url = format!(
            "{}/audio/speech",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .header("accept", "application/octet-stream")
            .json(&payload)
            .send()
            .await
            .map_err(|e| BridgeError::Synthesis(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Synthesis(format!(
                "endpoint returned {status}: {}",
                body.trim()
            )));
        }

        let sample_rate = SAMPLE_RATE_HEADERS
            .iter()
            .find_map(|name| {
                response
                    .headers()
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u32>().ok())
            })
            .unwrap_or(self.config.sample_rate);

        // Transport chunking is byte-oriented; keep sample alignment by
        // carrying a dangling byte over to the next chunk.
        let stream = response
            .bytes_stream()
            .scan(Vec::<u8>::new(), move |carry, item| {
                let out = match item {
                    Ok(bytes) => {
                        let mut pcm = std::mem::take(carry);
                        pcm.extend_from_slice(&bytes);
                        if pcm.len() % 2 != 0 {
                            if let Some(dangling) = pcm.pop() {
                                carry.push(dangling);
                            }
                        }
                        Ok(SynthesisChunk {
                            pcm,
                            sample_rate,
                            bits: 16,
                            channels: 1,
                        })
                    }
                    Err(e) => Err(BridgeError::Synthesis(format!("stream read failed: {e}"))),
                };
                futures_util::future::ready(Some(out))
            });

        Ok(Box::pin(stream))
    }
}
