//! Rewrite adapter for an OpenAI-compatible chat completions endpoint.

use crate::config::RewriterConfig;
use crate::error::{BridgeError, Result};
use crate::stages::Rewriter;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

/// Rough character budget per token, used as a guardrail on top of the
/// server-side token cap.
const CHARS_PER_TOKEN: f64 = 4.2;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Client for a chat-completions rewrite backend.
pub struct HttpRewriter {
    config: RewriterConfig,
    client: reqwest::Client,
}

impl HttpRewriter {
    /// Build a client for the configured endpoint.
    pub fn new(config: RewriterConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn user_prompt(&self, transcript: &str) -> String {
        format!(
            "Rewrite the transcript into clean, fluent text in the same language. \
             Do not add new information or commentary. Output the corrected text only.\n\n\
             Transcript:\n{}\n\nCorrected text:",
            transcript.trim()
        )
    }
}

#[async_trait]
impl Rewriter for HttpRewriter {
    async fn rewrite(&self, transcript: String) -> Result<String> {
        let payload = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": self.config.system_prompt},
                {"role": "user", "content": self.user_prompt(&transcript)},
            ],
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "max_tokens": self.config.max_tokens,
        });

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BridgeError::Rewriter(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Rewriter(format!(
                "endpoint returned {status}: {}",
                body.trim()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Rewriter(format!("unparseable response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| BridgeError::Rewriter("response carried no choices".to_owned()))?;

        let mut cleaned = content.trim().to_owned();
        let max_chars = (self.config.max_tokens as f64 * CHARS_PER_TOKEN) as usize;
        if cleaned.len() > max_chars {
            let mut cut = max_chars;
            while cut > 0 && !cleaned.is_char_boundary(cut) {
                cut -= 1;
            }
            cleaned.truncate(cut);
            cleaned = cleaned.trim_end().to_owned();
        }
        Ok(cleaned)
    }
}
