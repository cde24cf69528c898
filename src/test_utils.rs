//! Shared fixtures for unit and integration tests: a scripted transport, a
//! captured outbound sink, PCM builders, and mock collaborators.

use crate::error::{BridgeError, Result};
use crate::link::codec::encode_audio_frame;
use crate::link::LinkTransport;
use crate::stages::{Recognizer, Rewriter, SynthesisChunk, SynthesisStream, Synthesizer};
use async_trait::async_trait;
use futures_util::stream;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------
// Scripted transport

/// Test-side handle that feeds bytes to a [`ScriptedTransport`].
#[derive(Clone)]
pub struct DeviceScript {
    tx: Sender<Vec<u8>>,
}

impl DeviceScript {
    /// Queue raw bytes for the reader.
    pub fn send_bytes(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(bytes);
    }

    /// Queue one newline-terminated device line.
    pub fn send_line(&self, line: &str) {
        self.send_bytes(format!("{line}\n").into_bytes());
    }

    /// Queue PCM samples as firmware audio frames of `frame_samples` each.
    pub fn send_audio(&self, samples: &[i16], frame_samples: usize) {
        for chunk in samples.chunks(frame_samples.max(1)) {
            let payload: Vec<u8> = chunk.iter().flat_map(|s| s.to_le_bytes()).collect();
            self.send_bytes(encode_audio_frame(&payload));
        }
    }
}

/// In-memory transport driven by a [`DeviceScript`].
pub struct ScriptedTransport {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

/// Build a connected script/transport pair.
pub fn scripted_link() -> (DeviceScript, ScriptedTransport) {
    let (tx, rx) = channel();
    (
        DeviceScript { tx },
        ScriptedTransport {
            rx,
            pending: VecDeque::new(),
        },
    )
}

impl LinkTransport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(Duration::from_millis(10)) {
                Ok(bytes) => self.pending.extend(bytes),
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    // Keep the link "open but quiet" so shutdown paths run.
                    std::thread::sleep(Duration::from_millis(5));
                    return Ok(0);
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

// ---------------------------------------------------------------------
// Captured outbound sink

/// Outbound sink that records everything the controller writes.
#[derive(Clone, Default)]
pub struct CapturedSink {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CapturedSink {
    /// Snapshot of the raw outbound bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().expect("sink lock").clone()
    }

    /// Outbound ASCII command lines, with playback payload bytes elided.
    ///
    /// Payload bytes are located from each `START ... <samples>` header, so
    /// binary PCM never confuses line splitting.
    pub fn command_lines(&self) -> Vec<String> {
        let bytes = self.bytes();
        let mut lines = Vec::new();
        let mut at = 0;
        while at < bytes.len() {
            let Some(nl) = bytes[at..].iter().position(|&b| b == b'\n') else {
                break;
            };
            let line = String::from_utf8_lossy(&bytes[at..at + nl]).to_string();
            at += nl + 1;
            if let Some(rest) = line.strip_prefix("START ") {
                if let Some(samples) = rest
                    .split_whitespace()
                    .nth(3)
                    .and_then(|s| s.parse::<usize>().ok())
                {
                    at += samples * 2;
                }
            }
            lines.push(line);
        }
        lines
    }

    /// Payload bytes of the first playback job, if any.
    pub fn first_payload(&self) -> Option<Vec<u8>> {
        let bytes = self.bytes();
        let mut at = 0;
        while at < bytes.len() {
            let nl = bytes[at..].iter().position(|&b| b == b'\n')?;
            let line = String::from_utf8_lossy(&bytes[at..at + nl]).to_string();
            at += nl + 1;
            if let Some(rest) = line.strip_prefix("START ") {
                let samples = rest
                    .split_whitespace()
                    .nth(3)
                    .and_then(|s| s.parse::<usize>().ok())?;
                return Some(bytes[at..at + samples * 2].to_vec());
            }
        }
        None
    }

    /// True once `needle` appears among the command lines.
    pub fn saw_command(&self, needle: &str) -> bool {
        self.command_lines().iter().any(|line| line == needle)
    }
}

impl Write for CapturedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().expect("sink lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// PCM builders

/// A sine wave as 16-bit PCM.
pub fn sine_pcm(freq_hz: f32, amplitude: f32, secs: f32, sample_rate: u32) -> Vec<i16> {
    let count = (secs * sample_rate as f32) as usize;
    (0..count)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (amplitude * (2.0 * std::f32::consts::PI * freq_hz * t).sin()).round() as i16
        })
        .collect()
}

/// Silence as 16-bit PCM.
pub fn silence_pcm(secs: f32, sample_rate: u32) -> Vec<i16> {
    vec![0i16; (secs * sample_rate as f32) as usize]
}

/// Little-endian bytes of a sample slice.
pub fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

// ---------------------------------------------------------------------
// Mock collaborators

/// Scripted behavior for a mock stage call.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return this text.
    Reply(String),
    /// Fail with this message.
    Fail(String),
    /// Never return.
    Hang,
}

/// Recognizer mock; records every submitted slice.
pub struct MockRecognizer {
    behavior: MockBehavior,
    /// Submitted `(pcm, sample_rate)` pairs, in call order.
    pub calls: Arc<Mutex<Vec<(Vec<i16>, u32)>>>,
}

impl MockRecognizer {
    /// A recognizer that always returns `text`.
    pub fn replying(text: &str) -> Self {
        Self::with_behavior(MockBehavior::Reply(text.to_owned()))
    }

    /// A recognizer with explicit behavior.
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Recognizer for MockRecognizer {
    async fn recognize(&self, pcm: Vec<i16>, sample_rate: u32) -> Result<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((pcm, sample_rate));
        match &self.behavior {
            MockBehavior::Reply(text) => Ok(text.clone()),
            MockBehavior::Fail(message) => Err(BridgeError::Recognizer(message.clone())),
            MockBehavior::Hang => std::future::pending().await,
        }
    }
}

/// Rewriter mock driven by a queue of behaviors; repeats the last one when
/// the queue runs dry.
pub struct MockRewriter {
    script: Mutex<VecDeque<MockBehavior>>,
    /// Inputs received, in call order.
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockRewriter {
    /// A rewriter that always returns `text`.
    pub fn replying(text: &str) -> Self {
        Self::scripted(vec![MockBehavior::Reply(text.to_owned())])
    }

    /// A rewriter that walks through `script`.
    pub fn scripted(script: Vec<MockBehavior>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Rewriter for MockRewriter {
    async fn rewrite(&self, transcript: String) -> Result<String> {
        self.calls.lock().expect("calls lock").push(transcript);
        let behavior = {
            let mut script = self.script.lock().expect("script lock");
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match behavior {
            Some(MockBehavior::Reply(text)) => Ok(text),
            Some(MockBehavior::Fail(message)) => Err(BridgeError::Rewriter(message)),
            Some(MockBehavior::Hang) => std::future::pending().await,
            None => Ok(String::new()),
        }
    }
}

/// What a mock synthesizer produces.
pub enum MockSynthesis {
    /// A fixed PCM buffer split into `chunk_samples` chunks.
    Pcm {
        /// Samples to stream.
        samples: Vec<i16>,
        /// Sample rate of the stream.
        sample_rate: u32,
        /// Samples per chunk.
        chunk_samples: usize,
    },
    /// Valid chunks, then a mid-stream error.
    FailAfter {
        /// Chunks delivered before the failure.
        chunks: Vec<SynthesisChunk>,
        /// Failure message.
        message: String,
    },
    /// Never yield the first chunk.
    Hang,
    /// Fail immediately when opening the stream.
    Refuse(String),
}

/// Synthesizer mock.
pub struct MockSynthesizer {
    output: MockSynthesis,
    /// Texts received, in call order.
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockSynthesizer {
    /// Build a mock with the given output.
    pub fn new(output: MockSynthesis) -> Self {
        Self {
            output,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A synthesizer streaming `samples` at `sample_rate` in 1 KiB chunks.
    pub fn streaming(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self::new(MockSynthesis::Pcm {
            samples,
            sample_rate,
            chunk_samples: 512,
        })
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: String) -> Result<SynthesisStream> {
        self.calls.lock().expect("calls lock").push(text);
        match &self.output {
            MockSynthesis::Pcm {
                samples,
                sample_rate,
                chunk_samples,
            } => {
                let rate = *sample_rate;
                let per_chunk = (*chunk_samples).max(1);
                let chunks: Vec<Result<SynthesisChunk>> = samples
                    .chunks(per_chunk)
                    .map(|chunk| {
                        Ok(SynthesisChunk {
                            pcm: pcm_bytes(chunk),
                            sample_rate: rate,
                            bits: 16,
                            channels: 1,
                        })
                    })
                    .collect();
                Ok(Box::pin(stream::iter(chunks)))
            }
            MockSynthesis::FailAfter { chunks, message } => {
                let mut items: Vec<Result<SynthesisChunk>> =
                    chunks.iter().cloned().map(Ok).collect();
                items.push(Err(BridgeError::Synthesis(message.clone())));
                Ok(Box::pin(stream::iter(items)))
            }
            MockSynthesis::Hang => Ok(Box::pin(stream::pending::<Result<SynthesisChunk>>())),
            MockSynthesis::Refuse(message) => Err(BridgeError::Synthesis(message.clone())),
        }
    }
}
