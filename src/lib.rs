//! voicebridge: half-duplex speech mediation over a serial audio bridge.
//!
//! A desktop controller for a USB-attached microcontroller that owns both
//! a microphone and a speaker. Per cycle: serial mic frames → rolling
//! buffer → VAD segmenter → recognizer → rewriter → synthesizer →
//! playback pump → serial.
//!
//! # Architecture
//!
//! Because one device drives both audio paths, the pipeline is strictly
//! half-duplex. A single-consumer session controller serializes every
//! state transition; producers (the link reader, mic ingest, stage tasks,
//! watchdog timers) only enqueue typed events:
//! - **Serial link**: demultiplexes binary audio frames and ASCII lines,
//!   serializes outbound commands and paced playback payloads
//! - **Mic ingest**: rolling PCM buffer keyed by absolute sample index
//! - **Segmenter**: energy VAD with trigger counts, hangover, and rolls
//! - **Stages**: recognition, rewrite, and synthesis collaborators behind
//!   traits, each under a controller-side watchdog
//! - **Playback pump**: `PAUSE` / `START` / paced PCM / `END`, then the
//!   device's out-of-band `PLAYBACK_DONE` acknowledgement

pub mod adapters;
pub mod config;
pub mod controller;
pub mod error;
pub mod ingest;
pub mod link;
pub mod playback;
pub mod segmenter;
pub mod session;
pub mod stages;
pub mod telemetry;
pub mod test_utils;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use session::{Session, SessionSummary};
pub use stages::{Recognizer, Rewriter, StageAdapters, Synthesizer};
