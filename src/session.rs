//! The session value: one operator run against one device.
//!
//! A `Session` owns every piece of mutable state for the run — the link,
//! the rolling buffer, the segmenter, the controller — and hands them out
//! by parameter. Nothing lives in process globals; the session is
//! constructed at startup and destroyed at shutdown.

use crate::config::BridgeConfig;
use crate::controller::{classify_line, SessionController};
use crate::error::Result;
use crate::ingest::{MicIngest, RollingBuffer};
use crate::link::{self, CommandWriter, LinkEvent, LinkTransport};
use crate::segmenter::Segmenter;
use crate::stages::StageAdapters;
use crate::telemetry::TransitionLog;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Queue depths. The link channel absorbs reader bursts; the event queue
/// absorbs everything else.
const LINK_CHANNEL_SIZE: usize = 256;
const EVENT_CHANNEL_SIZE: usize = 256;

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Opaque stable session token.
    pub session_id: String,
    /// Cycles that ran to completion.
    pub completed_cycles: u32,
}

/// One operator run: configuration, collaborators, and the serial link.
pub struct Session {
    config: BridgeConfig,
    adapters: StageAdapters,
    transport: Box<dyn LinkTransport>,
    sink: Box<dyn Write + Send>,
    shutdown: CancellationToken,
}

impl Session {
    /// Open the configured serial device and build a session over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the serial port cannot be opened.
    pub fn open(config: BridgeConfig, adapters: StageAdapters) -> Result<Self> {
        let (transport, sink) = link::open_serial(&config.serial)?;
        Ok(Self::with_transport(
            config,
            adapters,
            Box::new(transport),
            sink,
        ))
    }

    /// Build a session over an explicit transport. Tests use this with a
    /// scripted transport and a captured sink.
    pub fn with_transport(
        config: BridgeConfig,
        adapters: StageAdapters,
        transport: Box<dyn LinkTransport>,
        sink: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            config,
            adapters,
            transport,
            sink,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the session when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Drive the session until the configured cycle count, a cancellation,
    /// or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns an error on a resource invariant violation, an unusable
    /// transition log path, or an unexpectedly closed event queue.
    pub async fn run(self) -> Result<SessionSummary> {
        let session_id = new_session_id();
        info!("session {session_id} starting");

        let telemetry = match &self.config.session.log_path {
            Some(path) => TransitionLog::to_file(path)?,
            None => TransitionLog::disabled(),
        };

        let buffer = Arc::new(Mutex::new(RollingBuffer::new(
            self.config.buffer_capacity_samples(),
        )));
        // Capture stays gated off until the controller finishes the READY
        // handshake.
        let capture_enabled = Arc::new(AtomicBool::new(false));
        let segmenter = Segmenter::new(&self.config.vad, self.config.audio.sample_rate);

        let (link_tx, mut link_rx) = mpsc::channel::<LinkEvent>(LINK_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let reader = link::spawn_reader(self.transport, link_tx);

        // Ingest and segmentation run on the reader's cadence, strictly
        // downstream of it and upstream of the controller queue.
        let mut ingest = MicIngest::new(
            Arc::clone(&buffer),
            segmenter,
            Arc::clone(&capture_enabled),
        );
        let ingest_tx = event_tx.clone();
        let ingest_task = tokio::spawn(async move {
            while let Some(link_event) = link_rx.recv().await {
                let events = match link_event {
                    LinkEvent::Frame(frame) => ingest.handle_frame(frame),
                    LinkEvent::Line(text) => vec![classify_line(text)],
                };
                for event in events {
                    if ingest_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        let writer = Arc::new(TokioMutex::new(CommandWriter::new(self.sink)));
        let controller = SessionController::new(
            self.config,
            session_id.clone(),
            self.adapters,
            event_tx,
            event_rx,
            writer,
            buffer,
            capture_enabled,
            telemetry,
            self.shutdown,
        );

        let result = controller.run().await;

        ingest_task.abort();
        reader.stop();

        let completed_cycles = result?;
        info!("session {session_id} finished after {completed_cycles} cycle(s)");
        Ok(SessionSummary {
            session_id,
            completed_cycles,
        })
    }
}

/// Short opaque session token.
fn new_session_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..8].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_short_and_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
