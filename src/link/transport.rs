//! Serial transport and the inbound reader thread.
//!
//! The reader runs on a dedicated OS thread because serial reads block; it
//! must never be stalled by stage work, so decoded items are handed to the
//! async side through a channel and the rolling buffer absorbs any backlog.

use crate::config::SerialConfig;
use crate::error::{BridgeError, Result};
use crate::ingest::AudioFrame;
use crate::link::codec::{FrameDecoder, LinkItem};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Blocking byte source for the inbound half of the link.
///
/// `read` returns `Ok(0)` when the read timeout elapses with no data, so
/// the reader thread can poll its shutdown flag.
pub trait LinkTransport: Send {
    /// Read available bytes into `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error on a link-level failure; timeouts are `Ok(0)`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Demultiplexed inbound traffic.
#[derive(Debug)]
pub enum LinkEvent {
    /// One audio frame of mic PCM.
    Frame(AudioFrame),
    /// One trimmed ASCII line.
    Line(String),
}

/// Serial implementation of [`LinkTransport`].
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl LinkTransport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Open the serial device and split it into a reader transport and a
/// writer sink.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or cloned.
pub fn open_serial(config: &SerialConfig) -> Result<(SerialTransport, Box<dyn Write + Send>)> {
    let port = serialport::new(&config.device, config.baud_rate)
        .timeout(Duration::from_millis(config.read_timeout_ms))
        .open()
        .map_err(|e| BridgeError::Link(format!("cannot open {}: {e}", config.device)))?;
    let writer = port
        .try_clone()
        .map_err(|e| BridgeError::Link(format!("cannot clone {}: {e}", config.device)))?;
    info!(
        "opened serial link {} at {} baud",
        config.device, config.baud_rate
    );
    Ok((SerialTransport { port }, Box::new(writer)))
}

/// Handle to a running reader thread.
pub struct ReaderHandle {
    running: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl ReaderHandle {
    /// Ask the reader thread to stop and wait for it to exit.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Spawn the reader thread: raw bytes in, [`LinkEvent`]s out.
///
/// The thread exits when `stop` is called, the receiver is dropped, or the
/// transport reports a hard error.
pub fn spawn_reader(
    mut transport: Box<dyn LinkTransport>,
    tx: mpsc::Sender<LinkEvent>,
) -> ReaderHandle {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);

    let join = thread::Builder::new()
        .name("link-reader".to_owned())
        .spawn(move || {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 4096];

            while flag.load(Ordering::SeqCst) {
                let n = match transport.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => n,
                    Err(e) => {
                        error!("serial read failed: {e}");
                        break;
                    }
                };

                for item in decoder.extend(&buf[..n]) {
                    let event = match item {
                        LinkItem::Frame { payload } => {
                            match frame_from_payload(payload) {
                                Some(frame) => LinkEvent::Frame(frame),
                                None => continue,
                            }
                        }
                        LinkItem::Line(text) => {
                            debug!("<= {text}");
                            LinkEvent::Line(text)
                        }
                    };
                    if tx.blocking_send(event).is_err() {
                        return;
                    }
                }
            }
        })
        .expect("spawn link reader thread");

    ReaderHandle {
        running,
        join: Some(join),
    }
}

/// Convert a raw frame payload into timestamped samples. An odd byte count
/// cannot hold whole 16-bit samples and is treated as a framing error.
fn frame_from_payload(payload: Vec<u8>) -> Option<AudioFrame> {
    if payload.len() % 2 != 0 {
        warn!(
            "framing error: odd audio payload length {}; frame dropped",
            payload.len()
        );
        return None;
    }
    let samples = payload
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Some(AudioFrame {
        received_at: Instant::now(),
        samples,
    })
}
