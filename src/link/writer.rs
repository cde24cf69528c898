//! Outbound command writer.
//!
//! The writer has a single owner at a time: short control commands and the
//! playback pump share it behind an async mutex, and the pump holds the
//! lock for the whole playback job so commands never interleave with a
//! PCM payload.

use crate::error::{BridgeError, Result};
use std::io::Write;
use tracing::debug;

/// Serialized writer for the outbound half of the link.
pub struct CommandWriter {
    sink: Box<dyn Write + Send>,
}

impl CommandWriter {
    /// Wrap an outbound byte sink.
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self { sink }
    }

    /// Send one newline-terminated ASCII command.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or flush fails.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        debug!("=> {line}");
        self.sink
            .write_all(format!("{line}\n").as_bytes())
            .and_then(|()| self.sink.flush())
            .map_err(|e| BridgeError::Link(format!("command write failed: {e}")))
    }

    /// Re-enable mic forwarding on the device.
    pub fn resume(&mut self) -> Result<()> {
        self.send_line("RESUME")
    }

    /// Stop mic forwarding on the device.
    pub fn pause(&mut self) -> Result<()> {
        self.send_line("PAUSE")
    }

    /// Ask the device to report its state.
    pub fn state_query(&mut self) -> Result<()> {
        self.send_line("STATE?")
    }

    /// Open a playback job: mono, 16-bit, `sample_count` samples at
    /// `sample_rate`.
    pub fn start_playback(&mut self, sample_rate: u32, sample_count: usize) -> Result<()> {
        self.send_line(&format!("START {sample_rate} 1 16 {sample_count}"))
    }

    /// Terminate a playback job.
    pub fn end_playback(&mut self) -> Result<()> {
        self.send_line("END")
    }

    /// Write one paced slice of the playback payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or flush fails.
    pub fn write_payload_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.sink
            .write_all(chunk)
            .and_then(|()| self.sink.flush())
            .map_err(|e| BridgeError::Link(format!("payload write failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("sink lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn commands_are_newline_terminated() {
        let sink = SharedSink::default();
        let mut writer = CommandWriter::new(Box::new(sink.clone()));
        writer.resume().expect("resume");
        writer.pause().expect("pause");
        writer.state_query().expect("state");
        writer.start_playback(22_050, 33_075).expect("start");
        writer.end_playback().expect("end");

        let written = sink.0.lock().expect("sink lock").clone();
        assert_eq!(
            String::from_utf8(written).expect("ascii"),
            "RESUME\nPAUSE\nSTATE?\nSTART 22050 1 16 33075\nEND\n"
        );
    }

    #[test]
    fn payload_chunks_are_raw() {
        let sink = SharedSink::default();
        let mut writer = CommandWriter::new(Box::new(sink.clone()));
        writer.write_payload_chunk(&[1, 2, 3, 4]).expect("chunk");
        assert_eq!(*sink.0.lock().expect("sink lock"), vec![1, 2, 3, 4]);
    }
}
