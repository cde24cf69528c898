//! Playback pump: streams a synthesis job to the device.
//!
//! The pump buffers the lazy synthesis stream (the total sample count must
//! be known before the `START` header), conditions the audio, then holds
//! the serial writer for the whole job: `PAUSE`, `START`, paced PCM
//! chunks, `END`. Completion is acknowledged out of band by the device's
//! `PLAYBACK_DONE` line, which the controller waits for.

use crate::config::PlaybackConfig;
use crate::error::{BridgeError, Result};
use crate::link::CommandWriter;
use crate::stages::SynthesisJob;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Summary of a finished playback job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackReport {
    /// Payload bytes written after conditioning.
    pub payload_bytes: usize,
    /// Sample rate declared in the `START` header.
    pub sample_rate: u32,
    /// Number of paced chunk writes.
    pub chunk_count: usize,
}

/// Stream a buffered synthesis job to the device.
///
/// Holds the writer lock from `PAUSE` through `END` so no other command
/// can interleave with the payload. A serial failure mid-payload still
/// sends a best-effort `END` to release the device's state machine.
///
/// # Errors
///
/// Returns an error if the synthesis stream fails, the stream format is
/// inconsistent, or a serial write fails.
pub async fn run_playback_job(
    job: SynthesisJob,
    writer: Arc<Mutex<CommandWriter>>,
    config: &PlaybackConfig,
) -> Result<PlaybackReport> {
    let (pcm, sample_rate) = buffer_stream(job).await?;
    let (pcm, sample_rate) = condition(pcm, sample_rate, config)?;

    let sample_count = pcm.len();
    let mut payload: Vec<u8> = Vec::with_capacity(sample_count * 2);
    for sample in &pcm {
        payload.extend_from_slice(&sample.to_le_bytes());
    }

    debug!(
        "playback job: {} samples at {sample_rate} Hz ({} bytes)",
        sample_count,
        payload.len()
    );

    let mut high_pass = config
        .high_pass_cutoff_hz
        .map(|cutoff| HighPassFilter::new(sample_rate, cutoff));

    let bytes_per_second = sample_rate as u64 * 2;
    let mut writer = writer.lock().await;
    writer.pause()?;
    writer.start_playback(sample_rate, sample_count)?;

    let mut chunk_count = 0;
    let mut next_deadline = tokio::time::Instant::now();
    for chunk in payload.chunks(config.chunk_bytes.max(2)) {
        let outgoing = match &mut high_pass {
            Some(filter) => filter.process_bytes(chunk),
            None => chunk.to_vec(),
        };
        if let Err(e) = writer.write_payload_chunk(&outgoing) {
            warn!("payload write failed mid-job: {e}; sending best-effort END");
            let _ = writer.end_playback();
            return Err(e);
        }
        chunk_count += 1;

        // Pace writes so the device's receive DMA keeps up.
        next_deadline += Duration::from_secs_f64(outgoing.len() as f64 / bytes_per_second as f64);
        let now = tokio::time::Instant::now();
        if next_deadline > now {
            tokio::time::sleep_until(next_deadline).await;
        } else {
            next_deadline = now;
        }
    }

    writer.end_playback()?;

    Ok(PlaybackReport {
        payload_bytes: payload.len(),
        sample_rate,
        chunk_count,
    })
}

/// Drain the synthesis stream into one PCM buffer, enforcing a consistent
/// mono 16-bit format.
async fn buffer_stream(job: SynthesisJob) -> Result<(Vec<i16>, u32)> {
    let first = job.first_chunk;
    if first.channels != 1 || first.bits != 16 {
        return Err(BridgeError::Synthesis(format!(
            "unsupported stream format: {} ch / {} bit",
            first.channels, first.bits
        )));
    }
    let sample_rate = first.sample_rate;
    let mut pcm = bytes_to_samples(&first.pcm)?;

    let mut rest = job.rest;
    while let Some(item) = rest.next().await {
        let chunk = item
            .map_err(|e| BridgeError::Synthesis(format!("stream failed mid-synthesis: {e}")))?;
        if chunk.sample_rate != sample_rate || chunk.channels != 1 || chunk.bits != 16 {
            return Err(BridgeError::Synthesis(
                "stream format changed mid-synthesis".to_owned(),
            ));
        }
        pcm.extend(bytes_to_samples(&chunk.pcm)?);
    }

    if pcm.is_empty() {
        return Err(BridgeError::Synthesis(
            "synthesis produced no audio".to_owned(),
        ));
    }
    Ok((pcm, sample_rate))
}

fn bytes_to_samples(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(BridgeError::Synthesis(
            "odd PCM byte count in synthesis chunk".to_owned(),
        ));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Apply the configured resample and gain.
fn condition(
    pcm: Vec<i16>,
    sample_rate: u32,
    config: &PlaybackConfig,
) -> Result<(Vec<i16>, u32)> {
    let (pcm, sample_rate) = match config.target_sample_rate {
        Some(target) if target != sample_rate => {
            if target > sample_rate {
                return Err(BridgeError::Playback(format!(
                    "cannot upsample playback from {sample_rate} to {target} Hz"
                )));
            }
            (resample_linear(&pcm, sample_rate, target), target)
        }
        _ => (pcm, sample_rate),
    };

    let pcm = if config.gain_db == 0.0 {
        pcm
    } else {
        apply_gain(&pcm, config.gain_db)
    };

    Ok((pcm, sample_rate))
}

/// Linear-interpolation downsampler.
fn resample_linear(samples: &[i16], src_rate: u32, dst_rate: u32) -> Vec<i16> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = ((samples.len() as f64 / ratio).max(1.0)) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let a = samples[idx.min(samples.len() - 1)] as f64;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}

/// Scale samples by a dB gain with i16 clamping.
fn apply_gain(samples: &[i16], gain_db: f32) -> Vec<i16> {
    let factor = 10f32.powf(gain_db / 20.0);
    samples
        .iter()
        .map(|&s| (s as f32 * factor).round().clamp(-32_768.0, 32_767.0) as i16)
        .collect()
}

/// First-order high-pass filter with i16 clamping, applied per chunk
/// during the paced write so filter state spans chunk boundaries.
struct HighPassFilter {
    alpha: f32,
    prev_input: f32,
    prev_output: f32,
}

impl HighPassFilter {
    fn new(sample_rate: u32, cutoff_hz: f32) -> Self {
        let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz);
        let dt = 1.0 / sample_rate as f32;
        Self {
            alpha: rc / (rc + dt),
            prev_input: 0.0,
            prev_output: 0.0,
        }
    }

    fn process_sample(&mut self, sample: i16) -> i16 {
        let output = self.alpha * (self.prev_output + sample as f32 - self.prev_input);
        self.prev_input = sample as f32;
        self.prev_output = output;
        output.round().clamp(-32_768.0, 32_767.0) as i16
    }

    fn process_bytes(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len());
        for pair in chunk.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            out.extend_from_slice(&self.process_sample(sample).to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::SynthesisChunk;
    use futures_util::stream;
    use std::io::Write;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<StdMutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("sink lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn chunk(pcm: Vec<u8>, sample_rate: u32) -> SynthesisChunk {
        SynthesisChunk {
            pcm,
            sample_rate,
            bits: 16,
            channels: 1,
        }
    }

    fn job(chunks: Vec<Result<SynthesisChunk>>, first: SynthesisChunk) -> SynthesisJob {
        SynthesisJob {
            first_chunk: first,
            first_chunk_at: Instant::now(),
            rest: Box::pin(stream::iter(chunks)),
        }
    }

    fn sample_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[tokio::test]
    async fn protocol_order_is_pause_start_payload_end() {
        let sink = SharedSink::default();
        let writer = Arc::new(Mutex::new(CommandWriter::new(Box::new(sink.clone()))));
        let samples: Vec<i16> = (0..2_000).map(|i| (i % 100) as i16).collect();

        let job = job(
            vec![Ok(chunk(sample_bytes(&samples[500..]), 22_050))],
            chunk(sample_bytes(&samples[..500]), 22_050),
        );
        let report = run_playback_job(job, writer, &PlaybackConfig::default())
            .await
            .expect("playback job");

        assert_eq!(report.payload_bytes, 4_000);
        assert_eq!(report.sample_rate, 22_050);

        let written = sink.0.lock().expect("sink lock").clone();
        let header_end = written
            .windows(1)
            .enumerate()
            .filter(|(_, w)| w[0] == b'\n')
            .map(|(i, _)| i)
            .nth(1)
            .expect("two header lines");
        let header = String::from_utf8_lossy(&written[..=header_end]).to_string();
        assert_eq!(header, "PAUSE\nSTART 22050 1 16 2000\n");

        let tail = b"END\n";
        assert_eq!(&written[written.len() - 4..], tail);
        // Everything between header and END is the raw payload.
        assert_eq!(written.len(), header.len() + 4_000 + 4);
        assert_eq!(&written[header.len()..header.len() + 4], sample_bytes(&samples[..2]));
    }

    #[tokio::test]
    async fn stream_error_before_start_sends_nothing() {
        let sink = SharedSink::default();
        let writer = Arc::new(Mutex::new(CommandWriter::new(Box::new(sink.clone()))));

        let job = job(
            vec![Err(BridgeError::Synthesis("backend dropped".to_owned()))],
            chunk(sample_bytes(&[1, 2, 3]), 24_000),
        );
        let err = run_playback_job(job, writer, &PlaybackConfig::default())
            .await
            .expect_err("stream error propagates");
        assert!(matches!(err, BridgeError::Synthesis(_)));
        assert!(
            sink.0.lock().expect("sink lock").is_empty(),
            "no device commands before the header is known"
        );
    }

    #[tokio::test]
    async fn format_change_mid_stream_is_rejected() {
        let sink = SharedSink::default();
        let writer = Arc::new(Mutex::new(CommandWriter::new(Box::new(sink))));

        let job = job(
            vec![Ok(chunk(sample_bytes(&[4, 5]), 48_000))],
            chunk(sample_bytes(&[1, 2]), 24_000),
        );
        let err = run_playback_job(job, writer, &PlaybackConfig::default())
            .await
            .expect_err("format change rejected");
        assert!(matches!(err, BridgeError::Synthesis(_)));
    }

    #[tokio::test]
    async fn stereo_stream_is_rejected() {
        let sink = SharedSink::default();
        let writer = Arc::new(Mutex::new(CommandWriter::new(Box::new(sink))));
        let mut first = chunk(sample_bytes(&[1, 2]), 24_000);
        first.channels = 2;

        let err = run_playback_job(job(Vec::new(), first), writer, &PlaybackConfig::default())
            .await
            .expect_err("stereo rejected");
        assert!(matches!(err, BridgeError::Synthesis(_)));
    }

    #[tokio::test]
    async fn empty_stream_is_rejected() {
        let sink = SharedSink::default();
        let writer = Arc::new(Mutex::new(CommandWriter::new(Box::new(sink))));
        let err = run_playback_job(
            job(Vec::new(), chunk(Vec::new(), 24_000)),
            writer,
            &PlaybackConfig::default(),
        )
        .await
        .expect_err("empty stream rejected");
        assert!(matches!(err, BridgeError::Synthesis(_)));
    }

    #[test]
    fn resample_halves_length() {
        let samples: Vec<i16> = (0..1_000).map(|i| (i % 64) as i16).collect();
        let out = resample_linear(&samples, 32_000, 16_000);
        assert!((out.len() as i64 - 500).abs() <= 1);
    }

    #[test]
    fn gain_clamps_at_full_scale() {
        let out = apply_gain(&[30_000, -30_000, 100], 6.0);
        assert_eq!(out[0], 32_767);
        assert_eq!(out[1], -32_768);
        assert!(out[2] > 100);
    }

    #[test]
    fn high_pass_removes_dc() {
        let mut filter = HighPassFilter::new(16_000, 250.0);
        let mut last = 0i16;
        for _ in 0..4_000 {
            last = filter.process_sample(10_000);
        }
        assert!(last.abs() < 100, "DC settles toward zero, got {last}");
    }

    #[tokio::test]
    async fn downsampling_updates_header_rate() {
        let sink = SharedSink::default();
        let writer = Arc::new(Mutex::new(CommandWriter::new(Box::new(sink.clone()))));
        let samples = vec![1_000i16; 2_205];
        let config = PlaybackConfig {
            target_sample_rate: Some(16_000),
            ..PlaybackConfig::default()
        };

        let report = run_playback_job(
            job(Vec::new(), chunk(sample_bytes(&samples), 22_050)),
            writer,
            &config,
        )
        .await
        .expect("playback job");
        assert_eq!(report.sample_rate, 16_000);

        let written = sink.0.lock().expect("sink lock").clone();
        let text = String::from_utf8_lossy(&written);
        assert!(text.contains("START 16000 1 16 "), "header: {text}");
    }
}
