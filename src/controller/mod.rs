//! Session controller: the authoritative state machine.
//!
//! All state transitions happen on a single-consumer event loop; producers
//! (link reader, mic ingest, stage tasks, watchdog timers) only enqueue
//! typed events. The controller owns the resource ledger, the per-cycle
//! bookkeeping, stage dispatch with watchdogs, cancellation, and the
//! structured transition log.

pub mod events;
pub mod ledger;

pub use events::{classify_line, ErrorCause, Event, StageKind, StageResult};
pub use ledger::{ResourceLedger, ResourceState};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::ingest::RollingBuffer;
use crate::link::CommandWriter;
use crate::playback::{run_playback_job, PlaybackReport};
use crate::segmenter::SegmentBounds;
use crate::stages::{
    is_unusable_rewrite, normalize_transcript, StageAdapters, SynthesisJob,
};
use crate::telemetry::{now_rfc3339, ResourceSnapshot, TransitionLog, TransitionRecord};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Waiting for an utterance.
    Idle,
    /// A segment is open and still growing.
    Capturing,
    /// The recognizer stage is running.
    Recognizing,
    /// The rewrite stage is running.
    Rewriting,
    /// Waiting for the first synthesized chunk.
    Synthesizing,
    /// The playback pump is streaming or the acknowledgement is pending.
    PlayingBack,
    /// Cycle done; waiting out the resume guard.
    Cleanup,
    /// Cycle failed; resources released, waiting out the guard.
    ErrorTimeout,
}

impl ControllerState {
    /// Stable label for telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Capturing => "Capturing",
            Self::Recognizing => "Recognizing",
            Self::Rewriting => "Rewriting",
            Self::Synthesizing => "Synthesizing",
            Self::PlayingBack => "PlayingBack",
            Self::Cleanup => "Cleanup",
            Self::ErrorTimeout => "ErrorTimeout",
        }
    }
}

/// What the single watchdog slot is timing. Only one stage is ever active,
/// so one slot suffices; the guard delay reuses it between cycles.
#[derive(Debug, Clone, Copy)]
enum Deadline {
    Stage(StageKind),
    Guard,
}

/// Optional fields attached to a transition record.
#[derive(Debug, Default, Clone, Copy)]
struct RecordExtra {
    latency_ms: Option<u64>,
    size: Option<u64>,
    error: Option<&'static str>,
}

/// Per-cycle bookkeeping.
struct CycleData {
    ordinal: u32,
    started_at: Instant,
    stage_started_at: Instant,
    transcript: Option<String>,
    rewrite_retried: bool,
    playback_report: Option<PlaybackReport>,
}

impl CycleData {
    fn new(ordinal: u32) -> Self {
        let now = Instant::now();
        Self {
            ordinal,
            started_at: now,
            stage_started_at: now,
            transcript: None,
            rewrite_retried: false,
            playback_report: None,
        }
    }
}

/// The controller state machine and its event loop.
pub struct SessionController {
    config: BridgeConfig,
    session_id: String,
    state: ControllerState,
    ledger: ResourceLedger,
    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
    writer: Arc<TokioMutex<CommandWriter>>,
    buffer: Arc<StdMutex<RollingBuffer>>,
    capture_enabled: Arc<AtomicBool>,
    adapters: StageAdapters,
    telemetry: TransitionLog,
    watchdog: Option<(Deadline, TokioInstant)>,
    cycle: Option<CycleData>,
    cycle_cancel: CancellationToken,
    completed_cycles: u32,
    device_paused: bool,
    presence: Option<bool>,
    shutdown: CancellationToken,
    stopping: bool,
}

impl SessionController {
    /// Wire up a controller over an already-running link.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BridgeConfig,
        session_id: String,
        adapters: StageAdapters,
        event_tx: mpsc::Sender<Event>,
        event_rx: mpsc::Receiver<Event>,
        writer: Arc<TokioMutex<CommandWriter>>,
        buffer: Arc<StdMutex<RollingBuffer>>,
        capture_enabled: Arc<AtomicBool>,
        telemetry: TransitionLog,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            session_id,
            state: ControllerState::Idle,
            ledger: ResourceLedger::new(),
            event_tx,
            event_rx,
            writer,
            buffer,
            capture_enabled,
            adapters,
            telemetry,
            watchdog: None,
            cycle: None,
            cycle_cancel: CancellationToken::new(),
            completed_cycles: 0,
            device_paused: false,
            presence: None,
            shutdown,
            stopping: false,
        }
    }

    /// Run until the configured cycle count, a shutdown, or a fatal error.
    /// Returns the number of completed cycles.
    ///
    /// # Errors
    ///
    /// Returns an error on a resource invariant violation or when the
    /// event queue closes unexpectedly. The transition log is flushed
    /// either way.
    pub async fn run(mut self) -> Result<u32> {
        let result = self.run_inner().await;
        self.telemetry.flush();
        result.map(|()| self.completed_cycles)
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.await_ready().await?;

        // Idle begins with a controller-issued RESUME so the device streams
        // mic audio whatever state it booted in.
        self.writer.lock().await.resume()?;
        self.capture_enabled.store(true, Ordering::SeqCst);
        self.record("controller.start", RecordExtra::default());

        let shutdown = self.shutdown.clone();
        loop {
            if self.state == ControllerState::Idle {
                if let Some(max) = self.config.session.max_cycles {
                    if self.completed_cycles >= max {
                        info!("cycle budget reached ({max}); stopping");
                        break;
                    }
                }
            }
            if self.stopping {
                break;
            }

            let deadline = self.watchdog.as_ref().map(|(_, at)| *at);
            tokio::select! {
                () = shutdown.cancelled() => {
                    self.handle_shutdown().await;
                    break;
                }
                () = maybe_sleep(deadline) => {
                    if let Some((kind, _)) = self.watchdog.take() {
                        let event = match kind {
                            Deadline::Stage(stage) => Event::Timeout(stage),
                            Deadline::Guard => Event::GuardElapsed,
                        };
                        self.on_event(event).await?;
                    }
                }
                maybe = self.event_rx.recv() => match maybe {
                    Some(event) => self.on_event(event).await?,
                    None => {
                        return Err(BridgeError::Channel(
                            "controller event queue closed".to_owned(),
                        ))
                    }
                },
            }
        }
        Ok(())
    }

    /// Wait for the device's `READY` banner, bounded by the configured
    /// timeout. The original firmware occasionally boots quiet, so a
    /// missing banner is a warning, not a failure.
    async fn await_ready(&mut self) -> Result<()> {
        let deadline =
            TokioInstant::now() + Duration::from_millis(self.config.serial.ready_timeout_ms);
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    warn!("READY banner not observed; continuing");
                    return Ok(());
                }
                maybe = self.event_rx.recv() => match maybe {
                    Some(Event::DeviceLine(line)) => {
                        if line == "READY" {
                            info!("device ready");
                            return Ok(());
                        }
                        self.note_device_line(&line);
                    }
                    Some(_) => {}
                    None => {
                        return Err(BridgeError::Channel(
                            "event queue closed before READY".to_owned(),
                        ))
                    }
                },
            }
        }
    }

    async fn on_event(&mut self, event: Event) -> Result<()> {
        match event {
            // Frames are already in the rolling buffer; nothing to decide.
            Event::FrameArrived { .. } => Ok(()),
            Event::DeviceLine(line) => {
                self.note_device_line(&line);
                Ok(())
            }
            Event::SegmentStart { start_index } => self.on_segment_start(start_index),
            Event::SegmentEnd(bounds) => self.on_segment_end(bounds),
            Event::StageCompleted(stage, result) => self.on_stage_completed(stage, result),
            Event::StageFailed(stage, cause, detail) => {
                if self.stage_matches_state(stage) {
                    self.enter_error_timeout(cause, &detail).await
                } else {
                    debug!("stale {} failure ignored: {detail}", stage.as_str());
                    Ok(())
                }
            }
            Event::PlaybackAck => self.on_playback_ack(),
            Event::Timeout(stage) => self.on_stage_timeout(stage).await,
            Event::GuardElapsed => self.on_guard_elapsed().await,
            Event::BufferPressure { resident_samples } => {
                self.on_buffer_pressure(resident_samples).await
            }
            Event::OperatorReset => {
                if self.state == ControllerState::Idle {
                    debug!("operator reset ignored while idle");
                    Ok(())
                } else {
                    self.enter_error_timeout(ErrorCause::OperatorReset, "operator reset")
                        .await
                }
            }
            Event::Shutdown => {
                self.handle_shutdown().await;
                self.stopping = true;
                Ok(())
            }
        }
    }

    fn note_device_line(&mut self, line: &str) {
        if line == "PRESENCE ON" {
            if self.presence != Some(true) {
                info!("device presence: on");
            }
            self.presence = Some(true);
        } else if line == "PRESENCE OFF" {
            if self.presence != Some(false) {
                info!("device presence: off");
            }
            self.presence = Some(false);
        } else if let Some(message) = line.strip_prefix("LOG ") {
            debug!(target: "voicebridge::device", "{message}");
        } else if line == "READY" || line == "STATE STREAMING" {
            debug!("device: {line}");
        } else {
            debug!("unrecognized device line: {line}");
        }
    }

    fn on_segment_start(&mut self, start_index: u64) -> Result<()> {
        if self.state != ControllerState::Idle {
            // Serialized cycles: one at a time, no queueing.
            debug!("segment start ignored in {}", self.state.as_str());
            return Ok(());
        }
        if self.config.session.gate_on_presence && self.presence == Some(false) {
            debug!("segment start suppressed: presence off");
            return Ok(());
        }
        if self.ledger.mic() != ResourceState::Available {
            return Err(BridgeError::ResourceInvariant(format!(
                "segment start while mic is {}",
                self.ledger.mic().as_str()
            )));
        }
        self.ledger.require_spk_not_device()?;

        self.ledger.set_mic(ResourceState::OwnedByController)?;
        self.lock_buffer().hold_from(Some(start_index));
        self.cycle = Some(CycleData::new(self.completed_cycles + 1));
        if let Some(ms) = self.config.stages.capture_timeout_ms {
            self.arm(Deadline::Stage(StageKind::Capture), ms);
        }
        self.state = ControllerState::Capturing;
        self.record("segment_start", RecordExtra::default());
        Ok(())
    }

    fn on_segment_end(&mut self, bounds: SegmentBounds) -> Result<()> {
        if self.state != ControllerState::Capturing {
            debug!("segment end ignored in {}", self.state.as_str());
            return Ok(());
        }
        self.disarm();

        let (pcm, mean_abs) = {
            let buffer = self.lock_buffer();
            (
                buffer.slice(bounds.start_index, bounds.end_index),
                buffer.mean_abs(bounds.start_index, bounds.end_index),
            )
        };
        self.lock_buffer().hold_from(None);

        let sample_rate = self.config.audio.sample_rate;
        let voiced_secs = bounds.voiced_duration_secs(sample_rate);
        let min_secs = self.config.vad.min_segment_duration_ms as f32 / 1000.0;

        if pcm.is_empty() || voiced_secs + 1e-6 < min_secs {
            return self.reject_segment(&format!("too short ({voiced_secs:.2}s)"), pcm.len());
        }
        if mean_abs < self.config.vad.min_segment_mean_abs {
            return self.reject_segment(&format!("low energy (mean abs {mean_abs:.0})"), pcm.len());
        }

        // Freeze the slice: the segment now lives outside the buffer and
        // the segmenter stays quiet until the cycle ends.
        self.capture_enabled.store(false, Ordering::SeqCst);
        self.record(
            "segment_end",
            RecordExtra {
                size: Some(pcm.len() as u64),
                ..RecordExtra::default()
            },
        );

        self.spawn_recognize(pcm);
        self.state = ControllerState::Recognizing;
        self.record("recognize.start", RecordExtra::default());
        Ok(())
    }

    /// Below-threshold segment: not an error, logged at info.
    fn reject_segment(&mut self, why: &str, samples: usize) -> Result<()> {
        info!("segment rejected: {why}");
        self.ledger.set_mic(ResourceState::Available)?;
        self.state = ControllerState::Idle;
        self.record(
            "segment_rejected",
            RecordExtra {
                size: Some(samples as u64),
                ..RecordExtra::default()
            },
        );
        self.cycle = None;
        Ok(())
    }

    fn on_stage_completed(&mut self, stage: StageKind, result: StageResult) -> Result<()> {
        match (self.state, stage, result) {
            (ControllerState::Recognizing, StageKind::Recognize, StageResult::Transcript(text)) => {
                self.disarm();
                let latency = self.stage_latency_ms();
                if text.is_empty() {
                    // Empty transcript short-circuits straight to cleanup:
                    // no rewrite, no synthesis, no device commands.
                    self.ledger.set_mic(ResourceState::Available)?;
                    self.record(
                        "recognize.empty",
                        RecordExtra {
                            latency_ms: latency,
                            ..RecordExtra::default()
                        },
                    );
                    self.enter_cleanup();
                    return Ok(());
                }
                self.record(
                    "recognize.complete",
                    RecordExtra {
                        latency_ms: latency,
                        size: Some(text.len() as u64),
                        ..RecordExtra::default()
                    },
                );
                if let Some(cycle) = self.cycle.as_mut() {
                    cycle.transcript = Some(text.clone());
                }
                self.spawn_rewrite(text);
                self.state = ControllerState::Rewriting;
                self.record("rewrite.start", RecordExtra::default());
                Ok(())
            }
            (ControllerState::Rewriting, StageKind::Rewrite, StageResult::Rewritten(text)) => {
                self.disarm();
                let latency = self.stage_latency_ms();
                if is_unusable_rewrite(&text) {
                    let original = self
                        .cycle
                        .as_ref()
                        .and_then(|c| c.transcript.clone())
                        .unwrap_or_default();
                    let already_retried =
                        self.cycle.as_ref().is_some_and(|c| c.rewrite_retried);
                    if !already_retried {
                        // One retry with the original transcript before
                        // giving up on the rewrite.
                        if let Some(cycle) = self.cycle.as_mut() {
                            cycle.rewrite_retried = true;
                        }
                        self.record(
                            "rewrite.retry",
                            RecordExtra {
                                latency_ms: latency,
                                ..RecordExtra::default()
                            },
                        );
                        self.spawn_rewrite(original);
                        return Ok(());
                    }
                    self.record(
                        "rewrite.fallback",
                        RecordExtra {
                            latency_ms: latency,
                            ..RecordExtra::default()
                        },
                    );
                    self.begin_synthesis(original);
                    return Ok(());
                }
                self.record(
                    "rewrite.complete",
                    RecordExtra {
                        latency_ms: latency,
                        size: Some(text.len() as u64),
                        ..RecordExtra::default()
                    },
                );
                self.begin_synthesis(text);
                Ok(())
            }
            (ControllerState::Synthesizing, StageKind::Synthesis, StageResult::Synthesis(job)) => {
                self.disarm();
                let latency = self.stage_latency_ms();

                // Entry guard: playback must never contend with a
                // device-owned mic.
                self.ledger.require_mic_not_device()?;
                self.ledger.set_spk(ResourceState::OwnedByDevice)?;
                self.ledger.set_mic(ResourceState::Paused)?;
                self.device_paused = true;

                self.spawn_playback(job);
                self.arm(
                    Deadline::Stage(StageKind::Playback),
                    self.config.stages.playback_timeout_ms,
                );
                self.state = ControllerState::PlayingBack;
                self.record(
                    "synthesis.first_chunk",
                    RecordExtra {
                        latency_ms: latency,
                        ..RecordExtra::default()
                    },
                );
                Ok(())
            }
            (
                ControllerState::PlayingBack,
                StageKind::Playback,
                StageResult::PlaybackFinished(report),
            ) => {
                // Streaming is done; the watchdog keeps running until the
                // device acknowledges.
                self.record(
                    "playback.streamed",
                    RecordExtra {
                        size: Some(report.payload_bytes as u64),
                        ..RecordExtra::default()
                    },
                );
                if let Some(cycle) = self.cycle.as_mut() {
                    cycle.playback_report = Some(report);
                }
                Ok(())
            }
            (state, stage, result) => {
                debug!(
                    "stale {} result {result:?} ignored in {}",
                    stage.as_str(),
                    state.as_str()
                );
                Ok(())
            }
        }
    }

    fn on_playback_ack(&mut self) -> Result<()> {
        if self.state != ControllerState::PlayingBack {
            debug!("playback ack ignored in {}", self.state.as_str());
            return Ok(());
        }
        self.disarm();
        self.ledger.set_spk(ResourceState::Available)?;
        self.record(
            "playback.ack",
            RecordExtra {
                latency_ms: self.stage_latency_ms(),
                ..RecordExtra::default()
            },
        );
        self.enter_cleanup();
        Ok(())
    }

    async fn on_stage_timeout(&mut self, stage: StageKind) -> Result<()> {
        if !self.stage_matches_state(stage) {
            debug!("stale {} watchdog ignored", stage.as_str());
            return Ok(());
        }
        let cause = match stage {
            StageKind::Capture => ErrorCause::CaptureTimedOut,
            StageKind::Recognize => ErrorCause::RecognizerTimedOut,
            StageKind::Rewrite => ErrorCause::RewriterTimedOut,
            StageKind::Synthesis => ErrorCause::SynthesisFirstChunkTimedOut,
            StageKind::Playback => {
                if self
                    .cycle
                    .as_ref()
                    .is_some_and(|c| c.playback_report.is_some())
                {
                    ErrorCause::DeviceAckMissing
                } else {
                    ErrorCause::PlaybackTimedOut
                }
            }
        };
        self.enter_error_timeout(cause, "watchdog fired").await
    }

    async fn on_guard_elapsed(&mut self) -> Result<()> {
        match self.state {
            ControllerState::Cleanup => {
                if self.device_paused {
                    self.writer.lock().await.resume()?;
                    self.device_paused = false;
                }
                self.ledger.set_mic(ResourceState::Available)?;
                let cycle_ms = self
                    .cycle
                    .as_ref()
                    .map(|c| c.started_at.elapsed().as_millis() as u64);
                self.completed_cycles += 1;
                self.record(
                    "cycle.complete",
                    RecordExtra {
                        latency_ms: cycle_ms,
                        ..RecordExtra::default()
                    },
                );
                self.enter_idle()
            }
            ControllerState::ErrorTimeout => {
                self.record("guard.elapsed", RecordExtra::default());
                self.enter_idle()
            }
            state => {
                debug!("stale guard timer ignored in {}", state.as_str());
                Ok(())
            }
        }
    }

    async fn on_buffer_pressure(&mut self, resident_samples: usize) -> Result<()> {
        if self.state == ControllerState::Idle {
            warn!("sustained buffer pressure while idle ({resident_samples} samples resident)");
            return Ok(());
        }
        self.enter_error_timeout(
            ErrorCause::BufferPressure,
            &format!("{resident_samples} samples resident"),
        )
        .await
    }

    /// Uniform failure route: cancel in-flight stage work, best-effort
    /// release of the device state machine, free both resources, one
    /// `error_timeout` record, then idle after the guard.
    async fn enter_error_timeout(&mut self, cause: ErrorCause, detail: &str) -> Result<()> {
        warn!("cycle failed: {} ({detail})", cause.as_str());
        self.disarm();

        // Abandon stage work; collaborators that cannot be cancelled are
        // dropped, not awaited.
        self.cycle_cancel.cancel();
        self.cycle_cancel = CancellationToken::new();

        self.capture_enabled.store(false, Ordering::SeqCst);
        self.lock_buffer().hold_from(None);

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.pause();
            let _ = writer.end_playback();
            let _ = writer.resume();
        }
        self.device_paused = false;

        self.ledger.set_mic(ResourceState::Available)?;
        self.ledger.set_spk(ResourceState::Available)?;
        self.state = ControllerState::ErrorTimeout;
        self.record(
            "error_timeout",
            RecordExtra {
                error: Some(cause.as_str()),
                ..RecordExtra::default()
            },
        );
        self.arm(Deadline::Guard, self.config.playback.guard_delay_ms);
        Ok(())
    }

    fn enter_cleanup(&mut self) {
        self.state = ControllerState::Cleanup;
        self.arm(Deadline::Guard, self.config.playback.guard_delay_ms);
    }

    fn enter_idle(&mut self) -> Result<()> {
        self.ledger.require_both_available()?;
        self.cycle = None;
        self.state = ControllerState::Idle;
        self.capture_enabled.store(true, Ordering::SeqCst);
        self.record("idle", RecordExtra::default());
        Ok(())
    }

    async fn handle_shutdown(&mut self) {
        info!("shutdown requested");
        if self.state != ControllerState::Idle {
            self.cycle_cancel.cancel();
            self.capture_enabled.store(false, Ordering::SeqCst);
            self.lock_buffer().hold_from(None);
            let mut writer = self.writer.lock().await;
            let _ = writer.pause();
            let _ = writer.end_playback();
            let _ = writer.resume();
            let _ = self.ledger.set_mic(ResourceState::Available);
            let _ = self.ledger.set_spk(ResourceState::Available);
        }
        self.record("shutdown", RecordExtra::default());
        self.stopping = true;
    }

    // ------------------------------------------------------------------
    // Stage dispatch

    fn spawn_recognize(&mut self, pcm: Vec<i16>) {
        let recognizer = Arc::clone(&self.adapters.recognizer);
        let sample_rate = self.config.audio.sample_rate;
        let tx = self.event_tx.clone();
        let cancel = self.cycle_cancel.clone();
        self.stage_started();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                result = recognizer.recognize(pcm, sample_rate) => {
                    let event = match result {
                        Ok(text) => Event::StageCompleted(
                            StageKind::Recognize,
                            StageResult::Transcript(normalize_transcript(&text)),
                        ),
                        Err(e) => Event::StageFailed(
                            StageKind::Recognize,
                            ErrorCause::RecognizerFailed,
                            e.to_string(),
                        ),
                    };
                    let _ = tx.send(event).await;
                }
            }
        });
        self.arm(
            Deadline::Stage(StageKind::Recognize),
            self.config.stages.recognize_timeout_ms,
        );
    }

    fn spawn_rewrite(&mut self, transcript: String) {
        let rewriter = Arc::clone(&self.adapters.rewriter);
        let tx = self.event_tx.clone();
        let cancel = self.cycle_cancel.clone();
        self.stage_started();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                result = rewriter.rewrite(transcript) => {
                    let event = match result {
                        Ok(text) => Event::StageCompleted(
                            StageKind::Rewrite,
                            StageResult::Rewritten(text.trim().to_owned()),
                        ),
                        Err(e) => Event::StageFailed(
                            StageKind::Rewrite,
                            ErrorCause::RewriterFailed,
                            e.to_string(),
                        ),
                    };
                    let _ = tx.send(event).await;
                }
            }
        });
        self.arm(
            Deadline::Stage(StageKind::Rewrite),
            self.config.stages.rewrite_timeout_ms,
        );
    }

    fn begin_synthesis(&mut self, text: String) {
        let synthesizer = Arc::clone(&self.adapters.synthesizer);
        let tx = self.event_tx.clone();
        let cancel = self.cycle_cancel.clone();
        self.stage_started();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                outcome = async {
                    let mut stream = synthesizer.synthesize(text).await?;
                    match stream.next().await {
                        Some(Ok(first_chunk)) => Ok(SynthesisJob {
                            first_chunk,
                            first_chunk_at: Instant::now(),
                            rest: stream,
                        }),
                        Some(Err(e)) => Err(e),
                        None => Err(BridgeError::Synthesis(
                            "stream ended before the first chunk".to_owned(),
                        )),
                    }
                } => {
                    let event = match outcome {
                        Ok(job) => Event::StageCompleted(
                            StageKind::Synthesis,
                            StageResult::Synthesis(job),
                        ),
                        Err(e) => Event::StageFailed(
                            StageKind::Synthesis,
                            ErrorCause::SynthesisInterrupted,
                            e.to_string(),
                        ),
                    };
                    let _ = tx.send(event).await;
                }
            }
        });
        self.arm(
            Deadline::Stage(StageKind::Synthesis),
            self.config.stages.synthesis_first_chunk_timeout_ms,
        );
        self.state = ControllerState::Synthesizing;
        self.record("synthesis.start", RecordExtra::default());
    }

    fn spawn_playback(&mut self, job: SynthesisJob) {
        let writer = Arc::clone(&self.writer);
        let config = self.config.playback.clone();
        let tx = self.event_tx.clone();
        let cancel = self.cycle_cancel.clone();
        self.stage_started();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                result = run_playback_job(job, writer, &config) => {
                    let event = match result {
                        Ok(report) => Event::StageCompleted(
                            StageKind::Playback,
                            StageResult::PlaybackFinished(report),
                        ),
                        Err(e @ BridgeError::Synthesis(_)) => Event::StageFailed(
                            StageKind::Playback,
                            ErrorCause::SynthesisInterrupted,
                            e.to_string(),
                        ),
                        Err(e) => Event::StageFailed(
                            StageKind::Playback,
                            ErrorCause::LinkFailed,
                            e.to_string(),
                        ),
                    };
                    let _ = tx.send(event).await;
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Helpers

    fn stage_matches_state(&self, stage: StageKind) -> bool {
        matches!(
            (self.state, stage),
            (ControllerState::Capturing, StageKind::Capture)
                | (ControllerState::Recognizing, StageKind::Recognize)
                | (ControllerState::Rewriting, StageKind::Rewrite)
                | (ControllerState::Synthesizing, StageKind::Synthesis)
                | (ControllerState::PlayingBack, StageKind::Playback)
        )
    }

    fn arm(&mut self, deadline: Deadline, ms: u64) {
        self.watchdog = Some((deadline, TokioInstant::now() + Duration::from_millis(ms)));
    }

    fn disarm(&mut self) {
        self.watchdog = None;
    }

    fn stage_started(&mut self) {
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.stage_started_at = Instant::now();
        }
    }

    fn stage_latency_ms(&self) -> Option<u64> {
        self.cycle
            .as_ref()
            .map(|c| c.stage_started_at.elapsed().as_millis() as u64)
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, RollingBuffer> {
        self.buffer.lock().expect("rolling buffer lock")
    }

    fn record(&mut self, event: &str, extra: RecordExtra) {
        let record = TransitionRecord {
            ts: now_rfc3339(),
            session: &self.session_id,
            cycle: self.cycle.as_ref().map(|c| c.ordinal),
            state: self.state.as_str(),
            event,
            resources: ResourceSnapshot {
                mic: self.ledger.mic().as_str(),
                spk: self.ledger.spk().as_str(),
            },
            latency_ms: extra.latency_ms,
            size: extra.size,
            error: extra.error,
        };
        self.telemetry.record(&record);
    }
}

async fn maybe_sleep(deadline: Option<TokioInstant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
