//! Voice-activity segmenter.
//!
//! Classifies fixed-duration sub-frames of the mic stream as voiced or
//! unvoiced by RMS energy and cuts the stream into utterances: a segment
//! opens after `start_trigger_frames` consecutive voiced sub-frames and
//! closes after `stop_trigger_frames` consecutive unvoiced ones (the
//! hangover). Emitted boundaries carry absolute sample indices into the
//! rolling buffer, widened by the configured pre- and post-roll.

use crate::config::VadConfig;
use tracing::debug;

/// RMS energy thresholds indexed by VAD aggressiveness.
const RMS_THRESHOLDS: [f32; 4] = [150.0, 300.0, 600.0, 1200.0];

/// Boundaries of a completed segment, in absolute sample indices.
///
/// `[start_index, end_index)` is the slice handed to the recognizer and
/// includes the rolls; the voiced bounds delimit the strictly voiced core
/// used for the minimum-duration policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBounds {
    /// Slice start (first voiced sample minus pre-roll).
    pub start_index: u64,
    /// Slice end (one past the last voiced sample, plus post-roll).
    pub end_index: u64,
    /// First strictly voiced sample.
    pub voiced_start: u64,
    /// One past the last strictly voiced sample.
    pub voiced_end: u64,
}

impl SegmentBounds {
    /// Voiced-core duration in seconds at the given sample rate.
    pub fn voiced_duration_secs(&self, sample_rate: u32) -> f32 {
        self.voiced_end.saturating_sub(self.voiced_start) as f32 / sample_rate as f32
    }
}

/// Utterance boundary events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEvent {
    /// The VAD latched onto speech.
    Start {
        /// Slice start including pre-roll.
        start_index: u64,
    },
    /// A segment completed (start, end, and voiced core).
    End(SegmentBounds),
}

#[derive(Debug)]
struct PendingEnd {
    bounds: SegmentBounds,
    frames_left: u32,
}

/// Stateful segmenter over the continuous mic stream.
pub struct Segmenter {
    frame_samples: usize,
    threshold: f32,
    start_trigger: u32,
    stop_trigger: u32,
    pre_roll_samples: u64,
    post_roll_samples: u64,
    min_gap_frames: u32,

    /// Partial sub-frame accumulator and the absolute index of its front.
    acc: Vec<i16>,
    acc_start: u64,
    /// First sample index seen since the last reset; pre-roll never
    /// reaches before it.
    origin: Option<u64>,

    in_speech: bool,
    speech_run: u32,
    silence_run: u32,
    seg_start: u64,
    voiced_start: u64,
    pending_end: Option<PendingEnd>,
}

impl Segmenter {
    /// Build a segmenter for the given VAD settings and sample rate.
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        let frame_samples = (sample_rate * config.frame_duration_ms / 1000) as usize;
        let per_ms = sample_rate as u64 / 1000;
        let aggressiveness = config.aggressiveness.min(3) as usize;
        Self {
            frame_samples: frame_samples.max(1),
            threshold: RMS_THRESHOLDS[aggressiveness],
            start_trigger: config.start_trigger_frames.max(1),
            stop_trigger: config.stop_trigger_frames.max(1),
            pre_roll_samples: config.pre_roll_ms as u64 * per_ms,
            post_roll_samples: config.post_roll_ms as u64 * per_ms,
            min_gap_frames: config.min_gap_ms / config.frame_duration_ms.max(1),
            acc: Vec::new(),
            acc_start: 0,
            origin: None,
            in_speech: false,
            speech_run: 0,
            silence_run: 0,
            seg_start: 0,
            voiced_start: 0,
            pending_end: None,
        }
    }

    /// Feed contiguous samples starting at absolute index `start_index` and
    /// collect any boundary events they complete.
    pub fn push(&mut self, start_index: u64, samples: &[i16]) -> Vec<SegmentEvent> {
        if self.origin.is_none() {
            self.origin = Some(start_index);
            self.acc_start = start_index;
        } else if self.acc_start + self.acc.len() as u64 != start_index {
            // The stream jumped (capture was gated off and back on without
            // a reset). Re-anchor rather than mis-index frames.
            debug!("segmenter re-anchoring at sample {start_index}");
            self.acc.clear();
            self.acc_start = start_index;
        }

        self.acc.extend_from_slice(samples);

        let mut events = Vec::new();
        while self.acc.len() >= self.frame_samples {
            let frame_start = self.acc_start;
            let voiced = rms(&self.acc[..self.frame_samples]) > self.threshold;
            self.classify_frame(frame_start, voiced, &mut events);
            self.acc.drain(..self.frame_samples);
            self.acc_start += self.frame_samples as u64;
        }
        events
    }

    /// Forget all VAD state. The next `push` re-anchors the stream.
    pub fn reset(&mut self) {
        self.acc.clear();
        self.origin = None;
        self.in_speech = false;
        self.speech_run = 0;
        self.silence_run = 0;
        self.pending_end = None;
    }

    fn classify_frame(&mut self, frame_start: u64, voiced: bool, events: &mut Vec<SegmentEvent>) {
        if voiced {
            self.speech_run += 1;
            self.silence_run = 0;
        } else {
            self.silence_run += 1;
            self.speech_run = 0;
        }

        if let Some(pending) = &mut self.pending_end {
            if voiced && self.speech_run >= self.start_trigger {
                // Speech resumed inside the merge window: suppress the
                // intermediate end/start pair and keep the segment open.
                self.in_speech = true;
                self.pending_end = None;
                return;
            }
            pending.frames_left = pending.frames_left.saturating_sub(1);
            if pending.frames_left == 0 {
                let bounds = pending.bounds;
                self.pending_end = None;
                events.push(SegmentEvent::End(bounds));
            }
            return;
        }

        if !self.in_speech {
            if voiced && self.speech_run >= self.start_trigger {
                self.in_speech = true;
                self.voiced_start = frame_start
                    .saturating_sub((self.start_trigger as u64 - 1) * self.frame_samples as u64);
                let floor = self.origin.unwrap_or(0);
                self.seg_start = self
                    .voiced_start
                    .saturating_sub(self.pre_roll_samples)
                    .max(floor);
                events.push(SegmentEvent::Start {
                    start_index: self.seg_start,
                });
            }
        } else if !voiced && self.silence_run >= self.stop_trigger {
            self.in_speech = false;
            let frame_end = frame_start + self.frame_samples as u64;
            let voiced_end =
                frame_end.saturating_sub(self.stop_trigger as u64 * self.frame_samples as u64);
            // The hangover is at least as long as the post-roll by default;
            // clamp anyway so the end never points past delivered audio.
            let end_index = (voiced_end + self.post_roll_samples).min(frame_end);
            let bounds = SegmentBounds {
                start_index: self.seg_start,
                end_index,
                voiced_start: self.voiced_start,
                voiced_end,
            };
            let hold_frames = self.min_gap_frames.saturating_sub(self.stop_trigger);
            if hold_frames == 0 {
                events.push(SegmentEvent::End(bounds));
            } else {
                self.pending_end = Some(PendingEnd {
                    bounds,
                    frames_left: hold_frames,
                });
            }
        }
    }
}

fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;
    const FRAME: usize = 320;

    fn segmenter() -> Segmenter {
        Segmenter::new(&VadConfig::default(), RATE)
    }

    fn voiced_frame() -> Vec<i16> {
        // Alternating full-scale-ish square wave, far above any threshold.
        (0..FRAME)
            .map(|i| if i % 2 == 0 { 8_000 } else { -8_000 })
            .collect()
    }

    fn silent_frame() -> Vec<i16> {
        vec![0i16; FRAME]
    }

    fn feed(seg: &mut Segmenter, index: &mut u64, frame: Vec<i16>) -> Vec<SegmentEvent> {
        let events = seg.push(*index, &frame);
        *index += frame.len() as u64;
        events
    }

    #[test]
    fn start_requires_consecutive_voiced_frames() {
        let mut seg = segmenter();
        let mut index = 0;

        assert!(feed(&mut seg, &mut index, voiced_frame()).is_empty());
        assert!(feed(&mut seg, &mut index, voiced_frame()).is_empty());
        let events = feed(&mut seg, &mut index, voiced_frame());
        assert_eq!(events, vec![SegmentEvent::Start { start_index: 0 }]);
    }

    #[test]
    fn interrupted_run_does_not_start() {
        let mut seg = segmenter();
        let mut index = 0;

        feed(&mut seg, &mut index, voiced_frame());
        feed(&mut seg, &mut index, voiced_frame());
        assert!(feed(&mut seg, &mut index, silent_frame()).is_empty());
        feed(&mut seg, &mut index, voiced_frame());
        let events = feed(&mut seg, &mut index, voiced_frame());
        assert!(events.is_empty(), "run was broken by silence");
    }

    #[test]
    fn pre_roll_is_applied_once_audio_precedes_speech() {
        let mut seg = segmenter();
        let mut index = 0;

        // One second of leading silence, then speech.
        for _ in 0..50 {
            feed(&mut seg, &mut index, silent_frame());
        }
        feed(&mut seg, &mut index, voiced_frame());
        feed(&mut seg, &mut index, voiced_frame());
        let events = feed(&mut seg, &mut index, voiced_frame());

        // Speech began at sample 50 * 320 = 16 000; pre-roll is 200 ms.
        assert_eq!(
            events,
            vec![SegmentEvent::Start {
                start_index: 16_000 - 3_200
            }]
        );
    }

    #[test]
    fn hangover_closes_after_stop_trigger() {
        let mut seg = segmenter();
        let mut index = 0;

        for _ in 0..10 {
            feed(&mut seg, &mut index, voiced_frame());
        }
        // 19 silent frames: still open.
        for _ in 0..19 {
            assert!(feed(&mut seg, &mut index, silent_frame()).is_empty());
        }
        // The 20th closes it.
        let events = feed(&mut seg, &mut index, silent_frame());
        let voiced_end = 10 * FRAME as u64;
        assert_eq!(
            events,
            vec![SegmentEvent::End(SegmentBounds {
                start_index: 0,
                end_index: voiced_end + 3_200,
                voiced_start: 0,
                voiced_end,
            })]
        );
    }

    #[test]
    fn voiced_core_excludes_rolls() {
        let mut seg = segmenter();
        let mut index = 0;
        for _ in 0..50 {
            feed(&mut seg, &mut index, silent_frame());
        }
        for _ in 0..25 {
            feed(&mut seg, &mut index, voiced_frame());
        }
        let mut end = None;
        for _ in 0..20 {
            for event in feed(&mut seg, &mut index, silent_frame()) {
                if let SegmentEvent::End(bounds) = event {
                    end = Some(bounds);
                }
            }
        }
        let bounds = end.expect("segment closed");
        assert_eq!(bounds.voiced_start, 16_000);
        assert_eq!(bounds.voiced_end, 16_000 + 25 * FRAME as u64);
        assert!((bounds.voiced_duration_secs(RATE) - 0.5).abs() < 1e-3);
        assert_eq!(bounds.start_index, bounds.voiced_start - 3_200);
        assert_eq!(bounds.end_index, bounds.voiced_end + 3_200);
    }

    #[test]
    fn close_segments_merge_when_gap_is_below_minimum() {
        // A short stop trigger with a long merge gap exercises the pending
        // window: speech resuming inside it must not split the segment.
        let config = VadConfig {
            stop_trigger_frames: 2,
            min_gap_ms: 200,
            ..VadConfig::default()
        };
        let mut seg = Segmenter::new(&config, RATE);
        let mut index = 0;

        let mut events = Vec::new();
        for _ in 0..10 {
            events.extend(feed(&mut seg, &mut index, voiced_frame()));
        }
        for _ in 0..2 {
            events.extend(feed(&mut seg, &mut index, silent_frame()));
        }
        for _ in 0..10 {
            events.extend(feed(&mut seg, &mut index, voiced_frame()));
        }
        for _ in 0..12 {
            events.extend(feed(&mut seg, &mut index, silent_frame()));
        }

        let starts = events
            .iter()
            .filter(|e| matches!(e, SegmentEvent::Start { .. }))
            .count();
        let ends: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SegmentEvent::End(b) => Some(*b),
                SegmentEvent::Start { .. } => None,
            })
            .collect();
        assert_eq!(starts, 1, "pause shorter than min gap must merge");
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].voiced_start, 0);
        assert_eq!(ends[0].voiced_end, 22 * FRAME as u64);
    }

    #[test]
    fn reset_forgets_state_and_reanchors() {
        let mut seg = segmenter();
        let mut index = 0;
        feed(&mut seg, &mut index, voiced_frame());
        feed(&mut seg, &mut index, voiced_frame());
        seg.reset();

        // Jump ahead as if frames were dropped while capture was gated.
        let mut index = 100_000;
        feed(&mut seg, &mut index, voiced_frame());
        feed(&mut seg, &mut index, voiced_frame());
        let events = feed(&mut seg, &mut index, voiced_frame());
        assert_eq!(
            events,
            vec![SegmentEvent::Start {
                start_index: 100_000
            }]
        );
    }

    #[test]
    fn partial_frames_accumulate_across_pushes() {
        let mut seg = segmenter();
        let samples = voiced_frame();
        // Deliver one sub-frame in uneven slices.
        assert!(seg.push(0, &samples[..100]).is_empty());
        assert!(seg.push(100, &samples[100..250]).is_empty());
        assert!(seg.push(250, &samples[250..]).is_empty());
        // Two more voiced frames trigger the start.
        assert!(seg.push(320, &voiced_frame()).is_empty());
        let events = seg.push(640, &voiced_frame());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms(&[0i16; 320]), 0.0);
        assert!(rms(&[1_000i16; 320]) > 999.0);
    }
}
