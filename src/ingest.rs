//! Mic ingest: the rolling PCM buffer and the per-frame processing that
//! feeds the segmenter.
//!
//! The buffer is keyed by a monotonic absolute sample index that never
//! wraps, so segment boundaries stay valid while old audio is evicted.
//! Ingest is the buffer's only writer; the controller reads from it only
//! while freezing an accepted segment.

use crate::controller::events::Event;
use crate::segmenter::{SegmentEvent, Segmenter};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::warn;

/// Consecutive over-capacity frames before pressure is fatal to the cycle.
const SUSTAINED_PRESSURE_FRAMES: u32 = 50;

/// One unit of inbound binary audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Monotonic receive timestamp.
    pub received_at: Instant,
    /// 16-bit mono PCM samples.
    pub samples: Vec<i16>,
}

/// Bounded FIFO of PCM samples with absolute indices.
#[derive(Debug)]
pub struct RollingBuffer {
    samples: VecDeque<i16>,
    /// Absolute index of `samples[0]`.
    base_index: u64,
    capacity: usize,
    /// Samples at or above this index are owned by an active segment and
    /// must not be evicted.
    hold_from: Option<u64>,
}

impl RollingBuffer {
    /// Create a buffer holding at most `capacity` samples (absent a hold).
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1 << 20)),
            base_index: 0,
            capacity,
            hold_from: None,
        }
    }

    /// Append samples. Returns the absolute index range they occupy and
    /// whether the buffer is over capacity after eviction.
    pub fn push(&mut self, samples: &[i16]) -> (Range<u64>, bool) {
        let start = self.highest_index();
        self.samples.extend(samples.iter().copied());
        let over = self.evict();
        (start..self.highest_index(), over)
    }

    fn evict(&mut self) -> bool {
        while self.samples.len() > self.capacity {
            if matches!(self.hold_from, Some(hold) if self.base_index >= hold) {
                return true;
            }
            self.samples.pop_front();
            self.base_index += 1;
        }
        false
    }

    /// Protect samples from `index` onwards from eviction, or release the
    /// hold with `None`.
    pub fn hold_from(&mut self, index: Option<u64>) {
        self.hold_from = index;
        if index.is_none() {
            self.evict();
        }
    }

    /// Absolute index one past the newest sample.
    pub fn highest_index(&self) -> u64 {
        self.base_index + self.samples.len() as u64
    }

    /// Absolute index of the oldest retained sample.
    pub fn base_index(&self) -> u64 {
        self.base_index
    }

    /// Number of resident samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no samples are resident.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Copy `[start, end)`, clamped to what is still resident.
    pub fn slice(&self, start: u64, end: u64) -> Vec<i16> {
        let start = start.max(self.base_index);
        let end = end.min(self.highest_index());
        if end <= start {
            return Vec::new();
        }
        let from = (start - self.base_index) as usize;
        let to = (end - self.base_index) as usize;
        self.samples.range(from..to).copied().collect()
    }

    /// Mean absolute amplitude over `[start, end)`, clamped to residency.
    pub fn mean_abs(&self, start: u64, end: u64) -> f32 {
        let slice = self.slice(start, end);
        if slice.is_empty() {
            return 0.0;
        }
        let total: u64 = slice.iter().map(|s| s.unsigned_abs() as u64).sum();
        total as f32 / slice.len() as f32
    }
}

/// Per-frame ingest: appends to the rolling buffer and runs the segmenter
/// on the reader's cadence while capture is enabled.
pub struct MicIngest {
    buffer: Arc<Mutex<RollingBuffer>>,
    segmenter: Segmenter,
    capture_enabled: Arc<AtomicBool>,
    was_enabled: bool,
    pressure_streak: u32,
    pressure_reported: bool,
}

impl MicIngest {
    /// Create an ingest front-end over a shared rolling buffer.
    pub fn new(
        buffer: Arc<Mutex<RollingBuffer>>,
        segmenter: Segmenter,
        capture_enabled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            buffer,
            segmenter,
            capture_enabled,
            was_enabled: false,
            pressure_streak: 0,
            pressure_reported: false,
        }
    }

    /// Process one inbound frame and return the controller events it
    /// produced, in order.
    pub fn handle_frame(&mut self, frame: AudioFrame) -> Vec<Event> {
        let enabled = self.capture_enabled.load(Ordering::SeqCst);
        if enabled && !self.was_enabled {
            // Capture was re-enabled after a cycle: the VAD state and any
            // merge window belong to the previous utterance.
            self.segmenter.reset();
        }
        self.was_enabled = enabled;

        let sample_count = frame.samples.len();
        let (range, over_capacity) = {
            let mut buffer = self.buffer.lock().expect("rolling buffer lock");
            buffer.push(&frame.samples)
        };

        let mut events = vec![Event::FrameArrived {
            received_at: frame.received_at,
            sample_count,
        }];

        if over_capacity {
            self.pressure_streak += 1;
            if self.pressure_streak == 1 {
                warn!("rolling buffer over capacity; growing transiently");
            }
            if self.pressure_streak >= SUSTAINED_PRESSURE_FRAMES && !self.pressure_reported {
                self.pressure_reported = true;
                let resident = self.buffer.lock().expect("rolling buffer lock").len();
                events.push(Event::BufferPressure {
                    resident_samples: resident,
                });
            }
        } else {
            self.pressure_streak = 0;
            self.pressure_reported = false;
        }

        if enabled {
            for segment_event in self.segmenter.push(range.start, &frame.samples) {
                events.push(match segment_event {
                    SegmentEvent::Start { start_index } => Event::SegmentStart { start_index },
                    SegmentEvent::End(bounds) => Event::SegmentEnd(bounds),
                });
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VadConfig;

    #[test]
    fn indices_are_monotonic_and_absolute() {
        let mut buffer = RollingBuffer::new(1000);
        let (first, _) = buffer.push(&[1i16; 300]);
        let (second, _) = buffer.push(&[2i16; 300]);
        assert_eq!(first, 0..300);
        assert_eq!(second, 300..600);
        assert_eq!(buffer.highest_index(), 600);
    }

    #[test]
    fn eviction_drops_oldest_but_keeps_indices() {
        let mut buffer = RollingBuffer::new(500);
        buffer.push(&[1i16; 400]);
        let (range, over) = buffer.push(&[2i16; 400]);
        assert!(!over);
        assert_eq!(range, 400..800);
        assert_eq!(buffer.len(), 500);
        assert_eq!(buffer.base_index(), 300);

        // Evicted samples are gone; surviving ones keep their values.
        let slice = buffer.slice(300, 800);
        assert_eq!(slice.len(), 500);
        assert!(slice[..100].iter().all(|&s| s == 1));
        assert!(slice[100..].iter().all(|&s| s == 2));
    }

    #[test]
    fn hold_prevents_eviction_and_reports_pressure() {
        let mut buffer = RollingBuffer::new(500);
        buffer.push(&[1i16; 400]);
        buffer.hold_from(Some(0));
        let (_, over) = buffer.push(&[2i16; 400]);
        assert!(over, "held samples cannot be evicted");
        assert_eq!(buffer.len(), 800);

        buffer.hold_from(None);
        assert_eq!(buffer.len(), 500, "release evicts down to capacity");
    }

    #[test]
    fn hold_midway_evicts_only_below_hold() {
        let mut buffer = RollingBuffer::new(500);
        buffer.push(&[1i16; 400]);
        buffer.hold_from(Some(350));
        buffer.push(&[2i16; 400]);
        assert_eq!(buffer.base_index(), 350);
        assert_eq!(buffer.len(), 450);
    }

    #[test]
    fn slice_clamps_to_residency() {
        let mut buffer = RollingBuffer::new(100);
        buffer.push(&[7i16; 250]);
        assert_eq!(buffer.base_index(), 150);
        // Pre-roll reaching before the oldest resident sample is clamped.
        assert_eq!(buffer.slice(0, 160).len(), 10);
        assert!(buffer.slice(240, 240).is_empty());
        assert!(buffer.slice(500, 600).is_empty());
    }

    #[test]
    fn mean_abs_is_average_magnitude() {
        let mut buffer = RollingBuffer::new(100);
        buffer.push(&[100, -100, 300, -300]);
        assert!((buffer.mean_abs(0, 4) - 200.0).abs() < f32::EPSILON);
        assert_eq!(buffer.mean_abs(10, 20), 0.0);
    }

    fn ingest_fixture(capacity: usize) -> (MicIngest, Arc<Mutex<RollingBuffer>>, Arc<AtomicBool>) {
        let buffer = Arc::new(Mutex::new(RollingBuffer::new(capacity)));
        let segmenter = Segmenter::new(&VadConfig::default(), 16_000);
        let enabled = Arc::new(AtomicBool::new(true));
        let ingest = MicIngest::new(Arc::clone(&buffer), segmenter, Arc::clone(&enabled));
        (ingest, buffer, enabled)
    }

    fn frame(samples: Vec<i16>) -> AudioFrame {
        AudioFrame {
            received_at: Instant::now(),
            samples,
        }
    }

    #[test]
    fn every_frame_reports_arrival() {
        let (mut ingest, buffer, _) = ingest_fixture(16_000);
        let events = ingest.handle_frame(frame(vec![0i16; 320]));
        assert!(matches!(
            events[0],
            Event::FrameArrived {
                sample_count: 320,
                ..
            }
        ));
        assert_eq!(buffer.lock().expect("lock").highest_index(), 320);
    }

    #[test]
    fn disabled_capture_buffers_without_segmenting() {
        let (mut ingest, buffer, enabled) = ingest_fixture(160_000);
        enabled.store(false, Ordering::SeqCst);

        // Loud audio that would trigger the VAD if it were running.
        for _ in 0..20 {
            let events = ingest.handle_frame(frame(vec![8_000i16; 320]));
            assert_eq!(events.len(), 1, "only FrameArrived while paused");
        }
        assert_eq!(buffer.lock().expect("lock").highest_index(), 20 * 320);
    }

    #[test]
    fn sustained_pressure_is_reported_once() {
        let (mut ingest, buffer, _) = ingest_fixture(1000);
        buffer.lock().expect("lock").hold_from(Some(0));

        let mut pressure_events = 0;
        for _ in 0..(SUSTAINED_PRESSURE_FRAMES + 20) {
            let events = ingest.handle_frame(frame(vec![0i16; 320]));
            pressure_events += events
                .iter()
                .filter(|e| matches!(e, Event::BufferPressure { .. }))
                .count();
        }
        assert_eq!(pressure_events, 1);
    }
}
