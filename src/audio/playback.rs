//! # Playback Scheduler
//!
//! Converts inbound audio payloads into gapless, ordered output and cancels all of it
//! at once when the remote reports that the user started talking (barge-in).
//!
//! ## Scheduling rule:
//! ```text
//! start  = max(cursor, device_now)
//! cursor = start + duration
//! ```
//! - Buffers play in arrival order and never overlap
//! - A buffer never starts in the past
//! - If the cursor fell behind the clock, the next buffer starts immediately instead of
//!   trying to catch up, so drift heals without extra gaps
//!
//! ## Interruption:
//! `interrupt` hard-stops every active source, clears the set and resets the cursor to 0.
//! Source ids keep counting up across interrupts, so a late "ended" event for a stopped
//! source can never remove a newer one.

use crate::audio::pcm::decode_base64_pcm16;
use crate::error::AppResult;
use std::collections::HashSet;
use tracing::{debug, trace};

/// Identifier of one scheduled buffer on an output device.
pub type SourceId = u64;

/// Decoded mono audio ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Decode a base64 PCM16 payload (inbound transport format).
    pub fn decode(data: &str, sample_rate: u32) -> AppResult<Self> {
        Ok(Self::new(decode_base64_pcm16(data)?, sample_rate))
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Output side of the platform audio I/O.
///
/// ## Contract:
/// - `current_time` is the device clock in seconds, non-decreasing
/// - `start` plays `buffer` beginning at clock time `at`
/// - `stop` silences a source before the device renders anything else
/// - when a source finishes on its own, the device reports its id on the ended-event
///   channel it was opened with
pub trait OutputDevice: Send {
    fn current_time(&self) -> f64;
    fn start(&mut self, id: SourceId, buffer: PlaybackBuffer, at: f64);
    fn stop(&mut self, id: SourceId);
    fn close(&mut self);
}

/// Where and when a buffer was placed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start_time: f64,
    pub duration: f64,
    /// Size of the decoded PCM16 payload
    pub pcm_bytes: usize,
}

/// Owns the output device, the playback cursor and the active source set.
pub struct PlaybackScheduler {
    device: Box<dyn OutputDevice>,
    sample_rate: u32,
    /// Earliest time the next buffer may start (`nextStartTime`)
    cursor: f64,
    active: HashSet<SourceId>,
    next_id: SourceId,
    closed: bool,
}

impl PlaybackScheduler {
    /// `sample_rate` is the rate of the inbound PCM, 24kHz for the live endpoint.
    pub fn new(device: Box<dyn OutputDevice>, sample_rate: u32) -> Self {
        Self {
            device,
            sample_rate,
            cursor: 0.0,
            active: HashSet::new(),
            next_id: 0,
            closed: false,
        }
    }

    /// Decode an inbound payload and schedule it.
    ///
    /// ## Returns:
    /// - **Ok(Some(source))**: scheduled
    /// - **Ok(None)**: the payload held no samples, nothing to play
    /// - **Err(DecodeFailure)**: malformed payload; cursor and active set are untouched
    pub fn enqueue(&mut self, data: &str) -> AppResult<Option<ScheduledSource>> {
        let buffer = PlaybackBuffer::decode(data, self.sample_rate)?;
        Ok(self.schedule(buffer))
    }

    /// Schedule an already decoded buffer right after the previous one.
    pub fn schedule(&mut self, buffer: PlaybackBuffer) -> Option<ScheduledSource> {
        if buffer.is_empty() || self.closed {
            return None;
        }

        let now = self.device.current_time();
        let start_time = self.cursor.max(now);
        let duration = buffer.duration();
        let pcm_bytes = buffer.len() * 2;
        let id = self.next_id;
        self.next_id += 1;

        self.device.start(id, buffer, start_time);
        self.cursor = start_time + duration;
        self.active.insert(id);

        trace!(source = id, start_time, duration, cursor = self.cursor, "scheduled playback buffer");

        Some(ScheduledSource {
            id,
            start_time,
            duration,
            pcm_bytes,
        })
    }

    /// A source finished playing on its own.
    pub fn on_source_ended(&mut self, id: SourceId) -> bool {
        self.active.remove(&id)
    }

    /// Barge-in: stop everything now and forget the timeline.
    ///
    /// Returns how many sources were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.drain() {
            self.device.stop(id);
        }
        self.cursor = 0.0;

        if stopped > 0 {
            debug!(stopped, "playback interrupted");
        }
        stopped
    }

    /// Stop all output and release the device. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.interrupt();
        self.device.close();
        self.closed = true;
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: SourceId) -> bool {
        self.active.contains(&id)
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

/// In-memory output device with a hand-driven clock, for tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct ManualClockState {
        pub now: f64,
        pub started: Vec<(SourceId, f64, f64)>,
        pub stopped: Vec<SourceId>,
        pub close_calls: u32,
    }

    /// Cloneable handle: the scheduler owns one copy, the test keeps another.
    #[derive(Debug, Clone, Default)]
    pub struct ManualClockOutput {
        pub state: Arc<Mutex<ManualClockState>>,
    }

    impl ManualClockOutput {
        pub fn set_time(&self, now: f64) {
            self.state.lock().unwrap().now = now;
        }

        pub fn started(&self) -> Vec<(SourceId, f64, f64)> {
            self.state.lock().unwrap().started.clone()
        }

        pub fn stopped(&self) -> Vec<SourceId> {
            self.state.lock().unwrap().stopped.clone()
        }

        pub fn close_calls(&self) -> u32 {
            self.state.lock().unwrap().close_calls
        }
    }

    impl OutputDevice for ManualClockOutput {
        fn current_time(&self) -> f64 {
            self.state.lock().unwrap().now
        }

        fn start(&mut self, id: SourceId, buffer: PlaybackBuffer, at: f64) {
            self.state.lock().unwrap().started.push((id, at, buffer.duration()));
        }

        fn stop(&mut self, id: SourceId) {
            self.state.lock().unwrap().stopped.push(id);
        }

        fn close(&mut self) {
            self.state.lock().unwrap().close_calls += 1;
        }
    }
}
