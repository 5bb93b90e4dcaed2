//! Drift-corrected frame pacing.
//!
//! Frame `n` is due at `origin + n / fps`. Sleeping until the due time (rather
//! than a fixed interval after each frame) keeps encode and send jitter from
//! accumulating. A frame that is already late is produced immediately, and
//! frames that were missed are never produced in a burst.

use std::time::Duration;
use tokio::time::Instant;

use super::clamp_fps;

pub struct Pacer {
    fps: u32,
    /// Start of the current timing epoch (reset when fps changes)
    origin: Instant,
    /// Frames produced before `origin`
    origin_frame: u64,
    produced: u64,
    started: Instant,
}

impl Pacer {
    pub fn new(fps: u32) -> Self {
        let now = Instant::now();
        Self {
            fps: clamp_fps(fps),
            origin: now,
            origin_frame: 0,
            produced: 0,
            started: now,
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Switch rates. The new rate starts counting from now.
    pub fn set_fps(&mut self, fps: u32) {
        let fps = clamp_fps(fps);
        if fps != self.fps {
            self.fps = fps;
            self.origin = Instant::now();
            self.origin_frame = self.produced;
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.fps as u64)
    }

    /// Offset of the next frame's slot from `origin`
    fn next_due(&self) -> Duration {
        let n = self.produced - self.origin_frame;
        Duration::from_nanos(n * 1_000_000_000 / self.fps as u64)
    }

    /// How long to wait at `now` before producing the next frame
    pub fn delay_at(&self, now: Instant) -> Duration {
        let actual = now.saturating_duration_since(self.origin);
        self.next_due().saturating_sub(actual)
    }

    /// Sleep until the next frame is due. A stream more than one interval
    /// behind drops the missed slots and restarts its schedule from now.
    pub async fn wait(&mut self) {
        let now = Instant::now();
        let actual = now.saturating_duration_since(self.origin);
        if actual > self.next_due() + self.interval() {
            self.origin = now;
            self.origin_frame = self.produced;
            return;
        }
        let delay = self.delay_at(now);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Record a produced frame. Every `fps` frames returns the measured rate
    /// since the pacer started (diagnostic only).
    pub fn frame_done(&mut self) -> Option<f64> {
        self.produced += 1;
        if self.produced % self.fps as u64 != 0 {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            Some(self.produced as f64 / elapsed)
        } else {
            None
        }
    }
}
