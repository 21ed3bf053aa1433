use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::Bitrate;

/// One send-side observation, produced at the end of each encoded frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameObservation {
    /// Monotonic frame counter, starting at 1.
    pub frame_id: u64,
    pub send_start: Instant,
    pub send_end: Instant,
    /// Actual encoded size of the frame.
    pub bits: u64,
    pub loss: bool,
}

impl FrameObservation {
    pub fn send_duration(&self) -> Duration {
        self.send_end.saturating_duration_since(self.send_start)
    }
}

const DEFAULT_WINDOW_SIZE: usize = 30;

/// A bounded-capacity FIFO of the most recent frame observations.
///
/// Holds roughly one second of send activity at 30 Hz with the default
/// capacity. Eviction is O(1); the statistics are O(N) over the window.
/// Queries are safe to run concurrently with [`SampleWindow::record`].
#[derive(Debug)]
pub struct SampleWindow {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    samples: VecDeque<FrameObservation>,
    capacity: usize,
    frame_period: Duration,
}

impl SampleWindow {
    /// A window holding the `capacity` most recent observations.
    ///
    /// `frame_period` is the lower clamp for per-frame send durations in the
    /// throughput aggregate, so that near-instant sends cannot blow the rate
    /// up. A zero `capacity` falls back to the default of 30.
    pub fn new(capacity: usize, frame_period: Duration) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_WINDOW_SIZE
        } else {
            capacity
        };
        SampleWindow {
            inner: Mutex::new(Inner {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                frame_period,
            }),
        }
    }

    /// Append an observation, evicting the oldest beyond capacity.
    ///
    /// Observations with a zero bit count are ignored.
    pub fn record(&self, obs: FrameObservation) {
        if obs.bits == 0 {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.samples.len() == inner.capacity {
            inner.samples.pop_front();
        }
        inner.samples.push_back(obs);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arithmetic mean of the frame sizes, in bits. 0.0 when empty.
    pub fn mean_bits(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        let n = inner.samples.len();
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = inner.samples.iter().map(|o| o.bits as f64).sum();
        sum / n as f64
    }

    /// Sample variance of the frame sizes, with the (n-1) denominator.
    /// 0.0 with fewer than two samples.
    pub fn variance_bits(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        let n = inner.samples.len();
        if n < 2 {
            return 0.0;
        }
        let mean: f64 = inner.samples.iter().map(|o| o.bits as f64).sum::<f64>() / n as f64;
        let sq_sum: f64 = inner
            .samples
            .iter()
            .map(|o| {
                let d = o.bits as f64 - mean;
                d * d
            })
            .sum();
        sq_sum / (n - 1) as f64
    }

    /// Aggregated throughput over the window: total bits divided by total
    /// send durations, each duration clamped to at least the frame period.
    ///
    /// `None` while the window is empty.
    pub fn throughput(&self) -> Option<Bitrate> {
        let inner = self.inner.lock().unwrap();
        if inner.samples.is_empty() {
            return None;
        }

        let mut total_bits = 0u64;
        let mut total_duration = Duration::ZERO;
        for obs in &inner.samples {
            total_bits += obs.bits;
            total_duration += obs.send_duration().max(inner.frame_period);
        }

        let secs = total_duration.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(Bitrate::from(total_bits as f64 / secs))
    }

    /// Fraction of observations with the loss flag set. 0.0 when empty.
    pub fn loss_rate(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        let n = inner.samples.len();
        if n == 0 {
            return 0.0;
        }
        let lost = inner.samples.iter().filter(|o| o.loss).count();
        lost as f64 / n as f64
    }
}
