use std::collections::VecDeque;
use std::sync::Mutex;

use crate::Bitrate;

/// Per-frame timing and size input to the capacity estimator.
#[derive(Debug, Clone, Copy)]
pub struct FdaceSample {
    pub frame_id: u64,
    /// Send duration in seconds.
    pub send_secs: f64,
    /// Receive duration in seconds. Until a feedback channel is wired the
    /// send loop feeds the send duration here, which degenerates the
    /// capacity estimate to a send-side throughput.
    pub recv_secs: f64,
    /// Frame size in bits.
    pub bits: f64,
}

/// Result of the least-squares fit of `R/L = a * (S/L) + b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
}

const DEFAULT_FDACE_CAPACITY: usize = 120;

/// Sliding window of FDACE samples with a linear-regression fit and a
/// simplified capacity point estimate.
///
/// Defaults to the 120 most recent frames, about four seconds at 30 Hz.
#[derive(Debug)]
pub struct FdaceWindow {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    samples: VecDeque<FdaceSample>,
    capacity: usize,
}

impl FdaceWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_FDACE_CAPACITY
        } else {
            capacity
        };
        FdaceWindow {
            inner: Mutex::new(Inner {
                samples: VecDeque::with_capacity(capacity),
                capacity,
            }),
        }
    }

    /// Append a sample, evicting the oldest beyond capacity. Samples with a
    /// non-positive size are ignored.
    pub fn record(&self, sample: FdaceSample) {
        if sample.bits <= 0.0 {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.samples.len() == inner.capacity {
            inner.samples.pop_front();
        }
        inner.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordinary least squares over the cloud `{(S/L, R/L)}`.
    ///
    /// Requires at least two finite points and a non-degenerate denominator.
    pub fn fit(&self) -> Option<LineFit> {
        let inner = self.inner.lock().unwrap();
        if inner.samples.len() < 2 {
            return None;
        }

        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_xx = 0.0;
        let mut sum_xy = 0.0;
        let mut valid = 0usize;

        for s in &inner.samples {
            if s.bits <= 0.0 {
                continue;
            }
            let x = s.send_secs / s.bits;
            let y = s.recv_secs / s.bits;
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            sum_x += x;
            sum_y += y;
            sum_xx += x * x;
            sum_xy += x * y;
            valid += 1;
        }

        if valid < 2 {
            return None;
        }

        let n = valid as f64;
        let den = n * sum_xx - sum_x * sum_x;
        if den.abs() < 1e-12 {
            return None;
        }

        let slope = (n * sum_xy - sum_x * sum_y) / den;
        let intercept = (sum_y - slope * sum_x) / n;

        if !slope.is_finite() || !intercept.is_finite() {
            return None;
        }
        Some(LineFit { slope, intercept })
    }

    /// Simplified capacity estimate: the arithmetic mean of `L/R` across
    /// valid samples, in bits per second. This is the value the controllers
    /// consume.
    pub fn capacity_estimate(&self) -> Option<Bitrate> {
        let inner = self.inner.lock().unwrap();

        let mut sum = 0.0;
        let mut count = 0usize;
        for s in &inner.samples {
            if s.recv_secs <= 0.0 {
                continue;
            }
            let rate = s.bits / s.recv_secs;
            if !rate.is_finite() || rate <= 0.0 {
                continue;
            }
            sum += rate;
            count += 1;
        }

        if count == 0 {
            return None;
        }
        Some(Bitrate::from(sum / count as f64))
    }
}

impl Default for FdaceWindow {
    fn default() -> Self {
        Self::new(DEFAULT_FDACE_CAPACITY)
    }
}
