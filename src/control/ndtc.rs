use std::sync::Mutex;
use std::time::Duration;

use crate::stats::{FdaceSample, FdaceWindow, FrameObservation};
use crate::Bitrate;

use super::{ControllerSnapshot, Directive, FrameBudget};

/// Conservative assumption before the first capacity estimate arrives.
const FALLBACK_CAPACITY: Bitrate = Bitrate::mbps(5);
/// Symmetric jitter applied to the pacing duration.
const PACING_JITTER: f64 = 0.1;

/// NDTC controller parameters.
#[derive(Debug, Clone, Copy)]
pub struct NdtcConfig {
    /// Frame period `T_F`.
    pub frame_period: Duration,
    /// Target send duration as a fraction of the frame period (`T_S`).
    pub target_send_fraction: f64,
    /// Target receive duration as a fraction of the frame period (`T_R`).
    pub target_recv_fraction: f64,
    /// Additive increase per stable period (0.05 adds 5%).
    pub ai_step: f64,
    /// Multiplicative decrease on loss (0.5 halves the capacity).
    pub md_ratio: f64,
    /// EMA smoothing factor for incoming capacity estimates.
    pub alpha: f64,
    /// Capacity of the FDACE sample window.
    pub fdace_window: usize,
}

impl Default for NdtcConfig {
    fn default() -> Self {
        NdtcConfig {
            frame_period: Duration::from_secs(1) / 30,
            target_send_fraction: 0.7,
            target_recv_fraction: 0.8,
            ai_step: 0.05,
            md_ratio: 0.5,
            alpha: 0.1,
            fdace_window: 120,
        }
    }
}

impl NdtcConfig {
    pub fn frame_period(mut self, period: Duration) -> Self {
        self.frame_period = period;
        self
    }

    pub fn ai_step(mut self, step: f64) -> Self {
        self.ai_step = step;
        self
    }

    pub fn md_ratio(mut self, ratio: f64) -> Self {
        self.md_ratio = ratio;
        self
    }

    /// Out-of-range values fall back to the documented defaults.
    fn sanitized(mut self) -> Self {
        let defaults = NdtcConfig::default();
        if self.frame_period.is_zero() {
            self.frame_period = defaults.frame_period;
        }
        if self.target_send_fraction <= 0.0 {
            self.target_send_fraction = defaults.target_send_fraction;
        }
        if self.target_recv_fraction <= 0.0 {
            self.target_recv_fraction = defaults.target_recv_fraction;
        }
        if self.ai_step <= 0.0 {
            self.ai_step = defaults.ai_step;
        }
        if self.md_ratio <= 0.0 || self.md_ratio >= 1.0 {
            self.md_ratio = defaults.md_ratio;
        }
        if self.alpha <= 0.0 || self.alpha > 1.0 {
            self.alpha = defaults.alpha;
        }
        self
    }

    fn t_send(&self) -> Duration {
        self.frame_period.mul_f64(self.target_send_fraction)
    }

    fn t_recv(&self) -> Duration {
        self.frame_period.mul_f64(self.target_recv_fraction)
    }
}

/// AIMD controller converting FDACE capacity estimates into per-frame
/// budgets and pacing durations.
pub struct NdtcController {
    cfg: NdtcConfig,
    fdace: FdaceWindow,
    state: Mutex<State>,
}

struct State {
    /// Smoothed capacity estimate. `Some` implies a positive rate.
    capacity: Option<Bitrate>,
    /// Most recent raw estimate, kept for the trace log.
    last_estimate: Option<Bitrate>,
    rng: fastrand::Rng,
}

impl NdtcController {
    pub fn new(cfg: NdtcConfig) -> Self {
        let cfg = cfg.sanitized();
        NdtcController {
            fdace: FdaceWindow::new(cfg.fdace_window),
            cfg,
            state: Mutex::new(State {
                capacity: None,
                last_estimate: None,
                rng: fastrand::Rng::new(),
            }),
        }
    }

    /// Deterministic pacing jitter for tests.
    pub fn with_seed(cfg: NdtcConfig, seed: u64) -> Self {
        let c = Self::new(cfg);
        c.state.lock().unwrap().rng = fastrand::Rng::with_seed(seed);
        c
    }

    /// Record a frame observation.
    ///
    /// The receive duration is approximated with the send duration until a
    /// feedback channel exists, so the FDACE estimate tracks the send-side
    /// throughput.
    pub fn update(&self, obs: FrameObservation) {
        let send_secs = obs.send_duration().as_secs_f64();
        self.fdace.record(FdaceSample {
            frame_id: obs.frame_id,
            send_secs,
            recv_secs: send_secs,
            bits: obs.bits as f64,
        });

        if obs.loss {
            self.on_loss();
        }

        if let Some(rate) = self.fdace.capacity_estimate() {
            self.on_capacity_estimate(rate);
        }
    }

    /// Seed or EMA-smooth the capacity with an external estimate.
    /// Non-positive rates are ignored.
    pub fn on_capacity_estimate(&self, rate: Bitrate) {
        if rate.as_f64() <= 0.0 {
            return;
        }

        let mut state = self.state.lock().unwrap();
        state.last_estimate = Some(rate);
        state.capacity = Some(match state.capacity {
            None => rate,
            Some(current) => {
                let alpha = self.cfg.alpha;
                Bitrate::from(alpha * rate.as_f64() + (1.0 - alpha) * current.as_f64())
            }
        });
    }

    /// Multiplicative decrease on a loss event.
    pub fn on_loss(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(capacity) = state.capacity {
            state.capacity = Some(capacity * self.cfg.md_ratio);
        }
    }

    /// Additive increase after a stable (loss-free) period.
    pub fn on_stable_period(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(capacity) = state.capacity {
            state.capacity = Some(capacity * (1.0 + self.cfg.ai_step));
        }
    }

    /// `target_bits = T_R * capacity`, paced over `T_S` with 10% jitter.
    pub fn next_frame_budget(&self) -> FrameBudget {
        let mut state = self.state.lock().unwrap();

        let capacity = state.capacity.unwrap_or(FALLBACK_CAPACITY);
        let target_bits = (self.cfg.t_recv().as_secs_f64() * capacity.as_f64()) as u64;
        let target_bits = target_bits.max(1);

        let jitter = 1.0 + PACING_JITTER * (state.rng.f64() * 2.0 - 1.0);
        let pacing = self.cfg.t_send().mul_f64(jitter);

        FrameBudget {
            target_bits,
            directive: Directive::Pacing(pacing),
        }
    }

    pub(crate) fn snapshot(&self) -> ControllerSnapshot {
        let state = self.state.lock().unwrap();
        ControllerSnapshot {
            rate_bps: state.capacity.map(|c| c.as_f64()).unwrap_or(0.0),
            ..Default::default()
        }
    }

    #[cfg(test)]
    fn capacity(&self) -> Option<Bitrate> {
        self.state.lock().unwrap().capacity
    }
}
