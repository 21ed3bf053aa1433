use std::time::Duration;

use crate::stats::{FrameObservation, SampleWindow};

use super::{ControllerSnapshot, Directive, FrameBudget};

/// Assumed throughput before the window has any observations.
const FALLBACK_THROUGHPUT_BPS: f64 = 500_000.0;
/// Loss rate above which the budget is scaled down.
const LOSS_BACKOFF_KNEE: f64 = 0.02;
/// Hard floor for the loss back-off scale.
const LOSS_BACKOFF_FLOOR: f64 = 0.3;

/// Salsify controller parameters.
#[derive(Debug, Clone, Copy)]
pub struct SalsifyConfig {
    pub frame_period: Duration,
    /// Discount on the estimated throughput, akin to picking a conservative
    /// quantile.
    pub safety_margin: f64,
    /// Target queueing+transmission latency. Exposed for experiments but not
    /// consulted by the current budget formula.
    pub latency_target: Duration,
    pub window_size: usize,
    /// Budget clamp, in bits.
    pub min_budget: u64,
    pub max_budget: u64,
}

impl Default for SalsifyConfig {
    fn default() -> Self {
        SalsifyConfig {
            frame_period: Duration::from_secs(1) / 30,
            safety_margin: 0.7,
            latency_target: Duration::from_millis(200),
            window_size: 30,
            min_budget: 10_000,
            max_budget: 5_000_000,
        }
    }
}

impl SalsifyConfig {
    pub fn frame_period(mut self, period: Duration) -> Self {
        self.frame_period = period;
        self
    }

    pub fn safety_margin(mut self, margin: f64) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    fn sanitized(mut self) -> Self {
        let defaults = SalsifyConfig::default();
        if self.frame_period.is_zero() {
            self.frame_period = defaults.frame_period;
        }
        if self.safety_margin <= 0.0 || self.safety_margin > 1.0 {
            self.safety_margin = defaults.safety_margin;
        }
        if self.window_size == 0 {
            self.window_size = defaults.window_size;
        }
        if self.latency_target.is_zero() {
            self.latency_target = defaults.latency_target;
        }
        self
    }
}

/// Per-frame budget controller in the Salsify style: the sliding-window
/// throughput, discounted by the safety margin, bounds the next frame.
pub struct SalsifyController {
    cfg: SalsifyConfig,
    window: SampleWindow,
}

impl SalsifyController {
    pub fn new(cfg: SalsifyConfig) -> Self {
        let cfg = cfg.sanitized();
        debug!(
            "Salsify latency target {:?} configured (not consulted by the budget formula yet)",
            cfg.latency_target
        );
        SalsifyController {
            window: SampleWindow::new(cfg.window_size, cfg.frame_period),
            cfg,
        }
    }

    pub fn update(&self, obs: FrameObservation) {
        self.window.record(obs);
    }

    /// `budget = throughput * frame_period * safety_margin`, softened further
    /// when the loss rate exceeds 2%, clamped to the configured interval.
    pub fn next_frame_budget(&self) -> FrameBudget {
        let throughput = self
            .window
            .throughput()
            .map(|t| t.as_f64())
            .filter(|t| *t > 0.0)
            .unwrap_or(FALLBACK_THROUGHPUT_BPS);

        let mut budget = throughput * self.cfg.frame_period.as_secs_f64() * self.cfg.safety_margin;

        let loss_rate = self.window.loss_rate();
        if loss_rate > LOSS_BACKOFF_KNEE {
            let over = loss_rate - LOSS_BACKOFF_KNEE;
            let scale = (1.0 - over * 10.0).max(LOSS_BACKOFF_FLOOR);
            budget *= scale;
        }

        let budget = budget
            .clamp(self.cfg.min_budget as f64, self.cfg.max_budget as f64)
            .round() as u64;

        FrameBudget {
            target_bits: budget,
            directive: Directive::None,
        }
    }

    pub(crate) fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            rate_bps: self.window.throughput().map(|t| t.as_f64()).unwrap_or(0.0),
            mean_frame_bits: self.window.mean_bits(),
            variance_frame_bits: self.window.variance_bits(),
        }
    }
}
