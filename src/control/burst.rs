use std::time::Duration;

use crate::stats::{FrameObservation, SampleWindow};
use crate::Bitrate;

use super::{ControllerSnapshot, Directive, FrameBudget};

/// Assumed available bandwidth before the window has any observations.
const FALLBACK_AVAILABLE: Bitrate = Bitrate::mbps(5);

/// BurstRTC controller parameters.
#[derive(Debug, Clone, Copy)]
pub struct BurstConfig {
    pub frame_period: Duration,
    pub safety_margin: f64,
    pub window_size: usize,
    /// Fraction of a frame's bytes sent as a compact burst before the
    /// remainder is paced.
    pub burst_fraction: f64,
    /// Coefficient-of-variation above which the burst fraction is reduced.
    pub cov_threshold: f64,
    /// Multiplier applied to the burst fraction past the threshold.
    pub cov_penalty: f64,
}

impl Default for BurstConfig {
    fn default() -> Self {
        BurstConfig {
            frame_period: Duration::from_secs(1) / 30,
            safety_margin: 0.7,
            window_size: 30,
            burst_fraction: 0.3,
            cov_threshold: 0.5,
            cov_penalty: 0.7,
        }
    }
}

impl BurstConfig {
    pub fn frame_period(mut self, period: Duration) -> Self {
        self.frame_period = period;
        self
    }

    pub fn safety_margin(mut self, margin: f64) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn burst_fraction(mut self, fraction: f64) -> Self {
        self.burst_fraction = fraction;
        self
    }

    fn sanitized(mut self) -> Self {
        let defaults = BurstConfig::default();
        if self.frame_period.is_zero() {
            self.frame_period = defaults.frame_period;
        }
        if self.safety_margin <= 0.0 || self.safety_margin > 1.0 {
            self.safety_margin = defaults.safety_margin;
        }
        if self.window_size == 0 {
            self.window_size = defaults.window_size;
        }
        if self.burst_fraction <= 0.0 || self.burst_fraction > 1.0 {
            self.burst_fraction = defaults.burst_fraction;
        }
        if self.cov_threshold <= 0.0 {
            self.cov_threshold = defaults.cov_threshold;
        }
        if self.cov_penalty <= 0.0 || self.cov_penalty > 1.0 {
            self.cov_penalty = defaults.cov_penalty;
        }
        self
    }
}

/// Burst+pacing controller with a statistical frame-size model: the window's
/// throughput bounds the budget, and high frame-size variance shrinks the
/// burst to soften queue impact.
pub struct BurstController {
    cfg: BurstConfig,
    window: SampleWindow,
}

impl BurstController {
    pub fn new(cfg: BurstConfig) -> Self {
        let cfg = cfg.sanitized();
        BurstController {
            window: SampleWindow::new(cfg.window_size, cfg.frame_period),
            cfg,
        }
    }

    pub fn update(&self, obs: FrameObservation) {
        self.window.record(obs);
    }

    /// `target_bits = available_bps * frame_period * safety_margin`, with the
    /// burst fraction penalised when the frame-size coefficient of variation
    /// exceeds the threshold.
    pub fn next_frame_budget(&self) -> FrameBudget {
        let available = self
            .window
            .throughput()
            .filter(|t| t.as_f64() > 0.0)
            .unwrap_or(FALLBACK_AVAILABLE);

        let target_bits =
            (available.as_f64() * self.cfg.frame_period.as_secs_f64() * self.cfg.safety_margin)
                as u64;
        let target_bits = target_bits.max(1);

        let mut burst_fraction = self.cfg.burst_fraction;
        let mean = self.window.mean_bits();
        let variance = self.window.variance_bits();
        if mean > 0.0 && variance > 0.0 {
            let cov = variance.sqrt() / mean;
            if cov > self.cfg.cov_threshold {
                burst_fraction *= self.cfg.cov_penalty;
            }
        }

        FrameBudget {
            target_bits,
            directive: Directive::Burst(burst_fraction),
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

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;

    fn obs(id: u64, t0: Instant, dur: Duration, bits: u64) -> FrameObservation {
        FrameObservation {
            frame_id: id,
            send_start: t0,
            send_end: t0 + dur,
            bits,
            loss: false,
        }
    }

    #[test]
    fn fallback_budget_when_window_is_empty() {
        let c = BurstController::new(BurstConfig::default());
        let budget = c.next_frame_budget();

        // 5 Mbit/s * 1/30 s * 0.7.
        let expected = (5e6 * (Duration::from_secs(1) / 30).as_secs_f64() * 0.7) as u64;
        assert_eq!(budget.target_bits, expected);
        assert_eq!(budget.directive, Directive::Burst(0.3));
    }

    #[test]
    fn stable_frame_sizes_keep_default_burst() {
        let c = BurstController::new(BurstConfig::default());
        let t0 = Instant::now();
        for i in 1..=10u64 {
            c.update(obs(i, t0, Duration::from_millis(33), 100_000));
        }

        let Directive::Burst(fraction) = c.next_frame_budget().directive else {
            panic!("BurstRTC must emit a burst directive");
        };
        assert_eq!(fraction, 0.3);
    }

    #[test]
    fn high_variance_penalises_burst_fraction() {
        let c = BurstController::new(BurstConfig::default());
        let t0 = Instant::now();

        // Mean 100_000, sample standard deviation exactly 60_000:
        // coefficient of variation 0.6 > 0.5.
        c.update(obs(1, t0, Duration::from_millis(33), 40_000));
        c.update(obs(2, t0, Duration::from_millis(33), 100_000));
        c.update(obs(3, t0, Duration::from_millis(33), 160_000));

        assert_eq!(c.window.mean_bits(), 100_000.0);
        assert_eq!(c.window.variance_bits().sqrt(), 60_000.0);

        let Directive::Burst(fraction) = c.next_frame_budget().directive else {
            panic!("BurstRTC must emit a burst directive");
        };
        assert!((fraction - 0.21).abs() < 1e-12);
    }

    #[test]
    fn burst_fraction_stays_in_unit_interval() {
        let c = BurstController::new(BurstConfig::default().burst_fraction(1.5));
        let budget = c.next_frame_budget();
        let Directive::Burst(fraction) = budget.directive else {
            panic!("BurstRTC must emit a burst directive");
        };
        assert!(fraction > 0.0 && fraction <= 1.0);
    }

    #[test]
    fn budget_follows_window_throughput() {
        let cfg = BurstConfig::default();
        let c = BurstController::new(cfg);
        let t0 = Instant::now();

        // 4 Mbit/s: 400_000 bits per 100ms frame.
        for i in 1..=10u64 {
            c.update(obs(i, t0, Duration::from_millis(100), 400_000));
        }

        let expected =
            (4e6 * (Duration::from_secs(1) / 30).as_secs_f64() * 0.7) as u64;
        assert_eq!(c.next_frame_budget().target_bits, expected);
    }
}
