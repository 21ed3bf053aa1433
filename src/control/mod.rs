//! Per-frame congestion controllers.
//!
//! All three algorithms share the same contract: feed back one
//! [`FrameObservation`] per encoded frame via [`Controller::update`], ask for
//! the next frame's [`FrameBudget`] before encoding. The budget carries a
//! controller-specific [`Directive`] telling the send loop how to shape the
//! transmission.

use std::fmt;
use std::time::Duration;

use crate::stats::FrameObservation;
use crate::Bitrate;

mod burst;
mod ndtc;
mod salsify;

pub use burst::{BurstConfig, BurstController};
pub use ndtc::{NdtcConfig, NdtcController};
pub use salsify::{SalsifyConfig, SalsifyController};

/// How the send loop should shape the next frame's transmission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Directive {
    /// The budget alone is authoritative.
    None,
    /// Stretch the frame slot to this wall-clock duration.
    Pacing(Duration),
    /// Send this fraction of the frame's bytes as a compact burst before
    /// pacing the remainder.
    Burst(f64),
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::None => write!(f, "-"),
            Directive::Pacing(d) => write!(f, "pace:{:.3}ms", d.as_secs_f64() * 1000.0),
            Directive::Burst(frac) => write!(f, "burst:{:.4}", frac),
        }
    }
}

/// Target for the next frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameBudget {
    /// Bits the encoder should aim for. Never zero.
    pub target_bits: u64,
    pub directive: Directive,
}

/// Point-in-time controller statistics for the trace log.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerSnapshot {
    /// The rate estimate the budget is derived from, in bit/s.
    pub rate_bps: f64,
    pub mean_frame_bits: f64,
    pub variance_frame_bits: f64,
}

/// The interchangeable congestion-control algorithms.
pub enum Controller {
    Ndtc(NdtcController),
    Salsify(SalsifyController),
    Burst(BurstController),
}

impl Controller {
    pub fn name(&self) -> &'static str {
        match self {
            Controller::Ndtc(_) => "ndtc",
            Controller::Salsify(_) => "salsify",
            Controller::Burst(_) => "burstrtc",
        }
    }

    /// Record an observation and refresh internal statistics.
    pub fn update(&self, obs: FrameObservation) {
        match self {
            Controller::Ndtc(c) => c.update(obs),
            Controller::Salsify(c) => c.update(obs),
            Controller::Burst(c) => c.update(obs),
        }
    }

    /// The budget and directive for the next frame.
    pub fn next_frame_budget(&self) -> FrameBudget {
        match self {
            Controller::Ndtc(c) => c.next_frame_budget(),
            Controller::Salsify(c) => c.next_frame_budget(),
            Controller::Burst(c) => c.next_frame_budget(),
        }
    }

    /// External loss signal. Only NDTC reacts; the other algorithms fold
    /// loss into their window statistics.
    pub fn on_loss(&self) {
        if let Controller::Ndtc(c) = self {
            c.on_loss();
        }
    }

    /// External no-loss-period signal (NDTC additive increase).
    pub fn on_stable_period(&self) {
        if let Controller::Ndtc(c) = self {
            c.on_stable_period();
        }
    }

    /// External capacity estimate, e.g. from a future feedback channel.
    pub fn on_capacity_estimate(&self, rate: Bitrate) {
        if let Controller::Ndtc(c) = self {
            c.on_capacity_estimate(rate);
        }
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        match self {
            Controller::Ndtc(c) => c.snapshot(),
            Controller::Salsify(c) => c.snapshot(),
            Controller::Burst(c) => c.snapshot(),
        }
    }
}
