//! Testbed core for comparing per-frame video congestion-control algorithms
//! over an RTP-bearing transport.
//!
//! The sender side ticks at the video frame rate, asks a [`control::Controller`]
//! for a bit budget, drives an H.264 encoder through the narrow interfaces in
//! [`codec`], and records per-frame send metadata. The receiver side parses
//! RFC 6184 payloads back into an Annex-B byte stream and logs per-frame
//! quality-of-experience metrics, reduced to a summary at shutdown.
//!
//! Signalling (SDP/ICE) and the codec library itself are external
//! collaborators; this crate only defines the seams they plug into.

#[macro_use]
extern crate tracing;

use std::io;

use thiserror::Error;

mod units;
pub use units::{Bitrate, DataSize};

pub mod cancel;
pub mod codec;
pub mod control;
pub mod metadata;
pub mod peer;
pub mod receiver;
pub mod sender;
pub mod stats;

use codec::CodecError;
use receiver::TransportError;

/// Top level errors for this crate.
///
/// Only startup-fatal conditions surface as `Err` from the loops; transient
/// codec signals, defensive packet drops and single-row CSV failures are
/// handled (and logged) where they occur.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Codec(#[from] CodecError),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Csv(#[from] csv::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
