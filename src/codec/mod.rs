//! Narrow interface to the codec library.
//!
//! The decoder, encoder and scaler are external collaborators; the send loop
//! only drives them through these traits. The drain-style API mirrors the
//! send/receive shape of common codec bindings: `receive_*` is polled until
//! it reports [`CodecError::Again`], which is a normal outcome rather than a
//! failure.

use thiserror::Error;

mod adapt;
mod candidates;

pub use adapt::{crf_for_budget, EncoderAdapter, CRF_MAX, CRF_MIN};
pub use candidates::{encode_candidates, select_candidate, EncodedCandidate, QP_LADDER};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The codec needs more input (or has no more output) right now.
    /// Normal during decoder/encoder drain.
    #[error("resource temporarily unavailable, try again")]
    Again,

    /// End of the input stream.
    #[error("end of stream")]
    Eof,

    #[error("codec failure: {0}")]
    Failed(String),
}

impl CodecError {
    /// Signals that end a drain loop without being failures.
    pub fn is_drain_end(&self) -> bool {
        matches!(self, CodecError::Again | CodecError::Eof)
    }
}

/// Which elementary stream a compressed unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Other,
}

/// One compressed unit read from the input container.
#[derive(Debug, Clone)]
pub struct CodedUnit {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

/// A raw decoded picture. The pixel data is opaque to this crate.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    /// Presentation timestamp, set by the send loop to the frame counter.
    pub pts: i64,
}

/// One encoded output packet, typically a single NAL unit.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
}

impl EncodedPacket {
    pub fn bits(&self) -> u64 {
        self.data.len() as u64 * 8
    }
}

/// The demuxer side of the input file.
pub trait MediaSource {
    /// Detected video frame rate, if the container knows it.
    fn frame_rate(&self) -> Option<f64>;

    /// Next compressed unit. [`CodecError::Eof`] at end of input.
    fn read_unit(&mut self) -> Result<CodedUnit, CodecError>;

    /// Seek back to the beginning, for loop mode.
    fn seek_start(&mut self) -> Result<(), CodecError>;
}

/// Decoder for the input video stream.
pub trait VideoDecoder {
    fn send_unit(&mut self, unit: &CodedUnit) -> Result<(), CodecError>;

    /// Drain one decoded frame. [`CodecError::Again`] when the decoder is
    /// buffering, which is a normal outcome.
    fn receive_frame(&mut self) -> Result<RawFrame, CodecError>;
}

/// Pixel format / size conversion between decoder and encoder.
pub trait FrameScaler {
    fn scale(&mut self, frame: &RawFrame) -> Result<RawFrame, CodecError>;
}

/// H.264 encoder instance. Created through an [`EncoderFactory`] and
/// replaced wholesale when the quality target moves far enough.
pub trait VideoEncoder {
    fn send_frame(&mut self, frame: &RawFrame) -> Result<(), CodecError>;

    /// Drain one encoded packet. [`CodecError::Again`] ends the drain.
    fn receive_packet(&mut self) -> Result<EncodedPacket, CodecError>;
}

/// Fixed low-latency encoder options plus the tunable quality knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    /// Time base denominator; the numerator is always 1.
    pub fps: u32,
    pub preset: &'static str,
    pub tune: &'static str,
    pub b_frames: u32,
    /// Constant-rate-factor quality target.
    pub crf: i32,
    /// Fixed-QP override used by candidate encoding; `None` means CRF mode.
    pub qp: Option<i32>,
}

impl EncoderSettings {
    /// The streaming profile every encoder in this testbed uses: ultrafast,
    /// zero-latency, no B-frames.
    pub fn low_latency(width: u32, height: u32, fps: u32, crf: i32) -> Self {
        EncoderSettings {
            width,
            height,
            fps,
            preset: "ultrafast",
            tune: "zerolatency",
            b_frames: 0,
            crf,
            qp: None,
        }
    }

    pub fn with_qp(mut self, qp: i32) -> Self {
        self.qp = Some(qp);
        self
    }
}

/// Opens encoder instances. Implemented by the codec-library wrapper.
pub trait EncoderFactory {
    fn open(&mut self, settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>, CodecError>;
}
