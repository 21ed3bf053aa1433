//! Sender side: the cancellable encode/send loop ticking at the video frame
//! rate.
//!
//! Each tick reads one compressed unit, decodes it, asks the controller for
//! a budget, adapts the encoder, and emits the encoded packets as media
//! samples. The per-frame observation is fed back to the controller and the
//! metadata writer once the last byte has been handed to the transport.

use std::time::{Duration, Instant};

use crossbeam_channel::select;

use crate::cancel::CancelToken;
use crate::codec::{
    encode_candidates, select_candidate, CodecError, EncoderAdapter, FrameScaler, MediaSource,
    RawFrame, StreamKind, VideoDecoder,
};
use crate::control::{Controller, Directive, FrameBudget};
use crate::metadata::{FrameMetadata, FrameMetadataWriter};
use crate::stats::FrameObservation;
use crate::Error;

mod trace;

pub use trace::{ControllerTraceWriter, TraceRecord, TRACE_FILE};

/// Outgoing media samples, implemented by the transport wrapper.
pub trait SampleSink {
    /// Hand one encoded packet to the transport at the nominal frame
    /// duration. Any failure is treated as a cancellation signal.
    fn write_sample(&mut self, data: &[u8], duration: Duration) -> std::io::Result<()>;
}

/// Send-loop configuration.
#[derive(Debug, Clone, Copy)]
pub struct SenderConfig {
    /// Seek back to the beginning of the input at EOF instead of finishing.
    pub loop_input: bool,
    /// Used when the container does not report a frame rate.
    pub fallback_frame_rate: f64,
    /// Encode each frame at the fixed QP ladder and pick the best candidate
    /// under the budget (Salsify style) instead of CRF adaptation.
    pub candidate_encoding: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            loop_input: false,
            fallback_frame_rate: 30.0,
            candidate_encoding: false,
        }
    }
}

/// How the send loop ended. Both variants are clean exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// End of input reached (without loop mode).
    Completed,
    /// The cancellation token fired, or a send-sample failure fired it.
    Cancelled,
}

enum FrameResult {
    Sent { bits: u64 },
    Skipped,
    SinkClosed,
}

/// The encode/send loop. Owns the codec state, the controller and the
/// sender-side writers for the lifetime of the session.
pub struct SendLoop {
    source: Box<dyn MediaSource>,
    decoder: Box<dyn VideoDecoder>,
    scaler: Option<Box<dyn FrameScaler>>,
    adapter: EncoderAdapter,
    controller: Controller,
    cancel: CancelToken,
    cfg: SenderConfig,

    metadata: Option<FrameMetadataWriter>,
    trace: Option<ControllerTraceWriter>,

    frame_id: u64,
}

impl SendLoop {
    pub fn new(
        source: Box<dyn MediaSource>,
        decoder: Box<dyn VideoDecoder>,
        adapter: EncoderAdapter,
        controller: Controller,
        cancel: CancelToken,
        cfg: SenderConfig,
    ) -> Self {
        SendLoop {
            source,
            decoder,
            scaler: None,
            adapter,
            controller,
            cancel,
            cfg,
            metadata: None,
            trace: None,
            frame_id: 0,
        }
    }

    pub fn with_scaler(mut self, scaler: Box<dyn FrameScaler>) -> Self {
        self.scaler = Some(scaler);
        self
    }

    pub fn with_metadata_writer(mut self, writer: FrameMetadataWriter) -> Self {
        self.metadata = Some(writer);
        self
    }

    pub fn with_trace_writer(mut self, writer: ControllerTraceWriter) -> Self {
        self.trace = Some(writer);
        self
    }

    pub fn frames_sent(&self) -> u64 {
        self.frame_id
    }

    /// Tick at the detected frame rate until end of input or cancellation.
    pub fn run(mut self, sink: &mut dyn SampleSink) -> Result<SendOutcome, Error> {
        let fps = self
            .source
            .frame_rate()
            .filter(|fps| *fps > 0.0)
            .unwrap_or(self.cfg.fallback_frame_rate);
        let frame_duration = Duration::from_secs_f64(1.0 / fps);

        info!(
            "Send loop starting: {} controller, {:.2} fps, loop={}",
            self.controller.name(),
            fps,
            self.cfg.loop_input
        );

        let ticker = crossbeam_channel::tick(frame_duration);

        loop {
            select! {
                recv(self.cancel.channel()) -> _ => {
                    info!("Cancellation fired, stopping send loop");
                    return Ok(SendOutcome::Cancelled);
                }
                recv(ticker) -> _ => {}
            }

            let unit = match self.source.read_unit() {
                Ok(unit) => unit,
                Err(CodecError::Eof) => {
                    if self.cfg.loop_input {
                        match self.source.seek_start() {
                            Ok(()) => {
                                info!("Input looped, restarting from beginning");
                                continue;
                            }
                            Err(e) => {
                                warn!("Failed to seek to beginning: {}", e);
                                return Ok(SendOutcome::Completed);
                            }
                        }
                    }
                    info!("Input playback completed (EOF reached)");
                    return Ok(SendOutcome::Completed);
                }
                Err(e) => {
                    warn!("Error reading input unit: {}", e);
                    continue;
                }
            };

            if unit.stream != StreamKind::Video {
                continue;
            }

            if let Err(e) = self.decoder.send_unit(&unit) {
                warn!("Error sending unit to decoder: {}", e);
                continue;
            }

            // One unit may yield zero or more frames; drain until Again.
            loop {
                let frame = match self.decoder.receive_frame() {
                    Ok(frame) => frame,
                    Err(e) if e.is_drain_end() => break,
                    Err(e) => {
                        warn!("Error receiving decoded frame: {}", e);
                        break;
                    }
                };

                match self.process_frame(frame, frame_duration, sink)? {
                    FrameResult::Sent { .. } | FrameResult::Skipped => {}
                    FrameResult::SinkClosed => {
                        self.cancel.fire();
                        return Ok(SendOutcome::Cancelled);
                    }
                }
            }
        }
    }

    fn process_frame(
        &mut self,
        mut frame: RawFrame,
        frame_duration: Duration,
        sink: &mut dyn SampleSink,
    ) -> Result<FrameResult, Error> {
        self.frame_id += 1;
        let send_start = Instant::now();

        let budget = self.controller.next_frame_budget();

        if let Some(scaler) = &mut self.scaler {
            frame = match scaler.scale(&frame) {
                Ok(scaled) => scaled,
                Err(e) => {
                    warn!("Error scaling frame {}: {}", self.frame_id, e);
                    return Ok(FrameResult::Skipped);
                }
            };
        }
        frame.pts = self.frame_id as i64;

        let result = if self.cfg.candidate_encoding {
            self.send_best_candidate(&frame, &budget, frame_duration, sink)
        } else {
            self.encode_and_send(&frame, &budget, frame_duration, sink)?
        };

        let bits = match result {
            FrameResult::Sent { bits } => bits,
            other => return Ok(other),
        };

        let send_end = Instant::now();

        // Pacing stretches the frame slot: sleeping the excess delays the
        // next tick naturally. The sleep stays cancellable.
        if let Directive::Pacing(pacing) = budget.directive {
            if pacing > frame_duration {
                self.cancel.wait_timeout(pacing - frame_duration);
            }
        }

        trace!(
            "Frame {}: sent {} bits, target {} bits, directive {}",
            self.frame_id,
            bits,
            budget.target_bits,
            budget.directive
        );

        let obs = FrameObservation {
            frame_id: self.frame_id,
            send_start,
            send_end,
            bits,
            loss: false,
        };
        self.controller.update(obs);

        if let Some(metadata) = &self.metadata {
            metadata.append(&FrameMetadata {
                frame_id: self.frame_id,
                send_start,
                send_end,
                bits,
            });
        }
        if let Some(trace) = &self.trace {
            trace.append(&TraceRecord {
                frame_id: self.frame_id,
                target_bits: budget.target_bits,
                actual_bits: bits,
                directive: budget.directive,
                send_start,
                send_end,
                snapshot: self.controller.snapshot(),
            });
        }

        Ok(FrameResult::Sent { bits })
    }

    /// CRF path: adapt the encoder to the budget, encode once, send every
    /// produced packet.
    fn encode_and_send(
        &mut self,
        frame: &RawFrame,
        budget: &FrameBudget,
        frame_duration: Duration,
        sink: &mut dyn SampleSink,
    ) -> Result<FrameResult, Error> {
        let encoder = self.adapter.encoder_for_budget(budget.target_bits)?;

        if let Err(e) = encoder.send_frame(frame) {
            warn!("Error sending frame to encoder: {}", e);
            return Ok(FrameResult::Skipped);
        }

        let mut bits = 0u64;
        loop {
            let packet = match encoder.receive_packet() {
                Ok(packet) => packet,
                Err(e) if e.is_drain_end() => break,
                Err(e) => {
                    warn!("Error receiving encoded packet: {}", e);
                    break;
                }
            };

            bits += packet.bits();
            if let Err(e) = sink.write_sample(&packet.data, frame_duration) {
                warn!("Error writing sample (connection may be closed): {}", e);
                return Ok(FrameResult::SinkClosed);
            }
        }

        Ok(FrameResult::Sent { bits })
    }

    /// Salsify path: encode the frame at the QP ladder, pick the best
    /// candidate under the budget, send its packets.
    fn send_best_candidate(
        &mut self,
        frame: &RawFrame,
        budget: &FrameBudget,
        frame_duration: Duration,
        sink: &mut dyn SampleSink,
    ) -> FrameResult {
        let base = self.adapter.base_settings().clone();
        let candidates = match encode_candidates(self.adapter.factory_mut(), &base, frame) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Error generating encoding candidates: {}", e);
                return FrameResult::Skipped;
            }
        };

        let selected = select_candidate(&candidates, budget.target_bits);
        debug!(
            "Frame {}: selected candidate qp={} bits={} (budget={})",
            self.frame_id, selected.qp, selected.bits, budget.target_bits
        );

        for packet in &selected.packets {
            if let Err(e) = sink.write_sample(&packet.data, frame_duration) {
                warn!("Error writing sample (connection may be closed): {}", e);
                return FrameResult::SinkClosed;
            }
        }

        FrameResult::Sent {
            bits: selected.bits,
        }
    }
}
