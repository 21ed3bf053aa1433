//! Multi-candidate encoding for the Salsify path.
//!
//! The same frame is encoded at a fixed QP ladder; the send loop then picks
//! the highest-quality candidate that fits the controller's budget. Each
//! candidate keeps its packet (NAL unit) boundaries so transmission can stay
//! packet-per-sample.

use super::{CodecError, EncodedPacket, EncoderFactory, EncoderSettings, RawFrame, VideoEncoder};

/// QP levels from high quality to low quality.
pub const QP_LADDER: [i32; 4] = [20, 25, 30, 35];

/// One encoding of a frame at a fixed QP.
#[derive(Debug, Clone)]
pub struct EncodedCandidate {
    pub qp: i32,
    pub bits: u64,
    pub packets: Vec<EncodedPacket>,
}

/// Encode `frame` once per ladder rung. Rungs that fail to encode are
/// skipped with a warning; an empty result is a codec failure.
pub fn encode_candidates(
    factory: &mut dyn EncoderFactory,
    base: &EncoderSettings,
    frame: &RawFrame,
) -> Result<Vec<EncodedCandidate>, CodecError> {
    let mut candidates = Vec::with_capacity(QP_LADDER.len());

    for qp in QP_LADDER {
        match encode_at_qp(factory, base, frame, qp) {
            Ok(candidate) => candidates.push(candidate),
            Err(e) => warn!("Candidate encode at qp {} failed: {}", qp, e),
        }
    }

    if candidates.is_empty() {
        return Err(CodecError::Failed(
            "no encoding candidate could be produced".into(),
        ));
    }
    Ok(candidates)
}

fn encode_at_qp(
    factory: &mut dyn EncoderFactory,
    base: &EncoderSettings,
    frame: &RawFrame,
    qp: i32,
) -> Result<EncodedCandidate, CodecError> {
    let settings = base.clone().with_qp(qp);
    let mut encoder: Box<dyn VideoEncoder> = factory.open(&settings)?;

    encoder.send_frame(frame)?;

    let mut packets = Vec::new();
    let mut bits = 0u64;
    loop {
        match encoder.receive_packet() {
            Ok(packet) => {
                bits += packet.bits();
                packets.push(packet);
            }
            Err(e) if e.is_drain_end() => break,
            Err(e) => return Err(e),
        }
    }

    Ok(EncodedCandidate { qp, bits, packets })
}

/// The lowest-QP (highest-quality) candidate whose size fits the budget.
/// When every candidate exceeds the budget, the last rung (smallest) is
/// taken and the violation is logged.
pub fn select_candidate(candidates: &[EncodedCandidate], budget_bits: u64) -> &EncodedCandidate {
    let mut selected: Option<&EncodedCandidate> = None;
    for candidate in candidates {
        if candidate.bits <= budget_bits {
            match selected {
                Some(cur) if cur.qp <= candidate.qp => {}
                _ => selected = Some(candidate),
            }
        }
    }

    selected.unwrap_or_else(|| {
        let last = candidates.last().expect("candidate list is non-empty");
        debug!(
            "All candidates exceed budget {} bits, selecting smallest (qp={}, bits={})",
            budget_bits, last.qp, last.bits
        );
        last
    })
}
