//! Budget-driven encoder adaptation.
//!
//! Maps a bit budget to a CRF quality target and rebuilds the encoder when
//! the target has moved far enough. Rebuilding tears down the codec context,
//! so a hysteresis band keeps small budget fluctuations from thrashing it.

use super::{CodecError, EncoderFactory, EncoderSettings, VideoEncoder};

pub const CRF_MIN: i32 = 18;
pub const CRF_MAX: i32 = 32;

/// Budget at or below which the lowest quality (highest CRF) is used.
const BUDGET_LOW_BITS: f64 = 50_000.0;
/// Budget at or above which the highest quality (lowest CRF) is used.
const BUDGET_HIGH_BITS: f64 = 500_000.0;

/// Rebuild only when the CRF moves by more than this.
const CRF_HYSTERESIS: i32 = 2;

/// Linear interpolation from CRF 32 at ≤ 50 kbit to CRF 18 at ≥ 500 kbit.
pub fn crf_for_budget(budget_bits: u64) -> i32 {
    let span = (CRF_MAX - CRF_MIN) as f64;
    let t = (budget_bits as f64 - BUDGET_LOW_BITS) / (BUDGET_HIGH_BITS - BUDGET_LOW_BITS);
    let crf = CRF_MAX as f64 - t * span;

    (crf.round() as i32).clamp(CRF_MIN, CRF_MAX)
}

/// Owns the current encoder instance and replaces it when the budget-derived
/// CRF leaves the hysteresis band around the current one.
pub struct EncoderAdapter {
    factory: Box<dyn EncoderFactory>,
    base: EncoderSettings,
    current: Option<Current>,
    rebuilds: u64,
}

struct Current {
    crf: i32,
    encoder: Box<dyn VideoEncoder>,
}

impl EncoderAdapter {
    /// `base` carries the fixed options (size, fps, ultrafast/zerolatency);
    /// only the CRF varies at runtime.
    pub fn new(factory: Box<dyn EncoderFactory>, base: EncoderSettings) -> Self {
        EncoderAdapter {
            factory,
            base,
            current: None,
            rebuilds: 0,
        }
    }

    /// The encoder to use for a frame with this budget, rebuilt if needed.
    pub fn encoder_for_budget(
        &mut self,
        budget_bits: u64,
    ) -> Result<&mut dyn VideoEncoder, CodecError> {
        let target = crf_for_budget(budget_bits);

        let needs_rebuild = match &self.current {
            None => true,
            Some(cur) => (target - cur.crf).abs() > CRF_HYSTERESIS,
        };

        if needs_rebuild {
            let settings = EncoderSettings {
                crf: target,
                ..self.base.clone()
            };
            let encoder = self.factory.open(&settings)?;
            debug!(
                "Encoder rebuilt for budget {} bits: crf {} -> {}",
                budget_bits,
                self.current.as_ref().map(|c| c.crf).unwrap_or(target),
                target
            );
            self.current = Some(Current {
                crf: target,
                encoder,
            });
            self.rebuilds += 1;
        }

        Ok(&mut *self.current.as_mut().expect("encoder present").encoder)
    }

    pub fn current_crf(&self) -> Option<i32> {
        self.current.as_ref().map(|c| c.crf)
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    pub fn base_settings(&self) -> &EncoderSettings {
        &self.base
    }

    pub(crate) fn factory_mut(&mut self) -> &mut dyn EncoderFactory {
        &mut *self.factory
    }
}
