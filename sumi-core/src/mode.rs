use serde::Serialize;
use tracing::info;

use crate::{BetaSchedule, GenerationRequest};

/// Which inference mode a request runs in. Computed once per request.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    TextToImage,
    ImageToImage,
    Inpaint,
}

serde_plain::derive_display_from_serialize!(GenerationMode);

impl GenerationMode {
    pub fn uses_init_image(self) -> bool {
        !matches!(self, GenerationMode::TextToImage)
    }
}

/// Noise schedule family.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    /// Discrete sigma schedule with linear multistep updates.
    LmsDiscrete,
    /// Pseudo numerical method schedule.
    Pndm,
}

serde_plain::derive_display_from_serialize!(SamplerKind);

/// The sampler a request will be run with, chosen from which inputs it has.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct SamplerSpec {
    pub mode: GenerationMode,
    pub kind: SamplerKind,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
}

/// Pick the mode and sampler for `request`.
///
/// Without an init image the request is text-to-image on the discrete LMS
/// schedule. With one it runs on step-skipping PNDM; a mask narrows the mode
/// to inpainting but leaves the sampler as is.
pub fn select_mode(request: &GenerationRequest) -> SamplerSpec {
    let mode = match (&request.init_image, &request.mask) {
        (None, _) => GenerationMode::TextToImage,
        (Some(_), None) => GenerationMode::ImageToImage,
        (Some(_), Some(_)) => GenerationMode::Inpaint,
    };

    let kind = match mode {
        GenerationMode::TextToImage => SamplerKind::LmsDiscrete,
        GenerationMode::ImageToImage | GenerationMode::Inpaint => SamplerKind::Pndm,
    };

    let spec = SamplerSpec {
        mode,
        kind,
        beta_start: request.beta_start,
        beta_end: request.beta_end,
        beta_schedule: request.beta_schedule,
    };
    info!(%mode, sampler = %kind, "selected generation mode");
    spec
}
