use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How betas are spaced across the training timesteps.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    #[default]
    ScaledLinear,
    SquaredcosCapV2,
}

serde_plain::derive_display_from_serialize!(BetaSchedule);
serde_plain::derive_fromstr_from_deserialize!(BetaSchedule);

/// Where an init image or mask comes from.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum ImageRef {
    Url(String),
    Path(PathBuf),
}

impl ImageRef {
    pub fn parse(reference: &str) -> Self {
        let lower = reference.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ImageRef::Url(reference.to_string())
        } else {
            ImageRef::Path(PathBuf::from(reference))
        }
    }
}

impl From<String> for ImageRef {
    fn from(reference: String) -> Self {
        ImageRef::parse(&reference)
    }
}

impl From<ImageRef> for String {
    fn from(reference: ImageRef) -> Self {
        reference.to_string()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Url(url) => f.write_str(url),
            ImageRef::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A request as it arrives from a caller: any field may be missing.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PartialRequest {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub model: Option<String>,
    pub tokenizer: Option<String>,
    pub init_image: Option<ImageRef>,
    pub mask: Option<ImageRef>,
    pub strength: Option<f64>,
    pub num_inference_steps: Option<u32>,
    pub guidance_scale: Option<f64>,
    pub eta: Option<f64>,
    pub seed: Option<u32>,
    pub beta_start: Option<f64>,
    pub beta_end: Option<f64>,
    pub beta_schedule: Option<BetaSchedule>,
    #[serde(alias = "safety")]
    pub safety_enabled: Option<bool>,
    #[serde(alias = "output", alias = "s3_object_name")]
    pub output_name: Option<String>,
}

/// The fully resolved configuration for one run.
///
/// Built only by [`crate::resolve`]; every field is populated. `seed` stays
/// `None` until the seed manager draws one, after which it is fixed for the
/// rest of the request.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub model: String,
    pub tokenizer: String,
    pub init_image: Option<ImageRef>,
    pub mask: Option<ImageRef>,
    pub strength: f64,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub eta: f64,
    pub seed: Option<u32>,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub safety_enabled: bool,
    pub output_name: Option<String>,
}

impl GenerationRequest {
    pub(crate) fn with_seed(self, seed: u32) -> Self {
        Self {
            seed: Some(seed),
            ..self
        }
    }
}
