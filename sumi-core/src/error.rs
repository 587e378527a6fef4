use std::path::PathBuf;

use thiserror::Error;

/// A request field holds a value the pipeline cannot run with.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// `strength` must lie in `[0.0, 1.0]`.
    #[error("strength must be within [0.0, 1.0], got {0}")]
    StrengthOutOfRange(f64),

    /// A mask only makes sense on top of an init image.
    #[error("mask was supplied without an init_image")]
    MaskWithoutInitImage,

    /// At least one denoising step is required.
    #[error("num_inference_steps must be at least 1")]
    ZeroInferenceSteps,

    /// More steps than the schedule has training timesteps.
    #[error("num_inference_steps must be at most {max}, got {got}")]
    TooManySteps { got: u32, max: u32 },

    /// NaN or infinite float in a numeric field.
    #[error("{field} must be a finite number, got {value}")]
    NonFinite { field: &'static str, value: f64 },

    /// `beta_start` must be positive and below `beta_end`.
    #[error("beta range is invalid: start {start}, end {end}")]
    BetaRange { start: f64, end: f64 },

    /// Network callers may only point at images by http(s) URL.
    #[error("{field} must be an http(s) URL")]
    NotAUrl { field: &'static str },
}

/// Errors returned by the generation pipeline.
///
/// Every variant is fatal for the request it came from. Nothing in the
/// pipeline retries.
#[derive(Error, Debug)]
pub enum GenerationError {
    /// The request was rejected before any engine work began.
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// An init image or mask could not be fetched or decoded.
    #[error("failed to load input {reference}: {reason}")]
    InputFetch { reference: String, reason: String },

    /// The inference engine failed to load or to run.
    #[error("inference engine failed: {0:#}")]
    Engine(anyhow::Error),

    /// The encoded image could not be written to the content sink.
    #[error("failed to persist {key}: {reason}{}", local_copy_note(.local_copy))]
    Persistence {
        key: String,
        reason: String,
        local_copy: Option<PathBuf>,
    },
}

fn local_copy_note(local_copy: &Option<PathBuf>) -> String {
    match local_copy {
        Some(path) => format!(" (local copy kept at {})", path.display()),
        None => String::new(),
    }
}

impl GenerationError {
    pub(crate) fn input_fetch(reference: impl ToString, reason: impl ToString) -> Self {
        Self::InputFetch {
            reference: reference.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn persistence(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Persistence {
            key: key.into(),
            reason: reason.to_string(),
            local_copy: None,
        }
    }
}

/// Missing or malformed environment configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),

    #[error("environment variable {name} is invalid: {reason}")]
    InvalidVar { name: &'static str, reason: String },
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, GenerationError>;
