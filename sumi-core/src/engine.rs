use std::future::Future;
use std::ops::{Deref, DerefMut};

use anyhow::Result;
use image::{GrayImage, RgbImage};
use tracing::info;

use crate::{GenerationMode, RandomSource, SamplerSpec, Scheduler};

/// Everything one engine invocation needs, already decoded.
#[derive(Debug, Clone, Copy)]
pub struct EngineInputs<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub mode: GenerationMode,
    pub init_image: Option<&'a RgbImage>,
    pub mask: Option<&'a GrayImage>,
    pub strength: f64,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub eta: f64,
}

/// A loaded diffusion model. Runs one generation per call and takes all of
/// its randomness from `rng`.
pub trait InferenceEngine: Send {
    fn generate(
        &mut self,
        inputs: &EngineInputs<'_>,
        scheduler: &mut dyn Scheduler,
        rng: &mut RandomSource,
    ) -> Result<RgbImage>;
}

/// What an engine is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSpec {
    pub model: String,
    pub tokenizer: String,
    pub sampler: SamplerSpec,
}

/// Builds an engine for one request. Implementations are shared across
/// requests, engines never are.
pub trait EngineLoader: Send + Sync {
    type Engine: InferenceEngine;

    fn load(&self, spec: &EngineSpec) -> impl Future<Output = Result<Self::Engine>> + Send;
}

/// Owns an engine for the duration of one request. Dropping the guard frees
/// the engine's weights and device state, on every exit path.
pub struct EngineGuard<E: InferenceEngine> {
    engine: E,
    model: String,
}

impl<E: InferenceEngine> EngineGuard<E> {
    pub async fn acquire<L>(loader: &L, spec: &EngineSpec) -> Result<Self>
    where
        L: EngineLoader<Engine = E>,
    {
        let engine = loader.load(spec).await?;
        info!(model = %spec.model, tokenizer = %spec.tokenizer, "acquired inference engine");
        Ok(Self {
            engine,
            model: spec.model.clone(),
        })
    }
}

impl<E: InferenceEngine> Deref for EngineGuard<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.engine
    }
}

impl<E: InferenceEngine> DerefMut for EngineGuard<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}

impl<E: InferenceEngine> Drop for EngineGuard<E> {
    fn drop(&mut self) {
        // The engine field itself is dropped right after this returns.
        info!(model = %self.model, "releasing inference engine");
    }
}
