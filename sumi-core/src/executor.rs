use std::sync::Arc;

use image::RgbImage;
use tracing::{debug, instrument};

use crate::fetch::{fetch_mask, fetch_rgb};
use crate::{
    build_scheduler, EngineGuard, EngineInputs, EngineLoader, EngineSpec, GenerationError,
    GenerationRequest, ImageFetcher, InferenceEngine, RandomSource, Result, SafetyChecker,
    SafetyOutcome, SafetyStage, SamplerSpec,
};

/// A generated image together with everything needed to reproduce it.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: RgbImage,
    pub request: GenerationRequest,
    pub sampler: SamplerSpec,
    pub safety: SafetyOutcome,
}

/// Runs a resolved request through a freshly loaded engine.
pub struct Executor<L, F> {
    loader: L,
    fetcher: F,
    safety_checker: Option<Arc<dyn SafetyChecker>>,
}

impl<L, F> Executor<L, F>
where
    L: EngineLoader,
    F: ImageFetcher,
{
    pub fn new(loader: L, fetcher: F) -> Self {
        Self {
            loader,
            fetcher,
            safety_checker: None,
        }
    }

    pub fn with_safety_checker(mut self, checker: Arc<dyn SafetyChecker>) -> Self {
        self.safety_checker = Some(checker);
        self
    }

    /// Decodes the request's inputs, loads the engine, invokes it exactly
    /// once and releases it again, whether or not generation succeeded.
    #[instrument(skip_all, fields(mode = %sampler.mode, seed = rng.seed()))]
    pub async fn execute(
        &self,
        request: GenerationRequest,
        sampler: SamplerSpec,
        mut rng: RandomSource,
    ) -> Result<GenerationResult> {
        let init_image = match &request.init_image {
            Some(reference) => Some(fetch_rgb(&self.fetcher, reference).await?),
            None => None,
        };
        let mask = match &request.mask {
            Some(reference) => Some(fetch_mask(&self.fetcher, reference).await?),
            None => None,
        };

        let steps = request.num_inference_steps as usize;
        let mut scheduler = build_scheduler(&sampler, steps);
        debug!(timesteps = scheduler.timesteps().len(), "built scheduler");

        let spec = EngineSpec {
            model: request.model.clone(),
            tokenizer: request.tokenizer.clone(),
            sampler,
        };

        let (image, safety) = {
            let mut engine = EngineGuard::acquire(&self.loader, &spec)
                .await
                .map_err(GenerationError::Engine)?;
            let inputs = EngineInputs {
                prompt: &request.prompt,
                negative_prompt: &request.negative_prompt,
                mode: sampler.mode,
                init_image: init_image.as_ref(),
                mask: mask.as_ref(),
                strength: request.strength,
                num_inference_steps: steps,
                guidance_scale: request.guidance_scale,
                eta: request.eta,
            };
            let image = engine
                .generate(&inputs, scheduler.as_mut(), &mut rng)
                .map_err(GenerationError::Engine)?;
            SafetyStage::new(self.safety_checker.clone(), request.safety_enabled)
                .apply(image)
                .map_err(GenerationError::Engine)?
        };

        Ok(GenerationResult {
            image,
            request,
            sampler,
            safety,
        })
    }
}

