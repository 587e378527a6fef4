use tracing::{debug, instrument};

use crate::{
    resolve, resolve_seed, select_mode, ContentSink, Defaults, EngineLoader, Executor,
    GenerationMode, GenerationRequest, ImageFetcher, ObjectLocation, OutputPersister,
    PartialRequest, Result, SafetyOutcome,
};

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub location: ObjectLocation,
    /// The request as executed, seed included.
    pub request: GenerationRequest,
    pub mode: GenerationMode,
    pub safety: SafetyOutcome,
}

/// Resolve, select, seed, execute and persist, in that order, for one
/// request at a time.
pub struct Pipeline<L, F, S> {
    executor: Executor<L, F>,
    persister: OutputPersister<S>,
}

impl<L, F, S> Pipeline<L, F, S>
where
    L: EngineLoader,
    F: ImageFetcher,
    S: ContentSink,
{
    pub fn new(executor: Executor<L, F>, persister: OutputPersister<S>) -> Self {
        Self {
            executor,
            persister,
        }
    }

    pub fn persister(&self) -> &OutputPersister<S> {
        &self.persister
    }

    #[instrument(skip_all)]
    pub async fn run(&self, partial: PartialRequest, defaults: &Defaults) -> Result<PipelineOutput> {
        let request = resolve(partial, defaults)?;
        debug!(?request, "resolved request");

        let sampler = select_mode(&request);
        let (request, rng) = resolve_seed(request);

        let result = self.executor.execute(request, sampler, rng).await?;
        let request = result.request.clone();
        let safety = result.safety;

        let location = self.persister.persist(result).await?;
        Ok(PipelineOutput {
            location,
            request,
            mode: sampler.mode,
            safety,
        })
    }
}
