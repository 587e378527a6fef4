mod defaults;
pub mod device_map;
pub mod engine;
mod error;
pub mod event;
mod executor;
pub mod fetch;
pub mod loader_factory;
mod mode;
pub mod persist;
mod pipeline;
mod request;
mod resolver;
mod safety;
pub mod scheduler;
mod seed;
pub mod sink;
mod stable_diffusion;
mod util;

pub use defaults::Defaults;
pub use device_map::*;
pub use engine::*;
pub use error::{ConfigError, GenerationError, Result, ValidationError};
pub use event::{EventHandler, EventResponse, GenerationEvent, HandlerConfig};
pub use executor::{Executor, GenerationResult};
pub use fetch::{HttpFetcher, ImageFetcher};
pub use mode::{select_mode, GenerationMode, SamplerKind, SamplerSpec};
pub use persist::OutputPersister;
pub use pipeline::{Pipeline, PipelineOutput};
pub use request::{BetaSchedule, GenerationRequest, ImageRef, PartialRequest};
pub use resolver::resolve;
pub use safety::{SafetyChecker, SafetyOutcome, SafetyStage, SafetyVerdict};
pub use scheduler::{build_scheduler, Scheduler};
pub use seed::{resolve_seed, RandomSource};
pub use sink::{ContentSink, LocalSink, Metadata, ObjectLocation, S3Sink, SinkBackend, SinkConfig};
pub use stable_diffusion::{
    StableDiffusionEngine, StableDiffusionLoader, StableDiffusionSafetyChecker,
    DEFAULT_SAFETY_CHECKER,
};
pub use util::encode_png;
pub(crate) use util::{select_best_device, tensor_to_image};
