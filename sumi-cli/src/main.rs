use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hf_hub::api::tokio::Api;
use sumi_core::{
    BetaSchedule, Defaults, DeviceMap, Executor, HttpFetcher, ImageRef, LocalSink, OutputPersister,
    PartialRequest, Pipeline, SinkBackend, SinkConfig, StableDiffusionLoader,
    StableDiffusionSafetyChecker, DEFAULT_SAFETY_CHECKER,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Generate one image and store it locally or in a bucket.
///
/// Every generation flag is optional; unset flags take the CLI defaults.
#[derive(Parser, Debug)]
#[command(author, version, about = "Sumi one-shot image generation")]
struct Args {
    /// Text prompt
    #[arg(long)]
    prompt: Option<String>,

    /// What the image should steer away from
    #[arg(long)]
    negative_prompt: Option<String>,

    /// Hub identifier of a diffusers-layout model
    #[arg(long)]
    model: Option<String>,

    /// Hub identifier of the tokenizer
    #[arg(long)]
    tokenizer: Option<String>,

    /// Seed image, URL or local path
    #[arg(long)]
    init_image: Option<String>,

    /// Mask of the region to repaint on the seed image, URL or local path
    #[arg(long)]
    mask: Option<String>,

    /// How strongly the seed image is noised, in [0.0, 1.0]
    #[arg(long)]
    strength: Option<f64>,

    #[arg(long)]
    num_inference_steps: Option<u32>,

    #[arg(long)]
    guidance_scale: Option<f64>,

    #[arg(long)]
    eta: Option<f64>,

    /// Random seed for reproducible images; drawn at random when unset
    #[arg(long)]
    seed: Option<u32>,

    #[arg(long)]
    beta_start: Option<f64>,

    #[arg(long)]
    beta_end: Option<f64>,

    /// linear, scaled_linear or squaredcos_cap_v2
    #[arg(long)]
    beta_schedule: Option<BetaSchedule>,

    /// Suppress images the safety checker flags
    #[arg(long)]
    safety: Option<bool>,

    /// Output image name
    #[arg(long)]
    output: Option<String>,

    /// Upload to this bucket instead of writing to the working directory
    #[arg(long)]
    s3_bucket_name: Option<String>,

    /// Object name in the bucket; defaults to --output
    #[arg(long)]
    s3_object_name: Option<String>,

    /// S3-compatible endpoint used with --s3-bucket-name instead of AWS
    #[arg(long)]
    sink_endpoint: Option<String>,

    /// Write --s3-bucket-name objects under this directory instead of S3
    #[arg(long, conflicts_with = "sink_endpoint")]
    sink_root: Option<PathBuf>,

    /// Hub repository of the safety checker
    #[arg(long, default_value = DEFAULT_SAFETY_CHECKER)]
    safety_checker: String,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,
}

impl Args {
    fn request(&self) -> PartialRequest {
        let output_name = match &self.s3_bucket_name {
            Some(_) => self.s3_object_name.clone().or_else(|| self.output.clone()),
            None => self.output.clone(),
        };
        PartialRequest {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            model: self.model.clone(),
            tokenizer: self.tokenizer.clone(),
            init_image: self.init_image.as_deref().map(ImageRef::parse),
            mask: self.mask.as_deref().map(ImageRef::parse),
            strength: self.strength,
            num_inference_steps: self.num_inference_steps,
            guidance_scale: self.guidance_scale,
            eta: self.eta,
            seed: self.seed,
            beta_start: self.beta_start,
            beta_end: self.beta_end,
            beta_schedule: self.beta_schedule,
            safety_enabled: self.safety,
            output_name,
        }
    }

    fn sink_config(&self) -> SinkConfig {
        match &self.sink_root {
            Some(root) => SinkConfig::Local { root: root.clone() },
            None => SinkConfig::S3 {
                endpoint: self.sink_endpoint.clone(),
            },
        }
    }

    async fn persister(&self) -> OutputPersister<SinkBackend> {
        match &self.s3_bucket_name {
            Some(bucket) => {
                let sink = SinkBackend::connect(&self.sink_config()).await;
                OutputPersister::new(sink, bucket).with_scratch_dir(std::env::temp_dir())
            }
            None => OutputPersister::new(SinkBackend::Local(LocalSink::new(".")), ""),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let api = Api::new()?;
    let device_map = DeviceMap::from_cpu_flag(args.cpu);
    let checker = StableDiffusionSafetyChecker::load(&api, &args.safety_checker, device_map)
        .await
        .context("failed to load safety checker")?;
    let loader = StableDiffusionLoader::new(api, device_map);
    let executor = Executor::new(loader, HttpFetcher::default()).with_safety_checker(Arc::new(checker));
    let pipeline = Pipeline::new(executor, args.persister().await);

    match pipeline.run(args.request(), &Defaults::CLI).await {
        Ok(output) => {
            info!(
                location = %output.location,
                seed = ?output.request.seed,
                mode = %output.mode,
                "generation finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "generation failed");
            Err(e.into())
        }
    }
}
