use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::util::encode_png;
use crate::{
    BetaSchedule, ContentSink, GenerationError, GenerationMode, GenerationRequest,
    GenerationResult, Metadata, ObjectLocation, Result, SamplerKind, SamplerSpec,
};

/// Metadata key the reproducibility record is stored under.
pub const METADATA_KEY: &str = "json";

const TIMESTAMP_NAME_FORMAT: &str = "%Y_%m_%d-%I_%M_%S_%p.png";

#[derive(Serialize)]
struct MetadataRecord<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    seed: Option<u32>,
    num_inference_steps: u32,
    guidance_scale: f64,
    eta: f64,
    model: &'a str,
    tokenizer: &'a str,
    mode: GenerationMode,
    sampler: SamplerKind,
    beta_start: f64,
    beta_end: f64,
    beta_schedule: BetaSchedule,
    #[serde(skip_serializing_if = "Option::is_none")]
    strength: Option<f64>,
}

/// Builds the metadata attached to a persisted image: one JSON string
/// under [`METADATA_KEY`].
pub fn metadata_record(request: &GenerationRequest, sampler: &SamplerSpec) -> serde_json::Result<Metadata> {
    let record = MetadataRecord {
        prompt: &request.prompt,
        negative_prompt: &request.negative_prompt,
        seed: request.seed,
        num_inference_steps: request.num_inference_steps,
        guidance_scale: request.guidance_scale,
        eta: request.eta,
        model: &request.model,
        tokenizer: &request.tokenizer,
        mode: sampler.mode,
        sampler: sampler.kind,
        beta_start: sampler.beta_start,
        beta_end: sampler.beta_end,
        beta_schedule: sampler.beta_schedule,
        strength: sampler.mode.uses_init_image().then_some(request.strength),
    };
    let mut metadata = Metadata::new();
    metadata.insert(METADATA_KEY.to_string(), serde_json::to_string(&record)?);
    Ok(metadata)
}

/// Default object name, local time to the second.
pub fn timestamp_name() -> String {
    chrono::Local::now().format(TIMESTAMP_NAME_FORMAT).to_string()
}

/// Encodes results as PNG and writes them to a content sink.
pub struct OutputPersister<S> {
    sink: S,
    bucket: String,
    scratch_dir: Option<PathBuf>,
}

impl<S: ContentSink> OutputPersister<S> {
    pub fn new(sink: S, bucket: impl Into<String>) -> Self {
        Self {
            sink,
            bucket: bucket.into(),
            scratch_dir: None,
        }
    }

    /// Keep a copy of each encoded image in `dir` until its upload succeeds.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip_all, fields(bucket = %self.bucket))]
    pub async fn persist(&self, result: GenerationResult) -> Result<ObjectLocation> {
        let GenerationResult {
            image,
            request,
            sampler,
            ..
        } = result;
        let key = request.output_name.clone().unwrap_or_else(timestamp_name);

        let bytes = encode_png(&image).map_err(|e| GenerationError::persistence(&key, format!("{e:#}")))?;
        drop(image);

        let metadata = metadata_record(&request, &sampler).unwrap_or_else(|e| {
            warn!(error = %e, "failed to build metadata record, persisting without it");
            Metadata::new()
        });

        let local_copy = match &self.scratch_dir {
            Some(dir) => write_scratch_copy(dir, &key, &bytes).await,
            None => None,
        };

        let location = ObjectLocation {
            bucket: self.bucket.clone(),
            key,
        };
        if let Err(e) = self.sink.put(bytes, &location, &metadata).await {
            return Err(GenerationError::Persistence {
                key: location.key,
                reason: format!("{e:#}"),
                local_copy,
            });
        }

        if let Some(path) = local_copy {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(error = %e, path = %path.display(), "failed to remove scratch copy");
            }
        }
        info!(%location, "persisted output");
        Ok(location)
    }
}

async fn write_scratch_copy(dir: &Path, key: &str, bytes: &[u8]) -> Option<PathBuf> {
    let path = dir.join(key.replace('/', "_"));
    let written = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, bytes).await
    }
    .await;
    match written {
        Ok(()) => Some(path),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to write scratch copy");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use crate::{resolve, select_mode, Defaults, ImageRef, PartialRequest, SafetyOutcome};

    fn request(partial: PartialRequest) -> GenerationRequest {
        resolve(partial, &Defaults::EVENT).unwrap().with_seed(42)
    }

    #[test]
    fn timestamp_names_are_pngs_to_the_second() {
        let name = timestamp_name();
        assert!(name.ends_with("M.png"), "{name}");
        // 2024_01_31-09_05_07_PM.png
        assert_eq!(name.len(), "2024_01_31-09_05_07_PM.png".len());
    }

    #[test]
    fn metadata_record_is_json_under_single_key() {
        let req = request(PartialRequest {
            prompt: Some("hatsune miku".into()),
            num_inference_steps: Some(20),
            ..Default::default()
        });
        let metadata = metadata_record(&req, &select_mode(&req)).unwrap();
        assert_eq!(metadata.len(), 1);
        let record: serde_json::Value = serde_json::from_str(&metadata[METADATA_KEY]).unwrap();
        assert_eq!(record["prompt"], "hatsune miku");
        assert_eq!(record["seed"], 42);
        assert_eq!(record["num_inference_steps"], 20);
        assert_eq!(record["guidance_scale"], 7.5);
        assert_eq!(record["model"], "hakurei/waifu-diffusion");
        assert_eq!(record["mode"], "text_to_image");
        assert_eq!(record["sampler"], "lms_discrete");
        assert_eq!(record["beta_schedule"], "scaled_linear");
        assert!(record.get("strength").is_none());
    }

    #[test]
    fn image_conditioned_record_carries_strength() {
        let req = request(PartialRequest {
            init_image: Some(ImageRef::parse("init.png")),
            strength: Some(0.25),
            ..Default::default()
        });
        let metadata = metadata_record(&req, &select_mode(&req)).unwrap();
        let record: serde_json::Value = serde_json::from_str(&metadata[METADATA_KEY]).unwrap();
        assert_eq!(record["strength"], 0.25);
        assert_eq!(record["sampler"], "pndm");
    }

    struct FailingSink;

    impl ContentSink for FailingSink {
        async fn put(&self, _: Vec<u8>, _: &ObjectLocation, _: &Metadata) -> anyhow::Result<()> {
            anyhow::bail!("bucket unreachable")
        }
    }

    fn result(output_name: &str) -> GenerationResult {
        let req = request(PartialRequest {
            output_name: Some(output_name.into()),
            ..Default::default()
        });
        let sampler = select_mode(&req);
        GenerationResult {
            image: RgbImage::new(2, 2),
            request: req,
            sampler,
            safety: SafetyOutcome::Unchecked,
        }
    }

    #[tokio::test]
    async fn failed_upload_reports_scratch_copy() {
        let scratch = tempfile::tempdir().unwrap();
        let persister = OutputPersister::new(FailingSink, "renders").with_scratch_dir(scratch.path());
        let err = persister.persist(result("nested/out.png")).await.unwrap_err();
        match err {
            GenerationError::Persistence { key, reason, local_copy } => {
                assert_eq!(key, "nested/out.png");
                assert!(reason.contains("bucket unreachable"));
                let path = local_copy.unwrap();
                assert_eq!(path, scratch.path().join("nested_out.png"));
                let bytes = tokio::fs::read(&path).await.unwrap();
                assert_eq!(&bytes[..4], b"\x89PNG");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_upload_without_scratch_has_no_copy() {
        let persister = OutputPersister::new(FailingSink, "renders");
        let err = persister.persist(result("out.png")).await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::Persistence { local_copy: None, .. }
        ));
    }
}
