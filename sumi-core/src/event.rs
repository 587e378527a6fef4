//! Serverless event surface: one JSON event in, one generated object out.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::sink::SinkConfig;
use crate::{
    ConfigError, ContentSink, Defaults, EngineLoader, ImageFetcher, ImageRef, ObjectLocation,
    OutputPersister, PartialRequest, Pipeline, PipelineOutput, Result, SinkBackend,
    ValidationError, DEFAULT_SAFETY_CHECKER,
};

/// An invocation event. Every field is optional and unknown keys are ignored.
pub type GenerationEvent = PartialRequest;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EventResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: EventBody,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EventBody {
    pub bucket: String,
    pub output: String,
}

impl EventResponse {
    pub fn ok(location: ObjectLocation) -> Self {
        Self {
            status_code: 200,
            body: EventBody {
                bucket: location.bucket,
                output: location.key,
            },
        }
    }
}

/// Process environment the event handler runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    pub bucket: String,
    pub sink: SinkConfig,
    pub scratch_dir: PathBuf,
    pub safety_checker: String,
}

impl HandlerConfig {
    pub const BUCKET: &'static str = "BUCKET";
    pub const SINK_ENDPOINT: &'static str = "SINK_ENDPOINT";
    pub const SINK_ROOT: &'static str = "SINK_ROOT";
    pub const SCRATCH_DIR: &'static str = "SCRATCH_DIR";
    pub const SAFETY_CHECKER: &'static str = "SAFETY_CHECKER";

    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Without `SINK_ROOT` objects go to S3, at `SINK_ENDPOINT` when set.
    pub fn from_lookup<F>(lookup: F) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let bucket = lookup(Self::BUCKET).ok_or(ConfigError::MissingVar(Self::BUCKET))?;
        if bucket.trim().is_empty() {
            return Err(ConfigError::InvalidVar {
                name: Self::BUCKET,
                reason: "must not be empty".to_string(),
            });
        }

        let sink_endpoint = var(Self::SINK_ENDPOINT);
        if let Some(endpoint) = &sink_endpoint {
            let lower = endpoint.to_ascii_lowercase();
            if !(lower.starts_with("http://") || lower.starts_with("https://")) {
                return Err(ConfigError::InvalidVar {
                    name: Self::SINK_ENDPOINT,
                    reason: format!("expected an http(s) URL, got {endpoint}"),
                });
            }
        }
        let sink = match (var(Self::SINK_ROOT), sink_endpoint) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidVar {
                    name: Self::SINK_ROOT,
                    reason: format!("cannot be combined with {}", Self::SINK_ENDPOINT),
                })
            }
            (Some(root), None) => SinkConfig::Local {
                root: PathBuf::from(root),
            },
            (None, endpoint) => SinkConfig::S3 { endpoint },
        };

        let scratch_dir = var(Self::SCRATCH_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let safety_checker =
            var(Self::SAFETY_CHECKER).unwrap_or_else(|| DEFAULT_SAFETY_CHECKER.to_string());

        Ok(Self {
            bucket,
            sink,
            scratch_dir,
            safety_checker,
        })
    }

    pub async fn persister(&self) -> OutputPersister<SinkBackend> {
        OutputPersister::new(SinkBackend::connect(&self.sink).await, &self.bucket)
            .with_scratch_dir(&self.scratch_dir)
    }
}

/// Events come from the network, so their images must be remote.
fn require_urls(event: &GenerationEvent) -> std::result::Result<(), ValidationError> {
    for (field, reference) in [("init_image", &event.init_image), ("mask", &event.mask)] {
        if let Some(ImageRef::Path(_)) = reference {
            return Err(ValidationError::NotAUrl { field });
        }
    }
    Ok(())
}

/// Runs events through the pipeline with the event defaults.
pub struct EventHandler<L, F, S> {
    pipeline: Pipeline<L, F, S>,
}

impl<L, F, S> EventHandler<L, F, S>
where
    L: EngineLoader,
    F: ImageFetcher,
    S: ContentSink,
{
    pub fn new(pipeline: Pipeline<L, F, S>) -> Self {
        Self { pipeline }
    }

    pub async fn handle(&self, event: GenerationEvent) -> Result<EventResponse> {
        let outcome = match require_urls(&event) {
            Ok(()) => self.pipeline.run(event, &Defaults::EVENT).await,
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(PipelineOutput {
                location, request, ..
            }) => {
                info!(%location, seed = ?request.seed, "event handled");
                Ok(EventResponse::ok(location))
            }
            Err(e) => {
                error!(error = %e, "event failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn bucket_is_required() {
        let err = HandlerConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("BUCKET")));

        let err = HandlerConfig::from_lookup(lookup(&[("BUCKET", " ")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "BUCKET", .. }));
    }

    #[test]
    fn optional_vars_fall_back() {
        let config = HandlerConfig::from_lookup(lookup(&[("BUCKET", "renders")])).unwrap();
        assert_eq!(config.bucket, "renders");
        assert_eq!(config.sink, SinkConfig::S3 { endpoint: None });
        assert_eq!(config.scratch_dir, std::env::temp_dir());
        assert_eq!(config.safety_checker, DEFAULT_SAFETY_CHECKER);
    }

    #[test]
    fn endpoint_points_s3_elsewhere() {
        let config = HandlerConfig::from_lookup(lookup(&[
            ("BUCKET", "renders"),
            ("SINK_ENDPOINT", "http://localhost:9000"),
            ("SCRATCH_DIR", "/var/tmp/sumi"),
        ]))
        .unwrap();
        assert_eq!(
            config.sink,
            SinkConfig::S3 {
                endpoint: Some("http://localhost:9000".into())
            }
        );
        assert_eq!(config.scratch_dir, PathBuf::from("/var/tmp/sumi"));
    }

    #[test]
    fn root_selects_directory_store() {
        let config = HandlerConfig::from_lookup(lookup(&[
            ("BUCKET", "renders"),
            ("SINK_ROOT", "./objects"),
            ("SAFETY_CHECKER", "acme/nsfw-checker"),
        ]))
        .unwrap();
        assert_eq!(
            config.sink,
            SinkConfig::Local {
                root: PathBuf::from("./objects")
            }
        );
        assert_eq!(config.safety_checker, "acme/nsfw-checker");

        let err = HandlerConfig::from_lookup(lookup(&[
            ("BUCKET", "renders"),
            ("SINK_ROOT", "./objects"),
            ("SINK_ENDPOINT", "http://localhost:9000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "SINK_ROOT", .. }));
    }

    #[test]
    fn endpoint_must_be_http() {
        let err = HandlerConfig::from_lookup(lookup(&[
            ("BUCKET", "renders"),
            ("SINK_ENDPOINT", "s3://renders"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "SINK_ENDPOINT", .. }));
    }

    #[test]
    fn events_may_only_reference_urls() {
        let remote: GenerationEvent = serde_json::from_str(
            r#"{"init_image": "https://example.com/a.png", "mask": "http://example.com/m.png"}"#,
        )
        .unwrap();
        assert!(require_urls(&remote).is_ok());

        let local: GenerationEvent = serde_json::from_str(r#"{"init_image": "/etc/passwd"}"#).unwrap();
        assert_eq!(
            require_urls(&local),
            Err(ValidationError::NotAUrl { field: "init_image" })
        );

        let local_mask: GenerationEvent = serde_json::from_str(
            r#"{"init_image": "https://example.com/a.png", "mask": "masks/m.png"}"#,
        )
        .unwrap();
        assert_eq!(
            require_urls(&local_mask),
            Err(ValidationError::NotAUrl { field: "mask" })
        );
    }

    #[test]
    fn response_uses_lambda_field_names() {
        let response = EventResponse::ok(ObjectLocation {
            bucket: "renders".into(),
            key: "out.png".into(),
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"statusCode": 200, "body": {"bucket": "renders", "output": "out.png"}})
        );
    }
}
