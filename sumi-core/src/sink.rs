//! Object storage the finished images are written to.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Key/value metadata stored alongside an object.
pub type Metadata = BTreeMap<String, String>;

/// Where an object lives in a content sink.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

pub trait ContentSink: Send + Sync {
    fn put(
        &self,
        bytes: Vec<u8>,
        location: &ObjectLocation,
        metadata: &Metadata,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Writes objects under a directory, one subdirectory per bucket. Metadata
/// lands in a `<key>.metadata.json` file next to the object.
#[derive(Debug, Clone)]
pub struct LocalSink {
    root: PathBuf,
}

/// Accepts `part` only as a plain relative path: no root, no drive prefix,
/// no `.` or `..` components.
fn relative_part<'a>(what: &str, part: &'a str) -> Result<&'a Path> {
    let path = Path::new(part);
    let plain = path
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if part.is_empty() || !plain {
        anyhow::bail!("object {what} {part:?} must be a relative path inside the sink root");
    }
    Ok(path)
}

impl LocalSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Maps a location to a file under the root. Keys that would resolve
    /// outside the root are rejected.
    pub fn object_path(&self, location: &ObjectLocation) -> Result<PathBuf> {
        let key = relative_part("key", &location.key)?;
        if location.bucket.is_empty() {
            Ok(self.root.join(key))
        } else {
            let bucket = relative_part("bucket", &location.bucket)?;
            Ok(self.root.join(bucket).join(key))
        }
    }

    async fn write_metadata(path: &Path, metadata: &Metadata) -> Result<()> {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(".metadata.json");
        let json = serde_json::to_vec_pretty(metadata)?;
        tokio::fs::write(PathBuf::from(sidecar), json).await?;
        Ok(())
    }
}

impl ContentSink for LocalSink {
    async fn put(&self, bytes: Vec<u8>, location: &ObjectLocation, metadata: &Metadata) -> Result<()> {
        let path = self.object_path(location)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), "wrote object");

        if !metadata.is_empty() {
            if let Err(e) = Self::write_metadata(&path, metadata).await {
                warn!(error = %e, path = %path.display(), "failed to write object metadata");
            }
        }
        Ok(())
    }
}

/// Uploads objects to S3, or to an S3-compatible store when an endpoint is
/// given. Credentials and region come from the standard AWS environment.
#[derive(Debug, Clone)]
pub struct S3Sink {
    client: aws_sdk_s3::Client,
}

impl S3Sink {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    /// Loads the shared AWS configuration. An `endpoint` switches to
    /// path-style addressing, which MinIO and most S3 clones expect.
    pub async fn connect(endpoint: Option<&str>) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        info!(endpoint = ?endpoint, "connected s3 client");
        Self::new(aws_sdk_s3::Client::from_conf(builder.build()))
    }
}

/// S3 user metadata travels as HTTP headers, so only printable ASCII survives.
fn user_metadata(metadata: &Metadata) -> HashMap<String, String> {
    metadata
        .iter()
        .filter(|(name, value)| {
            let printable = value.bytes().all(|b| b == b'\t' || (0x20..0x7f).contains(&b));
            if !printable {
                warn!(%name, "skipping metadata entry that is not printable ascii");
            }
            printable
        })
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect()
}

impl ContentSink for S3Sink {
    async fn put(&self, bytes: Vec<u8>, location: &ObjectLocation, metadata: &Metadata) -> Result<()> {
        if location.bucket.is_empty() || location.key.is_empty() {
            anyhow::bail!("s3 uploads need a bucket and a key, got {location:?}");
        }
        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .content_type("image/png")
            .set_metadata(Some(user_metadata(metadata)))
            .body(ByteStream::from(bytes))
            .send()
            .await
            .with_context(|| format!("uploading to s3://{location}"))?;
        debug!(%location, "uploaded object");
        Ok(())
    }
}

/// Which store a process writes to, decided from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkConfig {
    /// Directory store rooted at the given path.
    Local { root: PathBuf },
    /// S3, optionally at a custom endpoint.
    S3 { endpoint: Option<String> },
}

/// Sink selected at startup from configuration.
#[derive(Debug, Clone)]
pub enum SinkBackend {
    Local(LocalSink),
    S3(S3Sink),
}

impl SinkBackend {
    pub async fn connect(config: &SinkConfig) -> Self {
        match config {
            SinkConfig::Local { root } => Self::Local(LocalSink::new(root)),
            SinkConfig::S3 { endpoint } => Self::S3(S3Sink::connect(endpoint.as_deref()).await),
        }
    }
}

impl ContentSink for SinkBackend {
    async fn put(&self, bytes: Vec<u8>, location: &ObjectLocation, metadata: &Metadata) -> Result<()> {
        match self {
            Self::Local(sink) => sink.put(bytes, location, metadata).await,
            Self::S3(sink) => sink.put(bytes, location, metadata).await,
        }
    }
}
