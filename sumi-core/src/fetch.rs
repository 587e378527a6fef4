use std::future::Future;

use image::{GrayImage, RgbImage};
use tracing::debug;

use crate::{GenerationError, ImageRef, Result};

/// Retrieves the raw bytes behind an [`ImageRef`].
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, reference: &ImageRef) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Fetches URLs over HTTP and reads paths from the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &str) -> std::result::Result<Vec<u8>, reqwest::Error> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, reference: &ImageRef) -> Result<Vec<u8>> {
        debug!(%reference, "fetching input image");
        match reference {
            ImageRef::Url(url) => self
                .get(url)
                .await
                .map_err(|e| GenerationError::input_fetch(reference, e)),
            ImageRef::Path(path) => tokio::fs::read(path)
                .await
                .map_err(|e| GenerationError::input_fetch(reference, e)),
        }
    }
}

/// Fetches and decodes an init image.
pub async fn fetch_rgb<F: ImageFetcher>(fetcher: &F, reference: &ImageRef) -> Result<RgbImage> {
    let bytes = fetcher.fetch(reference).await?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| GenerationError::input_fetch(reference, e))?;
    Ok(img.to_rgb8())
}

/// Fetches and decodes a mask as single-channel luminance.
pub async fn fetch_mask<F: ImageFetcher>(fetcher: &F, reference: &ImageRef) -> Result<GrayImage> {
    let bytes = fetcher.fetch(reference).await?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| GenerationError::input_fetch(reference, e))?;
    Ok(img.to_luma8())
}
