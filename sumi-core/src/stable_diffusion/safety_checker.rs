use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{linear_no_bias, Linear, VarBuilder};
use candle_transformers::models::clip::text_model::Activation;
use candle_transformers::models::clip::vision_model::{ClipVisionConfig, ClipVisionTransformer};
use hf_hub::api::tokio::Api;
use image::imageops::FilterType;
use image::RgbImage;
use tracing::{debug, info};

use crate::{select_best_device, DeviceMap, SafetyChecker, SafetyVerdict};

/// Hub repository holding the Stable Diffusion NSFW classifier.
pub const DEFAULT_SAFETY_CHECKER: &str = "CompVis/stable-diffusion-safety-checker";

const CLIP_IMAGE_SIZE: usize = 224;
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_1];
const NUM_CONCEPTS: usize = 17;
const NUM_SPECIAL_CARE: usize = 3;
const SPECIAL_CARE_ADJUSTMENT: f32 = 0.01;

// CLIP ViT-L/14 at 224px.
fn vision_config() -> ClipVisionConfig {
    ClipVisionConfig {
        embed_dim: 1024,
        activation: Activation::QuickGelu,
        intermediate_size: 4096,
        num_hidden_layers: 24,
        num_attention_heads: 16,
        projection_dim: 768,
        num_channels: 3,
        image_size: CLIP_IMAGE_SIZE,
        patch_size: 14,
    }
}

/// Concept embeddings with one cosine threshold each. A special-care hit
/// lowers every concept threshold by [`SPECIAL_CARE_ADJUSTMENT`].
struct ConceptBank {
    concepts: Tensor,
    concept_thresholds: Tensor,
    special_care: Tensor,
    special_care_thresholds: Tensor,
}

impl ConceptBank {
    fn load(vb: &VarBuilder, dim: usize) -> candle_core::Result<Self> {
        Ok(Self {
            concepts: vb.get((NUM_CONCEPTS, dim), "concept_embeds")?,
            concept_thresholds: vb.get(NUM_CONCEPTS, "concept_embeds_weights")?,
            special_care: vb.get((NUM_SPECIAL_CARE, dim), "special_care_embeds")?,
            special_care_thresholds: vb.get(NUM_SPECIAL_CARE, "special_care_embeds_weights")?,
        })
    }

    /// Indices of the concepts a (1, dim) image embedding comes too close to.
    fn flagged(&self, image_embeds: &Tensor) -> candle_core::Result<Vec<usize>> {
        let image_embeds = normalize(image_embeds)?;
        let special = scores(&image_embeds, &self.special_care, &self.special_care_thresholds)?;
        let adjustment = if special.iter().any(|&s| round3(s) > 0.) {
            SPECIAL_CARE_ADJUSTMENT
        } else {
            0.
        };
        let concepts = scores(&image_embeds, &self.concepts, &self.concept_thresholds)?;
        Ok(concepts
            .iter()
            .enumerate()
            .filter(|&(_, &score)| round3(score + adjustment) > 0.)
            .map(|(index, _)| index)
            .collect())
    }
}

fn round3(x: f32) -> f32 {
    (x * 1000.).round() / 1000.
}

fn normalize(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.broadcast_div(&xs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?)
}

/// Cosine similarity to each row of `embeds`, minus that row's threshold.
fn scores(image_embeds: &Tensor, embeds: &Tensor, thresholds: &Tensor) -> candle_core::Result<Vec<f32>> {
    let embeds = normalize(embeds)?.t()?.contiguous()?;
    let cosine = image_embeds.matmul(&embeds)?.squeeze(0)?;
    (cosine - thresholds)?.to_dtype(DType::F32)?.to_vec1::<f32>()
}

/// Resizes to CLIP's input size and normalizes with CLIP's channel
/// statistics. Generated images are square, so no crop is needed.
fn clip_pixels(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let size = CLIP_IMAGE_SIZE as u32;
    let image = image::imageops::resize(image, size, size, FilterType::CatmullRom);
    let mean = Tensor::new(&CLIP_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&CLIP_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    let pixels = Tensor::from_vec(image.into_raw(), (CLIP_IMAGE_SIZE, CLIP_IMAGE_SIZE, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?
        .unsqueeze(0)?;
    Ok(pixels.to_device(device)?)
}

/// The Stable Diffusion safety checker: a CLIP vision tower whose projected
/// image embedding is compared against fixed concept embeddings.
pub struct StableDiffusionSafetyChecker {
    device: Device,
    vision: ClipVisionTransformer,
    projection: Linear,
    bank: ConceptBank,
}

impl StableDiffusionSafetyChecker {
    pub async fn load(api: &Api, repo: &str, device_map: DeviceMap) -> Result<Self> {
        info!(%repo, "loading safety checker");
        let device = select_best_device(device_map).context("failed to set up device")?;
        let weights = api
            .model(repo.to_string())
            .get("model.safetensors")
            .await
            .context("failed to get safety checker weights")?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)
                .context("failed to build safety checker var builder")?
        };

        let config = vision_config();
        let vision = ClipVisionTransformer::new(vb.pp("vision_model").pp("vision_model"), &config)
            .context("failed to load safety checker vision tower")?;
        let projection = linear_no_bias(config.embed_dim, config.projection_dim, vb.pp("visual_projection"))
            .context("failed to load safety checker projection")?;
        let bank = ConceptBank::load(&vb, config.projection_dim)
            .context("failed to load safety checker concepts")?;

        Ok(Self {
            device,
            vision,
            projection,
            bank,
        })
    }
}

impl SafetyChecker for StableDiffusionSafetyChecker {
    fn check(&self, image: &RgbImage) -> Result<SafetyVerdict> {
        let pixels = clip_pixels(image, &self.device)?;
        let pooled = self.vision.forward(&pixels)?;
        let image_embeds = self.projection.forward(&pooled)?;
        let flagged = self.bank.flagged(&image_embeds)?;
        debug!(?flagged, "safety concept scores");

        if flagged.is_empty() {
            Ok(SafetyVerdict::Safe)
        } else {
            Ok(SafetyVerdict::Flagged {
                reason: format!("matched restricted concepts {flagged:?}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(rows: &[[f32; 2]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 2), &Device::Cpu).unwrap()
    }

    fn bank(
        concepts: &[[f32; 2]],
        concept_thresholds: &[f32],
        special_care: &[[f32; 2]],
        special_care_thresholds: &[f32],
    ) -> ConceptBank {
        ConceptBank {
            concepts: rows(concepts),
            concept_thresholds: Tensor::new(concept_thresholds, &Device::Cpu).unwrap(),
            special_care: rows(special_care),
            special_care_thresholds: Tensor::new(special_care_thresholds, &Device::Cpu).unwrap(),
        }
    }

    fn embed(x: f32, y: f32) -> Tensor {
        Tensor::new(&[[x, y]], &Device::Cpu).unwrap()
    }

    #[test]
    fn flags_concepts_above_their_threshold() -> Result<()> {
        let bank = bank(&[[1., 0.], [0., 1.]], &[0.9, 0.9], &[[1., 1.]], &[0.99]);
        // Scale does not matter, only direction.
        assert_eq!(bank.flagged(&embed(20., 1.))?, vec![0]);
        assert_eq!(bank.flagged(&embed(1., 1.))?, Vec::<usize>::new());
        Ok(())
    }

    #[test]
    fn special_care_hit_lowers_concept_thresholds() -> Result<()> {
        // Concept 1 misses its threshold by 0.005.
        let relaxed = bank(&[[1., 0.], [0., 1.]], &[0.9, 1.005], &[[0., 1.]], &[1.5]);
        assert!(relaxed.flagged(&embed(0., 1.))?.is_empty());

        let strict = bank(&[[1., 0.], [0., 1.]], &[0.9, 1.005], &[[0., 1.]], &[0.5]);
        assert_eq!(strict.flagged(&embed(0., 1.))?, vec![1]);
        Ok(())
    }

    #[test]
    fn clip_pixels_are_resized_and_normalized() -> Result<()> {
        let white = RgbImage::from_pixel(512, 512, image::Rgb([255, 255, 255]));
        let pixels = clip_pixels(&white, &Device::Cpu)?;
        assert_eq!(pixels.dims(), &[1, 3, CLIP_IMAGE_SIZE, CLIP_IMAGE_SIZE]);

        let red = pixels.squeeze(0)?.get(0)?.flatten_all()?.to_vec1::<f32>()?;
        let expected = (1. - CLIP_MEAN[0]) / CLIP_STD[0];
        assert!(red.iter().all(|v| (v - expected).abs() < 1e-4));
        Ok(())
    }

    #[test]
    fn vision_tower_matches_vit_large() {
        let config = vision_config();
        assert_eq!(config.image_size / config.patch_size, 16);
        assert_eq!(config.projection_dim, 768);
    }
}
