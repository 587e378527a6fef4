use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::{GrayImage, RgbImage};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

mod safety_checker;

pub use safety_checker::{StableDiffusionSafetyChecker, DEFAULT_SAFETY_CHECKER};

use crate::loader_factory::ModelVariant;
use crate::util::{image_to_tensor, mask_to_keep_tensor};
use crate::{
    select_best_device, tensor_to_image, DeviceMap, EngineInputs, EngineLoader, EngineSpec,
    InferenceEngine, RandomSource, Scheduler,
};

const VAE_SCALE: f64 = 0.18215;
const LATENT_CHANNELS: usize = 4;

pub struct StableDiffusionEngine {
    device: Device,
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    clip: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

/// Original latents and noise re-applied outside the mask after every step.
struct InpaintBlend {
    init_latents: Tensor,
    noise: Tensor,
    keep: Tensor,
    repaint: Tensor,
}

impl InpaintBlend {
    fn apply(
        &self,
        latents: &Tensor,
        scheduler: &dyn Scheduler,
        next_step: usize,
    ) -> candle_core::Result<Tensor> {
        let original = if next_step < scheduler.timesteps().len() {
            scheduler.add_noise(&self.init_latents, &self.noise, next_step)?
        } else {
            self.init_latents.clone()
        };
        original.broadcast_mul(&self.keep)? + latents.broadcast_mul(&self.repaint)?
    }
}

/// Warns when VAE posterior sampling on `device` cannot follow the request
/// seed. Returns whether it warned.
fn warn_if_unseeded(device: &Device) -> bool {
    let unseeded = device.is_cpu();
    if unseeded {
        warn!(
            reproducible = false,
            "encoding the init image on cpu uses unseeded noise, same-seed runs may differ"
        );
    }
    unseeded
}

impl StableDiffusionEngine {
    fn latent_dims(&self) -> (usize, usize) {
        (self.config.height / 8, self.config.width / 8)
    }

    fn noise(&self, rng: &mut RandomSource) -> Result<Tensor> {
        let (height, width) = self.latent_dims();
        let shape = (1, LATENT_CHANNELS, height, width);
        let samples = rng.standard_normal(LATENT_CHANNELS * height * width);
        Ok(Tensor::from_vec(samples, shape, &self.device)?)
    }

    fn embed(&self, text: &str) -> Result<Tensor> {
        let max_len = self.config.clip.max_position_embeddings;
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            warn!(tokens = tokens.len(), max_len, "prompt is too long, truncating");
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip.forward(&tokens)?)
    }

    fn text_embeddings(&self, inputs: &EngineInputs<'_>, guided: bool) -> Result<Tensor> {
        let cond = self.embed(inputs.prompt)?;
        if !guided {
            return Ok(cond);
        }
        let uncond = self.embed(inputs.negative_prompt)?;
        Ok(Tensor::cat(&[uncond, cond], 0)?)
    }

    fn encode_image(&self, img: &RgbImage) -> Result<Tensor> {
        let pixels = image_to_tensor(img, self.config.width, self.config.height, &self.device)?;
        // sample() draws from the device RNG and candle keeps the posterior
        // mean private. The CPU RNG has no seed hook, so on CPU this one draw
        // escapes the request seed and image-conditioned output can drift
        // between runs with the same seed.
        warn_if_unseeded(&self.device);
        let latents = self.vae.encode(&pixels)?.sample()?;
        Ok((latents * VAE_SCALE)?)
    }

    fn decode_latents(&self, latents: &Tensor) -> Result<RgbImage> {
        let img = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let img = ((img / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (img.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&img)
    }

    fn inpaint_blend(
        &self,
        init_latents: &Tensor,
        noise: &Tensor,
        mask: &GrayImage,
    ) -> Result<InpaintBlend> {
        let (height, width) = self.latent_dims();
        let keep = mask_to_keep_tensor(mask, width, height, &self.device)?;
        let repaint = keep.affine(-1., 1.)?;
        Ok(InpaintBlend {
            init_latents: init_latents.clone(),
            noise: noise.clone(),
            keep,
            repaint,
        })
    }
}

impl InferenceEngine for StableDiffusionEngine {
    fn generate(
        &mut self,
        inputs: &EngineInputs<'_>,
        scheduler: &mut dyn Scheduler,
        rng: &mut RandomSource,
    ) -> Result<RgbImage> {
        // Accelerator RNGs back the VAE's latent sampling. The CPU one cannot be seeded.
        if !self.device.is_cpu() {
            self.device.set_seed(rng.next_u64())?;
        }

        let guided = inputs.guidance_scale > 1.0;
        let text_embeddings = self.text_embeddings(inputs, guided)?;
        let timesteps = scheduler.timesteps().to_vec();
        let noise = self.noise(rng)?;

        let (mut latents, start, blend) = match inputs.init_image {
            None => ((&noise * scheduler.init_noise_sigma())?, 0, None),
            Some(init_image) => {
                let init_latents = self.encode_image(init_image)?;
                let steps = inputs.num_inference_steps;
                let init_steps = ((steps as f64 * inputs.strength) as usize).min(steps);
                if init_steps == 0 {
                    info!("strength is zero, returning the encoded init image");
                    return self.decode_latents(&init_latents);
                }
                let start = steps - init_steps;
                let latents = scheduler.add_noise(&init_latents, &noise, start)?;
                let blend = match inputs.mask {
                    Some(mask) => Some(self.inpaint_blend(&init_latents, &noise, mask)?),
                    None => None,
                };
                (latents, start, blend)
            }
        };
        info!(
            mode = %inputs.mode,
            steps = timesteps.len() - start,
            guidance_scale = inputs.guidance_scale,
            "denoising"
        );

        for (step_index, &timestep) in timesteps.iter().enumerate().skip(start) {
            let latent_input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, step_index)?;
            let noise_pred = self.unet.forward(&latent_input, timestep, &text_embeddings)?;
            let noise_pred = if guided {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * inputs.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, step_index, &latents)?;
            if let Some(blend) = &blend {
                latents = blend.apply(&latents, scheduler, step_index + 1)?;
            }
            debug!(step = step_index + 1, total = timesteps.len(), timestep, "denoising step done");
        }

        self.decode_latents(&latents)
    }
}

/// Loads Stable Diffusion weights from a diffusers-layout hub repository.
#[derive(Clone)]
pub struct StableDiffusionLoader {
    api: Api,
    device_map: DeviceMap,
}

impl StableDiffusionLoader {
    pub fn new(api: Api, device_map: DeviceMap) -> Self {
        Self { api, device_map }
    }
}

impl EngineLoader for StableDiffusionLoader {
    type Engine = StableDiffusionEngine;

    async fn load(&self, spec: &EngineSpec) -> Result<Self::Engine> {
        let variant = ModelVariant::from_name(&spec.model)?;
        info!(model = %spec.model, ?variant, "loading stable diffusion");

        let device = select_best_device(self.device_map).context("failed to set up device")?;
        let dtype = DType::F32;
        let config = variant.config();

        // --- Tokenizer ---
        let tokenizer_file = self
            .api
            .model(spec.tokenizer.clone())
            .get("tokenizer.json")
            .await
            .context("failed to get tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(anyhow::Error::msg)
            .context("failed to load tokenizer")?;
        let pad_token = config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .get_vocab(true)
            .get(pad_token)
            .copied()
            .with_context(|| format!("tokenizer has no {pad_token} token"))?;

        let repo = self.api.model(spec.model.clone());

        // --- Text encoder ---
        let clip_file = repo
            .get("text_encoder/model.safetensors")
            .await
            .context("failed to get text encoder weights")?;
        let clip = stable_diffusion::build_clip_transformer(&config.clip, clip_file, &device, dtype)
            .context("failed to load text encoder")?;

        // --- UNet ---
        let unet_file = repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get unet weights")?;
        let use_flash_attn = cfg!(feature = "flash-attn") && device.is_cuda();
        let unet = config
            .build_unet(unet_file, &device, LATENT_CHANNELS, use_flash_attn, dtype)
            .context("failed to load unet")?;

        // --- VAE ---
        let vae_file = repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get vae weights")?;
        let vae = config
            .build_vae(vae_file, &device, dtype)
            .context("failed to load vae")?;

        Ok(StableDiffusionEngine {
            device,
            config,
            tokenizer,
            pad_id,
            clip,
            unet,
            vae,
        })
    }
}
