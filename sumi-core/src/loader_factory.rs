use anyhow::{bail, Result};
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;

/// Output resolution of every generated image.
pub const IMAGE_SIZE: usize = 512;

/// Stable Diffusion families that load from a diffusers-layout repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    /// 1.x and its fine-tunes (waifu-diffusion and friends).
    V1_5,
    /// 2.x base models, epsilon prediction at 512px.
    V2Base,
}

impl ModelVariant {
    /// Detect the model family from a hub identifier.
    ///
    /// Exports that are not safetensors weights (OpenVINO, ONNX) and 2.x
    /// v-prediction checkpoints are rejected.
    pub fn from_name(model_name: &str) -> Result<Self> {
        let name = model_name.to_lowercase();

        if let Some(format) = ["openvino", "onnx"].iter().find(|f| name.contains(*f)) {
            bail!("Unsupported model export: {model_name} is a {format} export, not safetensors weights");
        }

        let is_v2 = ["stable-diffusion-2", "sd-2", "sd2"]
            .iter()
            .any(|marker| name.contains(marker));
        match (is_v2, name.contains("base")) {
            (false, _) => Ok(ModelVariant::V1_5),
            (true, true) => Ok(ModelVariant::V2Base),
            (true, false) => bail!("Unsupported model variant: {model_name} uses v-prediction"),
        }
    }

    pub fn config(self) -> StableDiffusionConfig {
        let size = Some(IMAGE_SIZE);
        match self {
            ModelVariant::V1_5 => StableDiffusionConfig::v1_5(None, size, size),
            ModelVariant::V2Base => StableDiffusionConfig::v2_1(None, size, size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_families() {
        assert_eq!(ModelVariant::from_name("hakurei/waifu-diffusion").unwrap(), ModelVariant::V1_5);
        assert_eq!(
            ModelVariant::from_name("runwayml/stable-diffusion-v1-5").unwrap(),
            ModelVariant::V1_5
        );
        assert_eq!(
            ModelVariant::from_name("stabilityai/stable-diffusion-2-1-base").unwrap(),
            ModelVariant::V2Base
        );
    }

    #[test]
    fn rejects_non_safetensors_exports() {
        let err = ModelVariant::from_name("bes-dev/stable-diffusion-v1-4-openvino").unwrap_err();
        assert!(err.to_string().contains("openvino"));
        assert!(ModelVariant::from_name("someone/sd-v1-5-ONNX").is_err());
    }

    #[test]
    fn rejects_v_prediction_checkpoints() {
        assert!(ModelVariant::from_name("stabilityai/stable-diffusion-2-1").is_err());
    }
}
