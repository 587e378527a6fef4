use crate::BetaSchedule;

/// Fallback values applied by [`crate::resolve`] to every field a caller
/// leaves out. Tables are constants so resolution never depends on the
/// environment it runs in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Defaults {
    pub prompt: &'static str,
    pub negative_prompt: &'static str,
    pub model: &'static str,
    pub tokenizer: &'static str,
    pub strength: f64,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub eta: f64,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub safety_enabled: bool,
    /// `None` defers naming to the persister's timestamp.
    pub output_name: Option<&'static str>,
}

impl Defaults {
    /// Defaults for one-shot command-line jobs.
    pub const CLI: Defaults = Defaults {
        prompt: "Street-art painting of Emilia Clarke in style of Banksy, photorealism",
        negative_prompt: "",
        model: "bes-dev/stable-diffusion-v1-4-openvino",
        tokenizer: "openai/clip-vit-large-patch14",
        strength: 0.5,
        num_inference_steps: 32,
        guidance_scale: 7.5,
        eta: 0.0,
        beta_start: 0.00085,
        beta_end: 0.012,
        beta_schedule: BetaSchedule::ScaledLinear,
        safety_enabled: true,
        output_name: Some("output.png"),
    };

    /// Defaults for serverless events.
    pub const EVENT: Defaults = Defaults {
        prompt: "",
        negative_prompt: "",
        model: "hakurei/waifu-diffusion",
        tokenizer: "openai/clip-vit-large-patch14",
        strength: 0.5,
        num_inference_steps: 32,
        guidance_scale: 7.5,
        eta: 0.0,
        beta_start: 0.00085,
        beta_end: 0.012,
        beta_schedule: BetaSchedule::ScaledLinear,
        safety_enabled: true,
        output_name: None,
    };
}

impl Default for Defaults {
    fn default() -> Self {
        Self::EVENT
    }
}
