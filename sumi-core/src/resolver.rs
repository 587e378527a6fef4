use tracing::debug;

use crate::scheduler::TRAIN_TIMESTEPS;
use crate::{Defaults, GenerationRequest, PartialRequest, ValidationError};

/// Merge `partial` over `defaults` into a fully populated request.
///
/// Missing fields never fail; only values that cannot be run with do.
pub fn resolve(
    partial: PartialRequest,
    defaults: &Defaults,
) -> Result<GenerationRequest, ValidationError> {
    let request = GenerationRequest {
        prompt: partial.prompt.unwrap_or_else(|| defaults.prompt.to_string()),
        negative_prompt: partial
            .negative_prompt
            .unwrap_or_else(|| defaults.negative_prompt.to_string()),
        model: partial.model.unwrap_or_else(|| defaults.model.to_string()),
        tokenizer: partial
            .tokenizer
            .unwrap_or_else(|| defaults.tokenizer.to_string()),
        init_image: partial.init_image,
        mask: partial.mask,
        strength: partial.strength.unwrap_or(defaults.strength),
        num_inference_steps: partial
            .num_inference_steps
            .unwrap_or(defaults.num_inference_steps),
        guidance_scale: partial.guidance_scale.unwrap_or(defaults.guidance_scale),
        eta: partial.eta.unwrap_or(defaults.eta),
        seed: partial.seed,
        beta_start: partial.beta_start.unwrap_or(defaults.beta_start),
        beta_end: partial.beta_end.unwrap_or(defaults.beta_end),
        beta_schedule: partial.beta_schedule.unwrap_or(defaults.beta_schedule),
        safety_enabled: partial.safety_enabled.unwrap_or(defaults.safety_enabled),
        output_name: partial
            .output_name
            .or_else(|| defaults.output_name.map(str::to_string)),
    };

    validate(&request)?;
    debug!(?request, "resolved request");
    Ok(request)
}

fn validate(request: &GenerationRequest) -> Result<(), ValidationError> {
    for (field, value) in [
        ("strength", request.strength),
        ("guidance_scale", request.guidance_scale),
        ("eta", request.eta),
        ("beta_start", request.beta_start),
        ("beta_end", request.beta_end),
    ] {
        if !value.is_finite() {
            return Err(ValidationError::NonFinite { field, value });
        }
    }

    if !(0.0..=1.0).contains(&request.strength) {
        return Err(ValidationError::StrengthOutOfRange(request.strength));
    }
    if request.num_inference_steps == 0 {
        return Err(ValidationError::ZeroInferenceSteps);
    }
    if request.num_inference_steps as usize > TRAIN_TIMESTEPS {
        return Err(ValidationError::TooManySteps {
            got: request.num_inference_steps,
            max: TRAIN_TIMESTEPS as u32,
        });
    }
    if request.beta_start <= 0.0 || request.beta_start >= request.beta_end {
        return Err(ValidationError::BetaRange {
            start: request.beta_start,
            end: request.beta_end,
        });
    }
    if request.mask.is_some() && request.init_image.is_none() {
        return Err(ValidationError::MaskWithoutInitImage);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BetaSchedule, ImageRef};

    fn with_strength(strength: f64) -> PartialRequest {
        PartialRequest {
            strength: Some(strength),
            ..Default::default()
        }
    }

    #[test]
    fn empty_request_takes_every_default() {
        let request = resolve(PartialRequest::default(), &Defaults::CLI).unwrap();
        let d = Defaults::CLI;

        assert_eq!(request.prompt, d.prompt);
        assert_eq!(request.negative_prompt, "");
        assert_eq!(request.model, "bes-dev/stable-diffusion-v1-4-openvino");
        assert_eq!(request.tokenizer, "openai/clip-vit-large-patch14");
        assert_eq!(request.init_image, None);
        assert_eq!(request.mask, None);
        assert_eq!(request.strength, 0.5);
        assert_eq!(request.num_inference_steps, 32);
        assert_eq!(request.guidance_scale, 7.5);
        assert_eq!(request.eta, 0.0);
        assert_eq!(request.seed, None);
        assert_eq!(request.beta_start, 0.00085);
        assert_eq!(request.beta_end, 0.012);
        assert_eq!(request.beta_schedule, BetaSchedule::ScaledLinear);
        assert!(request.safety_enabled);
        assert_eq!(request.output_name.as_deref(), Some("output.png"));
        assert!((0.0..=1.0).contains(&request.strength));
    }

    #[test]
    fn event_defaults_leave_output_name_for_persister() {
        let request = resolve(PartialRequest::default(), &Defaults::EVENT).unwrap();
        assert_eq!(request.model, "hakurei/waifu-diffusion");
        assert_eq!(request.prompt, "");
        assert_eq!(request.output_name, None);
    }

    #[test]
    fn supplied_fields_win_over_defaults() {
        let partial = PartialRequest {
            prompt: Some("hatsune miku".into()),
            num_inference_steps: Some(20),
            seed: Some(7),
            safety_enabled: Some(false),
            ..Default::default()
        };
        let request = resolve(partial, &Defaults::EVENT).unwrap();
        assert_eq!(request.prompt, "hatsune miku");
        assert_eq!(request.num_inference_steps, 20);
        assert_eq!(request.seed, Some(7));
        assert!(!request.safety_enabled);
    }

    #[test]
    fn strength_boundaries() {
        assert_eq!(
            resolve(with_strength(1.5), &Defaults::CLI),
            Err(ValidationError::StrengthOutOfRange(1.5))
        );
        assert!(resolve(with_strength(-0.1), &Defaults::CLI).is_err());
        assert!(resolve(with_strength(0.0), &Defaults::CLI).is_ok());
        assert!(resolve(with_strength(1.0), &Defaults::CLI).is_ok());
    }

    #[test]
    fn mask_requires_init_image() {
        let partial = PartialRequest {
            mask: Some(ImageRef::parse("mask.png")),
            ..Default::default()
        };
        assert_eq!(
            resolve(partial, &Defaults::CLI),
            Err(ValidationError::MaskWithoutInitImage)
        );

        let partial = PartialRequest {
            init_image: Some(ImageRef::parse("init.png")),
            mask: Some(ImageRef::parse("mask.png")),
            ..Default::default()
        };
        assert!(resolve(partial, &Defaults::CLI).is_ok());
    }

    #[test]
    fn rejects_zero_steps_and_bad_floats() {
        let partial = PartialRequest {
            num_inference_steps: Some(0),
            ..Default::default()
        };
        assert_eq!(
            resolve(partial, &Defaults::CLI),
            Err(ValidationError::ZeroInferenceSteps)
        );

        let partial = PartialRequest {
            num_inference_steps: Some(1001),
            ..Default::default()
        };
        assert!(matches!(
            resolve(partial, &Defaults::CLI),
            Err(ValidationError::TooManySteps { got: 1001, max: 1000 })
        ));

        let partial = PartialRequest {
            guidance_scale: Some(f64::NAN),
            ..Default::default()
        };
        assert!(matches!(
            resolve(partial, &Defaults::CLI),
            Err(ValidationError::NonFinite { field: "guidance_scale", .. })
        ));

        let partial = PartialRequest {
            beta_start: Some(0.02),
            ..Default::default()
        };
        assert!(matches!(
            resolve(partial, &Defaults::CLI),
            Err(ValidationError::BetaRange { .. })
        ));
    }
}
