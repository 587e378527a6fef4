use candle_core::{Result, Tensor};

use super::{alphas_cumprod, linspace, Scheduler, TRAIN_TIMESTEPS};
use crate::SamplerKind;

const LMS_ORDER: usize = 4;

/// Linear multistep sampler over a discrete sigma schedule.
pub struct LmsDiscreteScheduler {
    timesteps: Vec<f64>,
    /// One sigma per timestep plus a trailing zero.
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
    derivatives: Vec<Tensor>,
}

impl LmsDiscreteScheduler {
    pub fn new(betas: &[f64], num_inference_steps: usize) -> Self {
        let train_sigmas: Vec<f64> = alphas_cumprod(betas)
            .into_iter()
            .map(|ac| ((1.0 - ac) / ac).sqrt())
            .collect();

        let mut timesteps = linspace(0.0, (TRAIN_TIMESTEPS - 1) as f64, num_inference_steps);
        timesteps.reverse();

        let mut sigmas: Vec<f64> = timesteps.iter().map(|&t| interp(t, &train_sigmas)).collect();
        sigmas.push(0.0);
        let init_noise_sigma = sigmas.iter().copied().fold(0.0, f64::max);

        Self {
            timesteps,
            sigmas,
            init_noise_sigma,
            derivatives: Vec::new(),
        }
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// Weight of the derivative `current_order` steps back when advancing
    /// from step `t` to `t + 1`: the integral over `[sigma_t, sigma_t+1]` of
    /// its Lagrange basis polynomial.
    pub(crate) fn lms_coefficient(&self, order: usize, t: usize, current_order: usize) -> f64 {
        let basis = |tau: f64| {
            (0..order)
                .filter(|&k| k != current_order)
                .map(|k| {
                    (tau - self.sigmas[t - k])
                        / (self.sigmas[t - current_order] - self.sigmas[t - k])
                })
                .product::<f64>()
        };
        // Basis polynomials are at most cubic, where Simpson's rule is exact.
        let (a, b) = (self.sigmas[t], self.sigmas[t + 1]);
        (b - a) / 6.0 * (basis(a) + 4.0 * basis((a + b) / 2.0) + basis(b))
    }
}

/// Piecewise-linear lookup of `table` at fractional index `x`.
fn interp(x: f64, table: &[f64]) -> f64 {
    let last = table.len() - 1;
    if x <= 0.0 {
        return table[0];
    }
    if x >= last as f64 {
        return table[last];
    }
    let lo = x.floor() as usize;
    let frac = x - lo as f64;
    table[lo] * (1.0 - frac) + table[lo + 1] * frac
}

impl Scheduler for LmsDiscreteScheduler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::LmsDiscrete
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn scale_model_input(&self, sample: Tensor, step_index: usize) -> Result<Tensor> {
        let sigma = self.sigmas[step_index];
        sample / (sigma * sigma + 1.0).sqrt()
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor> {
        original + (noise * self.sigmas[step_index])?
    }

    fn step(&mut self, model_output: &Tensor, step_index: usize, sample: &Tensor) -> Result<Tensor> {
        let sigma = self.sigmas[step_index];
        let pred_original_sample = (sample - (model_output * sigma)?)?;
        let derivative = ((sample - &pred_original_sample)? / sigma)?;
        self.derivatives.push(derivative);
        if self.derivatives.len() > LMS_ORDER {
            self.derivatives.remove(0);
        }

        let order = (step_index + 1).min(LMS_ORDER);
        let mut prev_sample = sample.clone();
        for (current_order, derivative) in self.derivatives.iter().rev().take(order).enumerate() {
            let coeff = self.lms_coefficient(order, step_index, current_order);
            prev_sample = (prev_sample + (derivative * coeff)?)?;
        }
        Ok(prev_sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::betas;
    use crate::BetaSchedule;
    use candle_core::{DType, Device};

    fn scheduler(steps: usize) -> LmsDiscreteScheduler {
        LmsDiscreteScheduler::new(&betas(0.00085, 0.012, BetaSchedule::ScaledLinear), steps)
    }

    #[test]
    fn timesteps_span_training_range_descending() {
        let s = scheduler(32);
        assert_eq!(s.timesteps().len(), 32);
        assert_eq!(s.timesteps()[0], 999.0);
        assert_eq!(*s.timesteps().last().unwrap(), 0.0);
        assert_eq!(s.sigmas().len(), 33);
        assert_eq!(*s.sigmas().last().unwrap(), 0.0);
        assert!(s.sigmas().windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn init_noise_sigma_is_largest_sigma() {
        let s = scheduler(20);
        assert_eq!(s.init_noise_sigma(), s.sigmas()[0]);
        // Stable Diffusion's schedule tops out near 14.6.
        assert!((s.init_noise_sigma() - 14.6).abs() < 0.1);
    }

    #[test]
    fn first_order_coefficient_is_step_width() {
        let s = scheduler(10);
        let c = s.lms_coefficient(1, 0, 0);
        assert!((c - (s.sigmas()[1] - s.sigmas()[0])).abs() < 1e-12);
    }

    #[test]
    fn coefficients_sum_to_step_width() {
        // Lagrange bases sum to one, so their integrals sum to the interval length.
        let s = scheduler(10);
        for t in 3..9 {
            let total: f64 = (0..4).map(|k| s.lms_coefficient(4, t, k)).sum();
            assert!((total - (s.sigmas()[t + 1] - s.sigmas()[t])).abs() < 1e-9);
        }
    }

    #[test]
    fn scale_model_input_divides_by_noise_norm() -> Result<()> {
        let s = scheduler(10);
        let sample = Tensor::ones((2, 2), DType::F32, &Device::Cpu)?;
        let scaled = s.scale_model_input(sample, 0)?;
        let expected = 1.0 / (s.sigmas()[0].powi(2) + 1.0).sqrt();
        for v in scaled.flatten_all()?.to_vec1::<f32>()? {
            assert!((f64::from(v) - expected).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn perfect_prediction_denoises_to_zero() -> Result<()> {
        // A model that predicts exactly the injected noise on a zero image
        // walks the sample back to zero.
        let mut s = scheduler(8);
        let noise = Tensor::ones((1, 4), DType::F32, &Device::Cpu)?;
        let mut sample = (&noise * s.init_noise_sigma())?;
        for i in 0..s.timesteps().len() {
            sample = s.step(&noise, i, &sample)?;
        }
        for v in sample.flatten_all()?.to_vec1::<f32>()? {
            assert!(v.abs() < 1e-3, "residual {v}");
        }
        Ok(())
    }
}
