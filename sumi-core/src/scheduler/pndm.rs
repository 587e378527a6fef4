use candle_core::{Result, Tensor};

use super::{alphas_cumprod, Scheduler, TRAIN_TIMESTEPS};
use crate::SamplerKind;

/// Pseudo numerical methods for diffusion models, step-skipping variant:
/// no Runge-Kutta warmup, every step is a linear multistep update. This is
/// what image-conditioned runs use.
pub struct PndmScheduler {
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    step_ratio: usize,
    timesteps: Vec<usize>,
    timesteps_f64: Vec<f64>,
    ets: Vec<Tensor>,
    cur_sample: Option<Tensor>,
    counter: usize,
}

impl PndmScheduler {
    pub fn new(betas: &[f64], num_inference_steps: usize) -> Self {
        let alphas_cumprod = alphas_cumprod(betas);
        let final_alpha_cumprod = alphas_cumprod[0];
        let n = num_inference_steps.max(1);
        let step_ratio = TRAIN_TIMESTEPS / n;
        let base: Vec<usize> = (0..n).map(|i| i * step_ratio).collect();

        // base[..n-1], base[n-2], base[n-1], highest first.
        let mut timesteps: Vec<usize> = base[..n - 1].to_vec();
        if n >= 2 {
            timesteps.push(base[n - 2]);
        }
        timesteps.push(base[n - 1]);
        timesteps.reverse();

        let timesteps_f64 = timesteps.iter().map(|&t| t as f64).collect();
        Self {
            alphas_cumprod,
            final_alpha_cumprod,
            step_ratio,
            timesteps,
            timesteps_f64,
            ets: Vec::new(),
            cur_sample: None,
            counter: 0,
        }
    }

    fn prev_sample(
        &self,
        sample: &Tensor,
        timestep: usize,
        prev_timestep: i64,
        model_output: &Tensor,
    ) -> Result<Tensor> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev = if prev_timestep >= 0 {
            self.alphas_cumprod[prev_timestep as usize]
        } else {
            self.final_alpha_cumprod
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
        let denom = alpha_prod_t * beta_prod_t_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();
        let output_coeff = (alpha_prod_t_prev - alpha_prod_t) / denom;

        (sample * sample_coeff)? - (model_output * output_coeff)?
    }

    fn step_plms(&mut self, model_output: &Tensor, step_index: usize, sample: &Tensor) -> Result<Tensor> {
        let mut timestep = self.timesteps[step_index];
        let mut prev_timestep = timestep as i64 - self.step_ratio as i64;
        if self.counter != 1 {
            if self.ets.len() > 3 {
                self.ets.drain(..self.ets.len() - 3);
            }
            self.ets.push(model_output.clone());
        } else {
            prev_timestep = timestep as i64;
            timestep += self.step_ratio;
        }

        let mut sample = sample.clone();
        let ets = &self.ets;
        let e = |back: usize| &ets[ets.len() - back];
        let model_output = match (ets.len(), self.counter) {
            (1, 0) => {
                self.cur_sample = Some(sample.clone());
                model_output.clone()
            }
            (1, 1) => {
                if let Some(cur) = self.cur_sample.take() {
                    sample = cur;
                }
                ((model_output + e(1))? / 2.0)?
            }
            (2, _) => (((e(1) * 3.0)? - e(2))? / 2.0)?,
            (3, _) => ((((e(1) * 23.0)? - (e(2) * 16.0)?)? + (e(3) * 5.0)?)? / 12.0)?,
            _ => {
                let sum = ((((e(1) * 55.0)? - (e(2) * 59.0)?)? + (e(3) * 37.0)?)? - (e(4) * 9.0)?)?;
                (sum / 24.0)?
            }
        };

        let prev = self.prev_sample(&sample, timestep, prev_timestep, &model_output)?;
        self.counter += 1;
        Ok(prev)
    }
}

impl Scheduler for PndmScheduler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::Pndm
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps_f64
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: Tensor, _step_index: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor> {
        let alpha_prod = self.alphas_cumprod[self.timesteps[step_index]];
        (original * alpha_prod.sqrt())? + (noise * (1.0 - alpha_prod).sqrt())?
    }

    fn step(&mut self, model_output: &Tensor, step_index: usize, sample: &Tensor) -> Result<Tensor> {
        self.step_plms(model_output, step_index, sample)
    }
}
