//! Noise schedules the engine steps through.
//!
//! Both schedulers share the same beta table over [`TRAIN_TIMESTEPS`]
//! training steps and differ in how they walk it.

use candle_core::{Result, Tensor};

use crate::{BetaSchedule, SamplerKind, SamplerSpec};

mod lms;
mod pndm;

pub use lms::LmsDiscreteScheduler;
pub use pndm::PndmScheduler;

/// Number of timesteps the models were trained with.
pub const TRAIN_TIMESTEPS: usize = 1000;

/// One denoising schedule, stepped by index into [`Scheduler::timesteps`].
pub trait Scheduler: Send {
    fn kind(&self) -> SamplerKind;

    /// Model timesteps, highest noise first.
    fn timesteps(&self) -> &[f64];

    /// Scale applied to fresh noise before the first step.
    fn init_noise_sigma(&self) -> f64;

    fn scale_model_input(&self, sample: Tensor, step_index: usize) -> Result<Tensor>;

    /// Noise `original` to the level of `step_index`.
    fn add_noise(&self, original: &Tensor, noise: &Tensor, step_index: usize) -> Result<Tensor>;

    /// Advance `sample` one step given the model's noise prediction.
    fn step(&mut self, model_output: &Tensor, step_index: usize, sample: &Tensor)
        -> Result<Tensor>;
}

/// Build the scheduler described by `spec` for `num_inference_steps` steps.
pub fn build_scheduler(spec: &SamplerSpec, num_inference_steps: usize) -> Box<dyn Scheduler> {
    let betas = betas(spec.beta_start, spec.beta_end, spec.beta_schedule);
    match spec.kind {
        SamplerKind::LmsDiscrete => {
            Box::new(LmsDiscreteScheduler::new(&betas, num_inference_steps))
        }
        SamplerKind::Pndm => Box::new(PndmScheduler::new(&betas, num_inference_steps)),
    }
}

/// Beta for each training timestep.
pub fn betas(beta_start: f64, beta_end: f64, schedule: BetaSchedule) -> Vec<f64> {
    match schedule {
        BetaSchedule::Linear => linspace(beta_start, beta_end, TRAIN_TIMESTEPS),
        BetaSchedule::ScaledLinear => linspace(beta_start.sqrt(), beta_end.sqrt(), TRAIN_TIMESTEPS)
            .into_iter()
            .map(|b| b * b)
            .collect(),
        BetaSchedule::SquaredcosCapV2 => {
            let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
            (0..TRAIN_TIMESTEPS)
                .map(|i| {
                    let t1 = i as f64 / TRAIN_TIMESTEPS as f64;
                    let t2 = (i + 1) as f64 / TRAIN_TIMESTEPS as f64;
                    (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                })
                .collect()
        }
    }
}

pub(crate) fn alphas_cumprod(betas: &[f64]) -> Vec<f64> {
    betas
        .iter()
        .scan(1.0, |acc, beta| {
            *acc *= 1.0 - beta;
            Some(*acc)
        })
        .collect()
}

pub(crate) fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            let mut values: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
            values[n - 1] = end;
            values
        }
    }
}
