use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::info;

use crate::GenerationRequest;

/// Request-scoped random source. Every random draw made while generating
/// an image goes through one of these, seeded from the request's seed.
#[derive(Debug, Clone)]
pub struct RandomSource {
    seed: u32,
    rng: StdRng,
}

impl RandomSource {
    pub fn from_seed(seed: u32) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(u64::from(seed)),
        }
    }

    /// The seed this source was built from.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    pub fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    /// `len` samples from N(0, 1) via the Box-Muller transform.
    pub fn standard_normal(&mut self, len: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(len + 1);
        while out.len() < len {
            // Shift into (0, 1] so ln never sees zero.
            let u1 = 1.0 - self.rng.random::<f64>();
            let u2 = self.rng.random::<f64>();
            let radius = (-2.0 * u1.ln()).sqrt();
            let theta = std::f64::consts::TAU * u2;
            out.push((radius * theta.cos()) as f32);
            out.push((radius * theta.sin()) as f32);
        }
        out.truncate(len);
        out
    }
}

/// Fix the seed for `request` and build the random source for it.
///
/// An explicit seed is used verbatim. Otherwise one is drawn from process
/// entropy and written back into the returned request so it ends up in the
/// output metadata.
pub fn resolve_seed(request: GenerationRequest) -> (GenerationRequest, RandomSource) {
    let seed = match request.seed {
        Some(seed) => {
            info!(seed, "using explicit seed");
            seed
        }
        None => {
            let seed = rand::rng().random::<u32>();
            info!(seed, "drew random seed");
            seed
        }
    };
    (request.with_seed(seed), RandomSource::from_seed(seed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resolve, Defaults, PartialRequest};

    #[test]
    fn explicit_seed_is_used_verbatim() {
        let partial = PartialRequest {
            seed: Some(4_294_967_295),
            ..Default::default()
        };
        let request = resolve(partial, &Defaults::CLI).unwrap();
        let (request, rng) = resolve_seed(request);
        assert_eq!(request.seed, Some(u32::MAX));
        assert_eq!(rng.seed(), u32::MAX);
    }

    #[test]
    fn drawn_seed_is_recorded_in_request() {
        let request = resolve(PartialRequest::default(), &Defaults::CLI).unwrap();
        let (request, rng) = resolve_seed(request);
        assert_eq!(request.seed, Some(rng.seed()));
    }

    #[test]
    fn same_seed_same_stream() {
        let mut a = RandomSource::from_seed(42);
        let mut b = RandomSource::from_seed(42);
        assert_eq!(a.next_u64(), b.next_u64());
        assert_eq!(a.standard_normal(17), b.standard_normal(17));

        let mut c = RandomSource::from_seed(43);
        assert_ne!(
            RandomSource::from_seed(42).standard_normal(8),
            c.standard_normal(8)
        );
    }

    #[test]
    fn standard_normal_is_roughly_centered() {
        let samples = RandomSource::from_seed(7).standard_normal(20_001);
        assert_eq!(samples.len(), 20_001);
        let mean = samples.iter().map(|&x| f64::from(x)).sum::<f64>() / samples.len() as f64;
        let var = samples
            .iter()
            .map(|&x| (f64::from(x) - mean).powi(2))
            .sum::<f64>()
            / samples.len() as f64;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
    }
}
