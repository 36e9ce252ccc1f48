use anyhow::Result;
use candle_core::{Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Gaussian noise source owned by a single sampling run.
///
/// Seeding it never touches device or process-wide RNG state, so
/// concurrent requests with different seeds cannot interfere.
#[derive(Debug, Clone)]
pub struct LatentNoise {
    rng: StdRng,
}

impl LatentNoise {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { rng }
    }

    pub fn randn<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(data, shape, device)?)
    }
}
