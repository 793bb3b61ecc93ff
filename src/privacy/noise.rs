//! Gaussian noise for the clipped aggregate.

use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::nn::Parameter;

/// Draws `N(0, std^2)` noise from its own generator
///
/// Unseeded injectors draw from OS entropy, so two runs never share noise.
#[derive(Debug, Clone)]
pub struct NoiseInjector {
    rng: StdRng,
}

impl NoiseInjector {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { rng }
    }

    /// One standard normal draw, with untruncated tails
    pub fn standard_normal(&mut self) -> f64 {
        self.rng.sample(StandardNormal)
    }

    /// Add independent noise to every element of `grad`
    pub fn add_noise(&mut self, grad: &mut ArrayD<f32>, std: f64) {
        if std == 0.0 {
            return;
        }
        for value in grad.iter_mut() {
            *value += (self.standard_normal() * std) as f32;
        }
    }

    /// Noise every trainable gradient, then divide by `divisor`
    pub fn apply(&mut self, params: &mut [&mut Parameter], std: f64, divisor: f64) {
        for param in params.iter_mut().filter(|p| p.requires_grad()) {
            let Some(grad) = param.grad() else {
                continue;
            };
            let mut grad = grad.clone();
            self.add_noise(&mut grad, std);
            if divisor != 1.0 {
                grad.mapv_inplace(|v| (f64::from(v) / divisor) as f32);
            }
            param.set_grad(grad);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::ParamRole;
    use ndarray::{arr1, IxDyn};

    #[test]
    fn test_zero_std_is_identity() {
        let mut noise = NoiseInjector::new(None);
        let mut grad = arr1(&[1.0, -2.0, 3.5]).into_dyn();
        noise.add_noise(&mut grad, 0.0);
        assert_eq!(grad.as_slice().unwrap(), &[1.0, -2.0, 3.5]);
    }

    #[test]
    fn test_seeded_draws_repeat() {
        let mut a = NoiseInjector::new(Some(7));
        let mut b = NoiseInjector::new(Some(7));
        for _ in 0..16 {
            assert_eq!(a.standard_normal(), b.standard_normal());
        }
    }

    #[test]
    fn test_draws_follow_standard_normal() {
        let mut noise = NoiseInjector::new(Some(11));
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..32 {
            let expected: f64 = rng.sample(StandardNormal);
            assert_eq!(noise.standard_normal(), expected);
        }
    }

    #[test]
    fn test_unseeded_draws_differ() {
        let mut a = NoiseInjector::new(None);
        let mut b = NoiseInjector::new(None);
        let xs: Vec<f64> = (0..8).map(|_| a.standard_normal()).collect();
        let ys: Vec<f64> = (0..8).map(|_| b.standard_normal()).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn test_empirical_moments() {
        let mut noise = NoiseInjector::new(Some(42));
        let mut grad = ArrayD::<f32>::zeros(IxDyn(&[20_000]));
        noise.add_noise(&mut grad, 2.0);
        let n = grad.len() as f64;
        let mean = grad.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        let var = grad.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 0.1, "mean {mean}");
        assert!((var.sqrt() - 2.0).abs() < 0.1, "std {}", var.sqrt());
    }

    #[test]
    fn test_apply_divides_and_skips_frozen() {
        let mut w = Parameter::new("w", ParamRole::Weight, arr1(&[0.0, 0.0]).into_dyn());
        w.set_grad(arr1(&[4.0, 8.0]).into_dyn());
        let mut frozen = Parameter::new("f", ParamRole::Weight, arr1(&[0.0]).into_dyn());
        frozen.set_requires_grad(false);

        let mut noise = NoiseInjector::new(Some(1));
        noise.apply(&mut [&mut w, &mut frozen], 0.0, 4.0);
        assert_eq!(w.grad().unwrap().as_slice().unwrap(), &[1.0, 2.0]);
        assert!(frozen.grad().is_none());
    }

    #[test]
    fn test_apply_noises_parameters_independently() {
        let mut a = Parameter::new("a", ParamRole::Weight, arr1(&[0.0; 4]).into_dyn());
        let mut b = Parameter::new("b", ParamRole::Weight, arr1(&[0.0; 4]).into_dyn());
        a.set_grad(arr1(&[0.0; 4]).into_dyn());
        b.set_grad(arr1(&[0.0; 4]).into_dyn());

        NoiseInjector::new(Some(3)).apply(&mut [&mut a, &mut b], 1.0, 1.0);
        assert_ne!(a.grad().unwrap(), b.grad().unwrap());
    }
}
