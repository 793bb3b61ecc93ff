//! Utility functions for differential privacy.

use super::accountant::RdpAccountant;
use super::config::default_alphas;
use crate::error::{Error, Result};

/// Largest noise multiplier tried by [`estimate_noise_multiplier`]
const MAX_NOISE_MULTIPLIER: f64 = 100.0;

/// Estimate required noise multiplier for target epsilon
///
/// Binary search over the accountant for the smallest noise multiplier whose
/// epsilon after `steps` steps at `sample_rate` stays within `target_epsilon`.
pub fn estimate_noise_multiplier(
    target_epsilon: f64,
    delta: f64,
    sample_rate: f64,
    steps: usize,
    alphas: &[f64],
) -> Result<f64> {
    if !(target_epsilon > 0.0) {
        return Err(Error::InvalidConfig(
            "target epsilon must be positive".to_string(),
        ));
    }
    if !(sample_rate > 0.0 && sample_rate <= 1.0) || steps == 0 {
        return Err(Error::InvalidConfig(
            "sample rate must be in (0, 1] and steps positive".to_string(),
        ));
    }

    let epsilon_at = |sigma: f64| -> Result<f64> {
        let mut accountant = RdpAccountant::new(alphas.to_vec());
        accountant.record_steps(sigma, sample_rate, steps);
        Ok(accountant.get_privacy_spent(delta)?.0)
    };

    if epsilon_at(MAX_NOISE_MULTIPLIER)? > target_epsilon {
        return Err(Error::InvalidConfig(format!(
            "epsilon {target_epsilon} is unreachable with noise multiplier \
             <= {MAX_NOISE_MULTIPLIER}"
        )));
    }

    let mut low = 0.0;
    let mut high = MAX_NOISE_MULTIPLIER;
    while high - low > 0.01 {
        let mid = f64::midpoint(low, high);
        if epsilon_at(mid)? <= target_epsilon {
            high = mid;
        } else {
            low = mid;
        }
    }

    Ok(high)
}

/// Privacy cost (epsilon) of a single step, over the default orders
pub fn privacy_cost_per_step(noise_multiplier: f64, sample_rate: f64, delta: f64) -> Result<f64> {
    let mut accountant = RdpAccountant::new(default_alphas());
    accountant.record_step(noise_multiplier, sample_rate);
    Ok(accountant.get_privacy_spent(delta)?.0)
}
