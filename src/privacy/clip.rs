//! Per-example clipping and aggregation.

use ndarray::{Array1, Array2, ArrayD, Axis, Ix2};

use super::config::ClippingConfig;
use crate::error::{Error, Result};
use crate::nn::shape::reshape;
use crate::nn::Parameter;

/// Guards the clipping scale against a zero norm
pub const CLIP_EPS: f64 = 1e-6;

/// Summary of one clipping pass
#[derive(Debug, Clone, PartialEq)]
pub struct ClipStats {
    /// Examples in the batch
    pub sample_count: usize,
    /// Examples whose gradient was scaled down
    pub clipped_examples: usize,
    /// Largest per-example global norm before clipping
    pub max_norm: f64,
    /// Mean per-example global norm before clipping
    pub mean_norm: f64,
    /// Bound on any example's total contribution after clipping
    pub bound: f64,
}

/// Scale that brings a gradient of `norm` within `max_norm`; exactly 1 when already inside
pub fn clip_scale(norm: f64, max_norm: f64) -> f64 {
    if norm <= max_norm {
        1.0
    } else {
        max_norm / (norm + CLIP_EPS)
    }
}

/// Global per-example norms: `sqrt(sum_p ||sample_p[i]||^2)`
pub fn per_example_norms(samples: &[Array2<f32>]) -> Array1<f64> {
    let batch = samples.first().map_or(0, |s| s.nrows());
    let mut squared = Array1::<f64>::zeros(batch);
    for sample in samples {
        for (acc, row) in squared.iter_mut().zip(sample.axis_iter(Axis(0))) {
            *acc += row.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>();
        }
    }
    squared.mapv_into(f64::sqrt)
}

/// Checked view of the trainable parameters taking part in this step
fn collect_samples(params: &[&mut Parameter]) -> Result<Vec<(usize, Array2<f32>)>> {
    let mut participating = Vec::new();
    let mut latest_pass = 0;

    for (index, param) in params.iter().filter(|p| p.requires_grad()).enumerate() {
        if param.grad().is_none() {
            continue;
        }
        let sample = param.grad_sample();
        if !sample.is_allocated() {
            return Err(Error::MissingGradSample {
                param: param.name().to_string(),
            });
        }
        if !sample.is_live() {
            return Err(Error::StaleGradSample {
                param: param.name().to_string(),
            });
        }
        latest_pass = latest_pass.max(sample.pass());
        participating.push((index, param));
    }

    if participating.is_empty() {
        return Err(Error::NoGradients);
    }

    let mut expected = None;
    let mut samples = Vec::with_capacity(participating.len());
    for (index, param) in participating {
        let sample = param.grad_sample();
        if sample.pass() != latest_pass {
            return Err(Error::StaleGradSample {
                param: param.name().to_string(),
            });
        }
        let Some(live) = sample.live() else {
            return Err(Error::StaleGradSample {
                param: param.name().to_string(),
            });
        };
        let batch = live.shape()[0];
        let expected = *expected.get_or_insert(batch);
        if batch != expected {
            return Err(Error::SampleCountMismatch {
                param: param.name().to_string(),
                expected,
                actual: batch,
            });
        }
        let rows = reshape(live, &[batch, param.len()])?.into_dimensionality::<Ix2>()?;
        samples.push((index, rows));
    }
    Ok(samples)
}

/// Clip every example's gradient, sum over the batch and write the result
/// into each participating parameter's batch gradient
///
/// All checks run before anything is written. On success every live sample is
/// consumed, so reading it again is a stale read.
pub fn clip_and_aggregate(
    params: &mut [&mut Parameter],
    clipping: &ClippingConfig,
) -> Result<ClipStats> {
    let samples = collect_samples(params)?;
    let sample_count = samples[0].1.nrows();

    let per_layer = match &clipping.per_layer_max_grad_norm {
        Some(bounds) => {
            let trainable = params.iter().filter(|p| p.requires_grad()).count();
            if bounds.len() != trainable {
                return Err(Error::InvalidConfig(format!(
                    "{} per-layer clipping bounds for {trainable} trainable parameters",
                    bounds.len()
                )));
            }
            Some(bounds)
        }
        None => None,
    };

    let rows: Vec<Array2<f32>> = samples.iter().map(|(_, s)| s.clone()).collect();
    let norms = per_example_norms(&rows);

    // one scale per (parameter, example)
    let scales: Vec<Array1<f64>> = match per_layer {
        None => {
            let global = norms.mapv(|n| clip_scale(n, clipping.max_grad_norm));
            vec![global; samples.len()]
        }
        Some(bounds) => samples
            .iter()
            .map(|(index, s)| {
                let bound = bounds[*index];
                per_example_norms(std::slice::from_ref(s)).mapv(|n| clip_scale(n, bound))
            })
            .collect(),
    };

    let clipped_examples = (0..sample_count)
        .filter(|&i| scales.iter().any(|s| s[i] < 1.0))
        .count();

    let mut aggregates: Vec<(usize, ArrayD<f32>)> = Vec::with_capacity(samples.len());
    for ((index, rows), scale) in samples.iter().zip(&scales) {
        let weights = scale.mapv(|s| s as f32);
        aggregates.push((*index, weights.dot(rows).into_dyn()));
    }

    let mut trainable: Vec<&mut &mut Parameter> =
        params.iter_mut().filter(|p| p.requires_grad()).collect();
    for (index, flat) in aggregates {
        let param = &mut trainable[index];
        let shape = param.shape().to_vec();
        param.set_grad(reshape(&flat, &shape)?);
    }
    for param in trainable {
        param.grad_sample_mut().consume();
    }

    let max_norm = norms.iter().copied().fold(0.0, f64::max);
    let mean_norm = if sample_count == 0 {
        0.0
    } else {
        norms.sum() / sample_count as f64
    };

    Ok(ClipStats {
        sample_count,
        clipped_examples,
        max_norm,
        mean_norm,
        bound: clipping.total_bound(),
    })
}
