//! Loss functions returning the loss value and its gradient w.r.t. the input

use crate::error::{Error, Result};
use ndarray::{Array2, ArrayD, Axis, Ix2};
use serde::{Deserialize, Serialize};

/// How a loss combines per-example terms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossReduction {
    /// Average over the batch; each example's gradient is scaled by `1/B`
    #[default]
    Mean,
    /// Plain sum over the batch
    Sum,
}

/// Softmax cross-entropy of `logits [batch, classes]` against class indices
pub fn cross_entropy(logits: &ArrayD<f32>, targets: &[usize]) -> Result<(f32, ArrayD<f32>)> {
    cross_entropy_with(logits, targets, LossReduction::Mean)
}

/// [`cross_entropy`] with an explicit reduction
pub fn cross_entropy_with(
    logits: &ArrayD<f32>,
    targets: &[usize],
    reduction: LossReduction,
) -> Result<(f32, ArrayD<f32>)> {
    let logits = logits.view().into_dimensionality::<Ix2>()?;
    let (batch, classes) = logits.dim();
    if targets.len() != batch {
        return Err(Error::Shape(format!(
            "{batch} logits rows but {} targets",
            targets.len()
        )));
    }
    if let Some(&bad) = targets.iter().find(|&&t| t >= classes) {
        return Err(Error::Shape(format!(
            "target class {bad} out of range for {classes} classes"
        )));
    }

    let max = logits.map_axis(Axis(1), |row| {
        row.fold(f32::NEG_INFINITY, |a, &b| a.max(b))
    });
    let mut probs: Array2<f32> = &logits - &max.insert_axis(Axis(1));
    probs.mapv_inplace(f32::exp);
    let norm = probs.sum_axis(Axis(1));
    probs /= &norm.insert_axis(Axis(1));

    let mut loss = 0.0;
    for (row, &target) in targets.iter().enumerate() {
        loss -= probs[[row, target]].max(f32::MIN_POSITIVE).ln();
        probs[[row, target]] -= 1.0;
    }

    let scale = match reduction {
        LossReduction::Mean => 1.0 / batch.max(1) as f32,
        LossReduction::Sum => 1.0,
    };
    Ok((loss * scale, (probs * scale).into_dyn()))
}

/// Squared error, averaged over every element
pub fn mse(pred: &ArrayD<f32>, target: &ArrayD<f32>) -> Result<(f32, ArrayD<f32>)> {
    if pred.shape() != target.shape() {
        return Err(Error::Shape(format!(
            "prediction {:?} vs target {:?}",
            pred.shape(),
            target.shape()
        )));
    }
    let n = pred.len().max(1) as f32;
    let diff = pred - target;
    let loss = diff.mapv(|d| d * d).sum() / n;
    Ok((loss, diff * (2.0 / n)))
}
