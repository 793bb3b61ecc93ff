//! Minimal layer library with explicit backward passes and per-parameter hooks

mod activation;
mod conv;
mod embedding;
mod linear;
pub mod loss;
mod module;
pub(crate) mod norm;
mod parameter;
mod sequential;
pub(crate) mod shape;

#[cfg(test)]
pub(crate) mod test_utils;

pub use activation::{Flatten, ReLU};
pub use conv::{Conv1d, Conv2d};
pub use embedding::Embedding;
pub(crate) use embedding::token_ids;
pub use linear::Linear;
pub use loss::{cross_entropy, cross_entropy_with, mse, LossReduction};
pub use module::{BackwardContext, BackwardHook, HookTable, LayerKind, Module};
pub use norm::{BatchNorm, GroupNorm, InstanceNorm, LayerNorm};
pub use parameter::{GradSample, ParamId, ParamRole, Parameter};
pub use sequential::Sequential;
