//! Model compatibility checks for per-example gradients.

use tracing::warn;

use super::grad_sample;
use crate::error::{Error, Result};
use crate::nn::{GroupNorm, LayerKind, Module, Sequential};

/// How the validator treats one leaf layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    /// Per-example gradients can be reconstructed
    Supported,
    /// Attaching would give wrong per-example gradients
    Unsupported,
    /// No trainable parameters, nothing to capture
    Ignored,
}

/// A layer the engine cannot attach to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub layer_name: String,
    pub layer_type: String,
}

impl Violation {
    fn new(layer_name: String, layer: &dyn Module) -> Self {
        Self {
            layer_name,
            layer_type: layer.kind().to_string(),
        }
    }
}

impl From<Violation> for Error {
    fn from(v: Violation) -> Self {
        Error::IncompatibleModule {
            layer_name: v.layer_name,
            layer_type: v.layer_type,
        }
    }
}

/// Walks a model's named layers and classifies each leaf
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelValidator;

impl ModelValidator {
    /// Classify a single leaf layer
    pub fn classify(layer: &dyn Module) -> Support {
        match layer.kind() {
            // the forward pass couples examples whether or not the affine part trains
            LayerKind::BatchNorm { .. } => Support::Unsupported,
            LayerKind::InstanceNorm { track_running_stats: true, .. } => Support::Unsupported,
            _ if !layer.has_trainable_parameters() => Support::Ignored,
            kind if grad_sample::supports(&kind) => Support::Supported,
            _ => Support::Unsupported,
        }
    }

    /// Fail on the first unsupported layer, in depth-first order
    pub fn validate(model: &Sequential) -> Result<()> {
        let unsupported =
            Self::leaves(model).find(|(_, layer)| Self::classify(*layer) == Support::Unsupported);
        match unsupported {
            Some((name, layer)) => {
                let violation = Violation::new(name, layer);
                warn!(
                    layer = %violation.layer_name,
                    kind = %violation.layer_type,
                    "incompatible layer"
                );
                Err(violation.into())
            }
            None => Ok(()),
        }
    }

    /// Every unsupported layer, for reporting
    pub fn inspect(model: &Sequential) -> Vec<Violation> {
        Self::leaves(model)
            .filter(|(_, layer)| Self::classify(*layer) == Support::Unsupported)
            .map(|(name, layer)| Violation::new(name, layer))
            .collect()
    }

    fn leaves(model: &Sequential) -> impl Iterator<Item = (String, &dyn Module)> {
        model
            .named_modules()
            .into_iter()
            .filter(|(_, layer)| layer.children().is_empty())
    }
}

/// Largest group count not above 32 that divides `channels`
fn group_count(channels: usize) -> usize {
    (1..=channels.min(32)).rev().find(|g| channels % g == 0).unwrap_or(1)
}

/// Replace every `BatchNorm` with an equivalent-width `GroupNorm`
///
/// Returns how many layers were replaced. Parameters of the new layers carry
/// the replaced layer's dotted path.
pub fn convert_batch_norm(model: &mut Sequential) -> Result<usize> {
    fn convert(prefix: &str, module: &mut dyn Module) -> Result<usize> {
        let Some(children) = module.children_mut() else {
            return Ok(0);
        };
        let mut replaced = 0;
        for (name, child) in children.iter_mut() {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            if let LayerKind::BatchNorm { num_features, .. } = child.kind() {
                let mut norm = GroupNorm::new(group_count(num_features), num_features)?;
                for param in norm.parameters_mut() {
                    param.qualify(&path);
                }
                *child = Box::new(norm);
                replaced += 1;
            } else {
                replaced += convert(&path, child.as_mut())?;
            }
        }
        Ok(replaced)
    }
    convert("", model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{BatchNorm, Conv2d, Flatten, InstanceNorm, LayerNorm, Linear, ReLU};

    #[test]
    fn test_classify() {
        let classify = ModelValidator::classify;
        assert_eq!(classify(&Linear::new(2, 2, true)), Support::Supported);
        assert_eq!(classify(&ReLU::new()), Support::Ignored);
        assert_eq!(classify(&BatchNorm::new(4)), Support::Unsupported);
        assert_eq!(classify(&InstanceNorm::new(4, true, false)), Support::Supported);
        assert_eq!(classify(&InstanceNorm::new(4, true, true)), Support::Unsupported);
        assert_eq!(classify(&InstanceNorm::new(4, false, false)), Support::Ignored);
    }

    #[test]
    fn test_frozen_layer_is_ignored() {
        let mut fc = Linear::new(2, 2, true);
        for p in fc.parameters_mut() {
            p.set_requires_grad(false);
        }
        assert_eq!(ModelValidator::classify(&fc), Support::Ignored);

        let mut bn = BatchNorm::new(2);
        for p in bn.parameters_mut() {
            p.set_requires_grad(false);
        }
        assert_eq!(ModelValidator::classify(&bn), Support::Unsupported);
    }

    #[test]
    fn test_validate_reports_first_violation() {
        let model = Sequential::new()
            .add("conv", Conv2d::new(1, 4, 3, 1))
            .add("bn", BatchNorm::new(4))
            .add("block", Sequential::new().add("bn2", BatchNorm::new(4)))
            .add("flat", Flatten::new(1));
        let err = ModelValidator::validate(&model).unwrap_err();
        assert!(matches!(
            err,
            Error::IncompatibleModule { ref layer_name, ref layer_type }
                if layer_name == "bn" && layer_type == "BatchNorm"
        ));

        let all = ModelValidator::inspect(&model);
        let names: Vec<&str> = all.iter().map(|v| v.layer_name.as_str()).collect();
        assert_eq!(names, ["bn", "block.bn2"]);
    }

    #[test]
    fn test_validate_accepts_supported_model() {
        let model = Sequential::new()
            .add("fc", Linear::new(4, 4, true))
            .add("ln", LayerNorm::new(&[4]))
            .add("relu", ReLU::new());
        assert!(ModelValidator::validate(&model).is_ok());
        assert!(ModelValidator::inspect(&model).is_empty());
    }

    #[test]
    fn test_group_count() {
        assert_eq!(group_count(64), 32);
        assert_eq!(group_count(16), 16);
        assert_eq!(group_count(48), 24);
        assert_eq!(group_count(37), 1);
    }

    #[test]
    fn test_convert_batch_norm() {
        let mut model = Sequential::new()
            .add("conv", Conv2d::new(1, 4, 3, 1))
            .add("bn", BatchNorm::new(4))
            .add("block", Sequential::new().add("bn", BatchNorm::new(64)));
        assert_eq!(convert_batch_norm(&mut model).unwrap(), 2);
        assert!(ModelValidator::validate(&model).is_ok());

        let names: Vec<&str> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            ["conv.weight", "conv.bias", "bn.weight", "bn.bias", "block.bn.weight", "block.bn.bias"]
        );
        let kinds: Vec<String> = model
            .named_modules()
            .into_iter()
            .map(|(_, m)| m.kind().to_string())
            .collect();
        assert_eq!(kinds, ["Conv2d", "GroupNorm", "Sequential", "GroupNorm"]);
    }
}
