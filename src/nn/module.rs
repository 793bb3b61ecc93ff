//! Layer trait, layer kinds and the backward hook table

use super::parameter::{ParamId, Parameter};
use crate::error::Result;
use ndarray::ArrayD;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Declared type of a layer, with the attributes per-example samplers need
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Linear,
    Conv1d {
        kernel: usize,
        stride: usize,
        padding: usize,
    },
    Conv2d {
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    },
    Embedding { num_embeddings: usize },
    LayerNorm { normalized_dims: usize, eps: f32 },
    GroupNorm { groups: usize, eps: f32 },
    InstanceNorm { eps: f32, track_running_stats: bool },
    BatchNorm { num_features: usize, eps: f32 },
    ReLU,
    Flatten { start_dim: usize },
    Sequential,
    /// A user-defined layer the library knows nothing about
    Custom(String),
}

impl LayerKind {
    /// Type name used in diagnostics
    pub fn type_name(&self) -> &str {
        match self {
            Self::Linear => "Linear",
            Self::Conv1d { .. } => "Conv1d",
            Self::Conv2d { .. } => "Conv2d",
            Self::Embedding { .. } => "Embedding",
            Self::LayerNorm { .. } => "LayerNorm",
            Self::GroupNorm { .. } => "GroupNorm",
            Self::InstanceNorm { .. } => "InstanceNorm",
            Self::BatchNorm { .. } => "BatchNorm",
            Self::ReLU => "ReLU",
            Self::Flatten { .. } => "Flatten",
            Self::Sequential => "Sequential",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A differentiable layer
///
/// Leaf layers save their input during `forward`, and during `backward`
/// accumulate batch gradients into their trainable parameters and then hand
/// each of them to the hook table together with the saved input and the
/// output gradient.
pub trait Module {
    /// Declared type of this layer
    fn kind(&self) -> LayerKind;

    /// Forward pass over a batch whose first axis is the example axis
    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>>;

    /// Backward pass: returns the gradient w.r.t. the layer input
    fn backward(
        &mut self,
        grad_output: &ArrayD<f32>,
        hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>>;

    /// Parameters owned directly or through children
    fn parameters(&self) -> Vec<&Parameter>;

    /// Mutable parameters owned directly or through children
    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// Named child layers (empty for leaves)
    fn children(&self) -> Vec<(&str, &dyn Module)> {
        Vec::new()
    }

    /// Mutable access to the child list of a container
    fn children_mut(&mut self) -> Option<&mut Vec<(String, Box<dyn Module>)>> {
        None
    }

    /// Switch between training and evaluation behavior
    fn set_training(&mut self, _training: bool) {}

    /// Whether the layer owns at least one trainable parameter
    fn has_trainable_parameters(&self) -> bool {
        self.parameters().iter().any(|p| p.requires_grad())
    }
}

/// What a backward hook sees for one layer in one backward pass
#[derive(Debug, Clone, Copy)]
pub struct BackwardContext<'a> {
    pub kind: &'a LayerKind,
    /// Input saved by the layer's forward pass, `[batch, ..]`
    pub activation: &'a ArrayD<f32>,
    /// Gradient of the loss w.r.t. the layer output, `[batch, ..]`
    pub backprops: &'a ArrayD<f32>,
    /// Id of the backward pass in progress
    pub pass: u64,
}

/// Callback fired once per trainable parameter right after its batch gradient is computed
pub trait BackwardHook {
    fn on_backward(&mut self, ctx: &BackwardContext<'_>, param: &mut Parameter) -> Result<()>;
}

/// Registration table mapping parameter identity to its backward hook
///
/// Lives on the root container. At most one live capture session may own the
/// table at a time; the table only holds a weak handle on its owner, so a
/// session that was dropped without releasing loses its claim.
#[derive(Default)]
pub struct HookTable {
    hooks: BTreeMap<ParamId, Box<dyn BackwardHook>>,
    owner: Option<(u64, Weak<()>)>,
    pass: u64,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a hook for a parameter, replacing any previous one
    pub fn register(&mut self, id: ParamId, hook: Box<dyn BackwardHook>) {
        self.hooks.insert(id, hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Live capture session currently owning the table
    pub fn session(&self) -> Option<u64> {
        self.owner
            .as_ref()
            .filter(|(_, token)| token.strong_count() > 0)
            .map(|(id, _)| *id)
    }

    /// Claim the table for a session; fails if another live session holds it
    ///
    /// Hooks left behind by a dropped owner are cleared first.
    pub fn claim(&mut self, session: u64, token: &Arc<()>) -> std::result::Result<(), u64> {
        if let Some(owner) = self.session() {
            return Err(owner);
        }
        self.hooks.clear();
        self.owner = Some((session, Arc::downgrade(token)));
        Ok(())
    }

    /// Release the table and drop every hook
    pub fn release(&mut self) {
        self.hooks.clear();
        self.owner = None;
    }

    /// Start a new backward pass and return its id
    pub fn begin_pass(&mut self) -> u64 {
        self.pass += 1;
        self.pass
    }

    /// Id of the latest backward pass
    pub fn pass(&self) -> u64 {
        self.pass
    }

    /// Fire the hooks of `params` for one layer
    pub fn dispatch(
        &mut self,
        kind: &LayerKind,
        activation: &ArrayD<f32>,
        backprops: &ArrayD<f32>,
        params: Vec<&mut Parameter>,
    ) -> Result<()> {
        if self.hooks.is_empty() {
            return Ok(());
        }
        let ctx = BackwardContext {
            kind,
            activation,
            backprops,
            pass: self.pass,
        };
        for param in params {
            if !param.requires_grad() {
                continue;
            }
            if let Some(hook) = self.hooks.get_mut(&param.id()) {
                hook.on_backward(&ctx, param)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for HookTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookTable")
            .field("hooks", &self.hooks.len())
            .field("session", &self.session())
            .field("pass", &self.pass)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::parameter::ParamRole;
    use ndarray::{arr1, IxDyn};
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingHook {
        calls: Rc<Cell<usize>>,
    }

    impl BackwardHook for CountingHook {
        fn on_backward(
            &mut self,
            ctx: &BackwardContext<'_>,
            _param: &mut Parameter,
        ) -> Result<()> {
            assert_eq!(ctx.kind, &LayerKind::Linear);
            self.calls.set(self.calls.get() + 1);
            Ok(())
        }
    }

    fn counting(calls: &Rc<Cell<usize>>) -> Box<dyn BackwardHook> {
        Box::new(CountingHook {
            calls: Rc::clone(calls),
        })
    }

    #[test]
    fn test_layer_kind_names() {
        assert_eq!(LayerKind::Linear.type_name(), "Linear");
        let batch_norm = LayerKind::BatchNorm {
            num_features: 4,
            eps: 1e-5,
        };
        assert_eq!(batch_norm.to_string(), "BatchNorm");
        assert_eq!(LayerKind::Custom("LSTM".into()).type_name(), "LSTM");
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (first, second) = (Arc::new(()), Arc::new(()));
        let mut table = HookTable::new();
        assert!(table.claim(1, &first).is_ok());
        assert_eq!(table.claim(2, &second), Err(1));
        table.release();
        assert!(table.claim(2, &second).is_ok());
        assert_eq!(table.session(), Some(2));
    }

    #[test]
    fn test_dropped_owner_loses_claim() {
        let calls = Rc::new(Cell::new(0));
        let mut param = Parameter::new("w", ParamRole::Weight, arr1(&[1.0]).into_dyn());
        let mut table = HookTable::new();

        let token = Arc::new(());
        table.claim(1, &token).unwrap();
        table.register(param.id(), counting(&calls));
        drop(token);
        assert_eq!(table.session(), None);
        assert_eq!(table.len(), 1);

        let fresh = Arc::new(());
        assert!(table.claim(2, &fresh).is_ok());
        assert!(table.is_empty());
        assert_eq!(table.session(), Some(2));

        let act = ArrayD::zeros(IxDyn(&[1, 1]));
        table
            .dispatch(&LayerKind::Linear, &act, &act, vec![&mut param])
            .unwrap();
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_dispatch_only_registered_trainable_params() {
        let calls = Rc::new(Cell::new(0));
        let mut table = HookTable::new();

        let mut hooked = Parameter::new("w", ParamRole::Weight, arr1(&[1.0]).into_dyn());
        let mut frozen = Parameter::new("w", ParamRole::Weight, arr1(&[1.0]).into_dyn());
        let mut unhooked = Parameter::new("b", ParamRole::Bias, arr1(&[1.0]).into_dyn());
        frozen.set_requires_grad(false);

        table.register(hooked.id(), counting(&calls));
        table.register(frozen.id(), counting(&calls));

        let act = ArrayD::zeros(IxDyn(&[2, 1]));
        let bp = ArrayD::zeros(IxDyn(&[2, 1]));
        let params = vec![&mut hooked, &mut frozen, &mut unhooked];
        table
            .dispatch(&LayerKind::Linear, &act, &bp, params)
            .unwrap();

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_begin_pass_increments() {
        let mut table = HookTable::new();
        assert_eq!(table.pass(), 0);
        assert_eq!(table.begin_pass(), 1);
        assert_eq!(table.begin_pass(), 2);
        assert_eq!(table.pass(), 2);
    }
}
