//! Trainable parameters and their per-example gradient buffers

use ndarray::{ArrayD, IxDyn};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

/// Stable identity of a parameter, used as the key of the backward hook table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u64);

impl ParamId {
    fn next() -> Self {
        Self(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which slot of its layer a parameter fills
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    Weight,
    Bias,
}

/// Per-example gradient buffer of shape `[batch, ..param_shape]`
///
/// The allocation is reused across steps whenever the batch shape repeats.
/// A sample is *live* from the moment a backward hook writes it until the
/// privacy step consumes it; reading a consumed sample is a stale read.
#[derive(Debug, Clone, Default)]
pub struct GradSample {
    buffer: Option<ArrayD<f32>>,
    live: bool,
    pass: u64,
}

impl GradSample {
    /// Zeroed buffer of the requested shape, reusing the previous allocation if possible
    pub fn prepare(&mut self, shape: &[usize]) -> &mut ArrayD<f32> {
        self.live = false;
        if !matches!(&self.buffer, Some(buf) if buf.shape() == shape) {
            self.buffer = None;
        }
        let buf = self
            .buffer
            .get_or_insert_with(|| ArrayD::zeros(IxDyn(shape)));
        buf.fill(0.0);
        buf
    }

    /// Mark the prepared buffer as written by backward pass `pass`
    pub fn commit(&mut self, pass: u64) {
        self.live = self.buffer.is_some();
        self.pass = pass;
    }

    /// The sample, only while it is live
    pub fn live(&self) -> Option<&ArrayD<f32>> {
        if self.live {
            self.buffer.as_ref()
        } else {
            None
        }
    }

    /// Whether a sample was written and not yet consumed
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Whether a buffer was ever written, live or not
    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    /// Backward pass that wrote the current sample
    pub fn pass(&self) -> u64 {
        self.pass
    }

    /// Number of examples in the live sample
    pub fn batch_size(&self) -> Option<usize> {
        self.live().map(|buf| buf.shape()[0])
    }

    /// Invalidate the sample but keep the allocation for the next step
    pub fn consume(&mut self) {
        self.live = false;
    }

    /// Drop the buffer entirely
    pub fn clear(&mut self) {
        self.buffer = None;
        self.live = false;
        self.pass = 0;
    }
}

/// A named trainable tensor owned by a layer
#[derive(Debug, Clone)]
pub struct Parameter {
    id: ParamId,
    name: String,
    role: ParamRole,
    data: ArrayD<f32>,
    grad: Option<ArrayD<f32>>,
    grad_sample: GradSample,
    requires_grad: bool,
}

impl Parameter {
    /// Create a new trainable parameter
    pub fn new(name: impl Into<String>, role: ParamRole, data: ArrayD<f32>) -> Self {
        Self {
            id: ParamId::next(),
            name: name.into(),
            role,
            data,
            grad: None,
            grad_sample: GradSample::default(),
            requires_grad: true,
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    /// Qualified name, e.g. `conv1.weight`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prepend a container prefix to the name
    pub fn qualify(&mut self, prefix: &str) {
        self.name = format!("{prefix}.{}", self.name);
    }

    pub fn role(&self) -> ParamRole {
        self.role
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Freeze or unfreeze the parameter
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if !requires_grad {
            self.grad = None;
            self.grad_sample.clear();
        }
    }

    pub fn grad(&self) -> Option<&ArrayD<f32>> {
        self.grad.as_ref()
    }

    /// Replace the batch gradient
    pub fn set_grad(&mut self, grad: ArrayD<f32>) {
        self.grad = Some(grad);
    }

    /// Add to the batch gradient (gradients accumulate until `zero_grad`)
    pub fn accumulate_grad(&mut self, grad: ArrayD<f32>) {
        match &mut self.grad {
            Some(existing) => *existing += &grad,
            None => self.grad = Some(grad),
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    pub fn grad_sample(&self) -> &GradSample {
        &self.grad_sample
    }

    pub fn grad_sample_mut(&mut self) -> &mut GradSample {
        &mut self.grad_sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_param_ids_are_unique() {
        let a = Parameter::new("weight", ParamRole::Weight, arr1(&[1.0]).into_dyn());
        let b = Parameter::new("weight", ParamRole::Weight, arr1(&[1.0]).into_dyn());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_qualify_name() {
        let mut p = Parameter::new("bias", ParamRole::Bias, arr1(&[0.0]).into_dyn());
        p.qualify("fc1");
        p.qualify("block");
        assert_eq!(p.name(), "block.fc1.bias");
    }

    #[test]
    fn test_accumulate_grad() {
        let mut p = Parameter::new("w", ParamRole::Weight, arr1(&[1.0, 2.0]).into_dyn());
        p.accumulate_grad(arr1(&[0.5, 0.5]).into_dyn());
        p.accumulate_grad(arr1(&[0.25, 1.0]).into_dyn());
        let grad = p.grad().unwrap();
        assert_eq!(grad.as_slice().unwrap(), &[0.75, 1.5]);

        p.zero_grad();
        assert!(p.grad().is_none());
    }

    #[test]
    fn test_freeze_drops_gradients() {
        let mut p = Parameter::new("w", ParamRole::Weight, arr1(&[1.0]).into_dyn());
        p.set_grad(arr1(&[3.0]).into_dyn());
        p.grad_sample_mut().prepare(&[2, 1]);
        p.grad_sample_mut().commit(1);

        p.set_requires_grad(false);
        assert!(p.grad().is_none());
        assert!(!p.grad_sample().is_allocated());
    }

    #[test]
    fn test_grad_sample_lifecycle() {
        let mut sample = GradSample::default();
        assert!(sample.live().is_none());

        sample.prepare(&[4, 3])[[1, 2]] = 7.0;
        assert!(!sample.is_live());
        sample.commit(5);
        assert_eq!(sample.batch_size(), Some(4));
        assert_eq!(sample.pass(), 5);
        assert_eq!(sample.live().unwrap()[[1, 2]], 7.0);

        sample.consume();
        assert!(sample.live().is_none());
        assert!(sample.is_allocated());
    }

    #[test]
    fn test_grad_sample_reuses_and_zeroes_buffer() {
        let mut sample = GradSample::default();
        let ptr = {
            let buf = sample.prepare(&[2, 2]);
            buf.fill(1.0);
            buf.as_ptr()
        };
        sample.commit(1);
        sample.consume();

        let buf = sample.prepare(&[2, 2]);
        assert_eq!(buf.as_ptr(), ptr);
        assert!(buf.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_grad_sample_reallocates_on_new_shape() {
        let mut sample = GradSample::default();
        sample.prepare(&[2, 3]).fill(5.0);
        sample.commit(1);

        let buf = sample.prepare(&[4, 3]);
        assert_eq!(buf.shape(), &[4, 3]);
        assert!(buf.iter().all(|&v| v == 0.0));
        assert!(!sample.is_live());

        sample.commit(2);
        assert_eq!(sample.batch_size(), Some(4));
    }
}
