//! Ordered container of named layers

use super::module::{HookTable, LayerKind, Module};
use super::parameter::Parameter;
use crate::error::{Error, Result};
use ndarray::ArrayD;
use std::fmt;

/// Runs its children in order; the root instance also owns the hook table
/// consulted during [`Sequential::backprop`]
#[derive(Default)]
pub struct Sequential {
    layers: Vec<(String, Box<dyn Module>)>,
    hooks: HookTable,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named layer, qualifying its parameter names with `name`
    pub fn add(mut self, name: &str, mut layer: impl Module + 'static) -> Self {
        for param in layer.parameters_mut() {
            param.qualify(name);
        }
        self.layers.push((name.to_string(), Box::new(layer)));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Every descendant layer with its dotted path, depth first
    pub fn named_modules(&self) -> Vec<(String, &dyn Module)> {
        fn walk<'a>(prefix: &str, module: &'a dyn Module, out: &mut Vec<(String, &'a dyn Module)>) {
            for (name, child) in module.children() {
                let path = if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{prefix}.{name}")
                };
                out.push((path.clone(), child));
                walk(&path, child, out);
            }
        }
        let mut out = Vec::new();
        walk("", self, &mut out);
        out
    }

    /// Parameters paired with their qualified names
    pub fn named_parameters(&self) -> Vec<(&str, &Parameter)> {
        self.parameters().into_iter().map(|p| (p.name(), p)).collect()
    }

    /// Clear the batch gradient of every parameter
    pub fn zero_grad(&mut self) {
        for param in self.parameters_mut() {
            param.zero_grad();
        }
    }

    /// Copy parameter values (not gradients) from a model of identical structure
    pub fn copy_parameters_from(&mut self, other: &Sequential) -> Result<()> {
        let source = other.parameters();
        let mut target = self.parameters_mut();
        if source.len() != target.len() {
            return Err(Error::Shape(format!(
                "cannot copy {} parameters into {}",
                source.len(),
                target.len()
            )));
        }
        for (dst, src) in target.iter_mut().zip(source) {
            if dst.name() != src.name() || dst.shape() != src.shape() {
                return Err(Error::Shape(format!(
                    "parameter mismatch: {} {:?} vs {} {:?}",
                    dst.name(),
                    dst.shape(),
                    src.name(),
                    src.shape()
                )));
            }
            dst.data_mut().assign(src.data());
        }
        Ok(())
    }

    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HookTable {
        &mut self.hooks
    }

    /// Backward pass from the loss gradient w.r.t. the model output, firing
    /// this model's hooks; returns the gradient w.r.t. the model input
    pub fn backprop(&mut self, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.hooks.begin_pass();
        let Self { layers, hooks } = self;
        backward_layers(layers, grad_output, hooks)
    }
}

fn backward_layers(
    layers: &mut [(String, Box<dyn Module>)],
    grad_output: &ArrayD<f32>,
    hooks: &mut HookTable,
) -> Result<ArrayD<f32>> {
    let mut grad = grad_output.clone();
    for (_, layer) in layers.iter_mut().rev() {
        grad = layer.backward(&grad, hooks)?;
    }
    Ok(grad)
}

impl Module for Sequential {
    fn kind(&self) -> LayerKind {
        LayerKind::Sequential
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut x = input.clone();
        for (_, layer) in &mut self.layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    fn backward(
        &mut self,
        grad_output: &ArrayD<f32>,
        hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        backward_layers(&mut self.layers, grad_output, hooks)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.layers.iter().flat_map(|(_, l)| l.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layers.iter_mut().flat_map(|(_, l)| l.parameters_mut()).collect()
    }

    fn children(&self) -> Vec<(&str, &dyn Module)> {
        self.layers.iter().map(|(n, l)| (n.as_str(), l.as_ref())).collect()
    }

    fn children_mut(&mut self) -> Option<&mut Vec<(String, Box<dyn Module>)>> {
        Some(&mut self.layers)
    }

    fn set_training(&mut self, training: bool) {
        for (_, layer) in &mut self.layers {
            layer.set_training(training);
        }
    }
}

impl fmt::Debug for Sequential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layers: Vec<String> = self
            .layers
            .iter()
            .map(|(n, l)| format!("{n}: {}", l.kind()))
            .collect();
        f.debug_struct("Sequential")
            .field("layers", &layers)
            .field("hooks", &self.hooks)
            .finish()
    }
}
