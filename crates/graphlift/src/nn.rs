//! Minimal module layer used by export scenarios.
//!
//! Modules run through a [`Tracer`], so a single `forward` drives both the
//! eager result and the recorded graph.

use anyhow::{ensure, Result};

use crate::ir::Shape;
use crate::tensor::Tensor;
use crate::trace::{functional, TraceTensor, Tracer};

/// A traceable model component. `forward` consumes handles produced by the
/// tracer and returns the output handles in a fixed order.
pub trait Module {
    fn forward(&self, tracer: &mut Tracer, inputs: &[TraceTensor]) -> Result<Vec<TraceTensor>>;

    /// Switches train/eval behaviour for stochastic layers. Default is a
    /// no-op for stateless modules.
    fn set_training(&mut self, _training: bool) {}
}

/// SELU activation.
#[derive(Debug, Default)]
pub struct Selu;

impl Module for Selu {
    fn forward(&self, tracer: &mut Tracer, inputs: &[TraceTensor]) -> Result<Vec<TraceTensor>> {
        ensure!(inputs.len() == 1, "Selu expects one input");
        Ok(vec![functional::selu(tracer, &inputs[0])?])
    }
}

/// CELU activation with a configurable alpha.
#[derive(Debug)]
pub struct Celu {
    alpha: f32,
}

impl Celu {
    pub fn new(alpha: f32) -> Self {
        Self { alpha }
    }
}

impl Module for Celu {
    fn forward(&self, tracer: &mut Tracer, inputs: &[TraceTensor]) -> Result<Vec<TraceTensor>> {
        ensure!(inputs.len() == 1, "Celu expects one input");
        Ok(vec![functional::celu(tracer, &inputs[0], self.alpha)?])
    }
}

/// Layer normalization over the trailing `normalized_shape` axes with affine
/// weight and bias parameters.
#[derive(Debug)]
pub struct LayerNorm {
    name: String,
    normalized_shape: Vec<usize>,
    eps: f32,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    /// Creates a layer with unit weight and zero bias, like the framework
    /// default. `name` scopes the parameter names in the traced graph.
    pub fn new(name: impl Into<String>, normalized_shape: Vec<usize>, eps: f32) -> Self {
        let shape = Shape::new(normalized_shape.clone());
        Self {
            name: name.into(),
            normalized_shape,
            eps,
            weight: Tensor::ones(shape.clone()),
            bias: Tensor::zeros(shape),
        }
    }

    pub fn with_parameters(mut self, weight: Tensor, bias: Tensor) -> Self {
        self.weight = weight;
        self.bias = bias;
        self
    }
}

impl Module for LayerNorm {
    fn forward(&self, tracer: &mut Tracer, inputs: &[TraceTensor]) -> Result<Vec<TraceTensor>> {
        ensure!(inputs.len() == 1, "LayerNorm expects one input");
        let weight = tracer.param(format!("{}.weight", self.name), self.weight.clone());
        let bias = tracer.param(format!("{}.bias", self.name), self.bias.clone());
        Ok(vec![functional::layer_norm(
            tracer,
            &inputs[0],
            &weight,
            &bias,
            &self.normalized_shape,
            self.eps,
        )?])
    }
}

/// Dropout layer. Deterministic identity in eval mode; tracing in train mode
/// is rejected by the functional op.
#[derive(Debug)]
pub struct Dropout {
    p: f32,
    training: bool,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        Self { p, training: true }
    }
}

impl Module for Dropout {
    fn forward(&self, tracer: &mut Tracer, inputs: &[TraceTensor]) -> Result<Vec<TraceTensor>> {
        ensure!(inputs.len() == 1, "Dropout expects one input");
        Ok(vec![functional::dropout(
            tracer,
            &inputs[0],
            self.p,
            self.training,
        )?])
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
