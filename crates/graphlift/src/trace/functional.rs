//! Origin-namespace operator vocabulary.
//!
//! Each routine runs the eager kernel on the host tensor and records a single
//! `aten::*` node, so tracing a model is the same act as executing it.

use std::collections::BTreeMap;

use anyhow::{bail, ensure, Result};

use crate::ir::{Attribute, QualName};
use crate::tensor::Tensor;
use crate::trace::{TraceTensor, Tracer};

const SELU_ALPHA: f32 = 1.673_263_2;
const SELU_SCALE: f32 = 1.050_701_0;

/// Applies SELU: `scale * (max(0, x) + min(0, alpha * (exp(x) - 1)))`.
pub fn selu(tracer: &mut Tracer, x: &TraceTensor) -> Result<TraceTensor> {
    let out = x.data().map_f32(|v| {
        if v > 0.0 {
            SELU_SCALE * v
        } else {
            SELU_SCALE * SELU_ALPHA * (v.exp() - 1.0)
        }
    })?;
    Ok(tracer.emit(QualName::new("aten", "selu"), &[x], BTreeMap::new(), out))
}

/// Applies CELU: `max(0, x) + min(0, alpha * (exp(x / alpha) - 1))`.
pub fn celu(tracer: &mut Tracer, x: &TraceTensor, alpha: f32) -> Result<TraceTensor> {
    ensure!(alpha != 0.0, "celu alpha must be non-zero");
    let out = x.data().map_f32(|v| {
        let neg = alpha * ((v / alpha).exp() - 1.0);
        v.max(0.0) + neg.min(0.0)
    })?;
    let attrs = BTreeMap::from([("alpha".to_string(), Attribute::Float(alpha as f64))]);
    Ok(tracer.emit(QualName::new("aten", "celu"), &[x], attrs, out))
}

/// Applies layer normalization over the trailing `normalized_shape` axes,
/// with affine weight and bias. Variance is biased, matching the eager
/// framework semantics.
pub fn layer_norm(
    tracer: &mut Tracer,
    x: &TraceTensor,
    weight: &TraceTensor,
    bias: &TraceTensor,
    normalized_shape: &[usize],
    eps: f32,
) -> Result<TraceTensor> {
    let dims = x.data().shape().dims();
    ensure!(
        normalized_shape.len() <= dims.len(),
        "normalized_shape rank {} exceeds input rank {}",
        normalized_shape.len(),
        dims.len()
    );
    let suffix = &dims[dims.len() - normalized_shape.len()..];
    if suffix != normalized_shape {
        bail!(
            "normalized_shape {:?} does not match input suffix {:?}",
            normalized_shape,
            suffix
        );
    }
    ensure!(
        weight.data().shape().dims() == normalized_shape
            && bias.data().shape().dims() == normalized_shape,
        "weight and bias must match normalized_shape {:?}",
        normalized_shape
    );

    let values = x.data().as_f32()?;
    let w = weight.data().as_f32()?;
    let b = bias.data().as_f32()?;
    let inner: usize = normalized_shape.iter().product();
    let outer = values.len() / inner.max(1);
    let mut out = vec![0.0f32; values.len()];
    for row in 0..outer {
        let slice = &values[row * inner..(row + 1) * inner];
        let mean = slice.iter().sum::<f32>() / inner as f32;
        let var = slice.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / inner as f32;
        let inv_stddev = 1.0 / (var + eps).sqrt();
        for (col, value) in slice.iter().enumerate() {
            out[row * inner + col] = (value - mean) * inv_stddev * w[col] + b[col];
        }
    }

    let result = Tensor::from_vec(x.data().shape().clone(), out)?;
    let attrs = BTreeMap::from([
        (
            "normalized_shape".to_string(),
            Attribute::Ints(normalized_shape.iter().map(|d| *d as i64).collect()),
        ),
        ("eps".to_string(), Attribute::Float(eps as f64)),
    ]);
    Ok(tracer.emit(
        QualName::new("aten", "layer_norm"),
        &[x, weight, bias],
        attrs,
        result,
    ))
}

/// Records dropout. In eval mode the eager result is the identity and the
/// node carries `train = 0`, which the lowering engine maps to `Identity`.
pub fn dropout(tracer: &mut Tracer, x: &TraceTensor, p: f32, training: bool) -> Result<TraceTensor> {
    ensure!((0.0..1.0).contains(&p), "dropout probability must be in [0, 1)");
    let out = if training {
        bail!("tracing training-mode dropout is not supported; put the model in eval mode");
    } else {
        x.data().clone()
    };
    let attrs = BTreeMap::from([
        ("p".to_string(), Attribute::Float(p as f64)),
        ("train".to_string(), Attribute::Int(0)),
    ]);
    Ok(tracer.emit(QualName::new("aten", "dropout"), &[x], attrs, out))
}

/// Elementwise addition of same-shape tensors.
pub fn add(tracer: &mut Tracer, a: &TraceTensor, b: &TraceTensor) -> Result<TraceTensor> {
    ensure!(
        a.data().shape() == b.data().shape(),
        "add requires matching shapes, found {:?} and {:?}",
        a.data().shape().dims(),
        b.data().shape().dims()
    );
    let lhs = a.data().as_f32()?;
    let rhs = b.data().as_f32()?;
    let out = Tensor::from_vec(
        a.data().shape().clone(),
        lhs.iter().zip(rhs.iter()).map(|(x, y)| x + y).collect(),
    )?;
    Ok(tracer.emit(QualName::new("aten", "add"), &[a, b], BTreeMap::new(), out))
}

/// Applies hard shrinkage: `x` where `|x| > lambda`, else zero. There is no
/// builtin mapping for this op at opset 15, so exporting it exercises the
/// unresolved-operator path unless a custom replacement is registered.
pub fn hardshrink(tracer: &mut Tracer, x: &TraceTensor, lambda: f32) -> Result<TraceTensor> {
    let out = x
        .data()
        .map_f32(|v| if v.abs() > lambda { v } else { 0.0 })?;
    let attrs = BTreeMap::from([("lambda".to_string(), Attribute::Float(lambda as f64))]);
    Ok(tracer.emit(QualName::new("aten", "hardshrink"), &[x], attrs, out))
}
