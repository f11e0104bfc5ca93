//! Host-backed tensor used for eager execution, runtime values, and tests.

use anyhow::{bail, Result};
use rand::Rng;

use crate::ir::{DType, Shape, TensorSpec};

/// Simple host tensor. Payloads cover the dtypes the export pipeline and the
/// reference runtime actually move: f32 data, integer index arrays, and the
/// boolean masks produced by comparison ops.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: TensorData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::I64(values) => values.len(),
            TensorData::Bool(values) => values.len(),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I64(_) => DType::I64,
            TensorData::Bool(_) => DType::Bool,
        }
    }
}

impl Tensor {
    /// Constructs an `F32` tensor from raw values, validating the length
    /// against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor {
            shape,
            data: TensorData::F32(data),
        })
    }

    /// Constructs an `I64` tensor, ensuring the payload matches the expected
    /// element count.
    pub fn from_i64(shape: Shape, data: Vec<i64>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor {
            shape,
            data: TensorData::I64(data),
        })
    }

    /// Constructs a `Bool` tensor.
    pub fn from_bool(shape: Shape, data: Vec<bool>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor {
            shape,
            data: TensorData::Bool(data),
        })
    }

    /// Wraps a single `f32` as a rank-0 tensor.
    pub fn scalar(value: f32) -> Self {
        Tensor {
            shape: Shape::scalar(),
            data: TensorData::F32(vec![value]),
        }
    }

    /// Returns a zero-initialized `F32` tensor of the requested shape.
    pub fn zeros(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor {
            shape,
            data: TensorData::F32(vec![0.0; len]),
        }
    }

    /// Returns a one-initialized `F32` tensor of the requested shape.
    pub fn ones(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor {
            shape,
            data: TensorData::F32(vec![1.0; len]),
        }
    }

    /// Samples from `N(0, std^2)` using the Box-Muller transform.
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng) -> Self {
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            let z0 = r * theta.cos() * std;
            let z1 = r * theta.sin() * std;
            values.push(z0);
            if values.len() < len {
                values.push(z1);
            }
        }
        Tensor {
            shape,
            data: TensorData::F32(values),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn spec(&self) -> TensorSpec {
        TensorSpec::new(self.dtype(), self.shape.clone())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Borrows the `f32` payload, failing on other dtypes.
    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Ok(values),
            other => bail!("expected F32 tensor, found {:?}", other.dtype()),
        }
    }

    /// Borrows the `i64` payload, failing on other dtypes.
    pub fn as_i64(&self) -> Result<&[i64]> {
        match &self.data {
            TensorData::I64(values) => Ok(values),
            other => bail!("expected I64 tensor, found {:?}", other.dtype()),
        }
    }

    /// Borrows the boolean payload, failing on other dtypes.
    pub fn as_bool(&self) -> Result<&[bool]> {
        match &self.data {
            TensorData::Bool(values) => Ok(values),
            other => bail!("expected Bool tensor, found {:?}", other.dtype()),
        }
    }

    /// Applies `f` elementwise to an `F32` tensor, producing a new tensor.
    pub fn map_f32(&self, f: impl Fn(f32) -> f32) -> Result<Self> {
        let values = self.as_f32()?;
        Tensor::from_vec(self.shape.clone(), values.iter().map(|v| f(*v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn from_vec_rejects_length_mismatch() {
        let err = Tensor::from_vec(Shape::new([2, 2]), vec![1.0, 2.0]).unwrap_err();
        assert!(err.to_string().contains("does not match shape"));
    }

    #[test]
    fn randn_fills_requested_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let tensor = Tensor::randn(Shape::new([1, 2, 3, 4]), 1.0, &mut rng);
        assert_eq!(tensor.len(), 24);
        assert_eq!(tensor.dtype(), DType::F32);
    }
}
