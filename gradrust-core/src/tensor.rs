use crate::error::GradRustError;
use crate::types::DType;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;

/// Storage for tensor elements, tagged by dtype.
///
/// The heavy N-dimensional machinery (strides, broadcasting, reductions)
/// is provided by `ndarray`; this enum only selects the element kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
}

/// A thin wrapper over the array primitive, carrying the `requires_grad`
/// flag that drives optional gradient computation.
///
/// Tensors are never mutated by the function units: every forward and
/// backward returns freshly allocated outputs. Accumulating gradients into
/// parameter slots is the job of the calling orchestration layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: TensorData,
    requires_grad: bool,
}

impl Tensor {
    /// Wraps an existing float array. `requires_grad` defaults to false.
    pub fn from_array(data: ArrayD<f32>) -> Self {
        Tensor {
            data: TensorData::F32(data),
            requires_grad: false,
        }
    }

    /// Wraps an existing integer index array.
    pub fn from_index_array(data: ArrayD<i64>) -> Self {
        Tensor {
            data: TensorData::I64(data),
            requires_grad: false,
        }
    }

    /// Creates a float tensor from a flat `Vec` and a shape.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self, GradRustError> {
        let data_len = data.len();
        let array = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| {
            GradRustError::TensorCreationError {
                data_len,
                shape: shape.to_vec(),
            }
        })?;
        Ok(Tensor::from_array(array))
    }

    /// Creates an integer index tensor from a flat `Vec` and a shape.
    pub fn from_index_vec(data: Vec<i64>, shape: &[usize]) -> Result<Self, GradRustError> {
        let data_len = data.len();
        let array = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| {
            GradRustError::TensorCreationError {
                data_len,
                shape: shape.to_vec(),
            }
        })?;
        Ok(Tensor::from_index_array(array))
    }

    /// Creates a float tensor filled with zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Tensor::from_array(ArrayD::zeros(IxDyn(shape)))
    }

    /// Creates a float tensor filled with ones.
    pub fn ones(shape: &[usize]) -> Self {
        Tensor::from_array(ArrayD::ones(IxDyn(shape)))
    }

    /// Creates a float tensor with elements drawn from a standard normal
    /// distribution. Used by tests and gradient checks.
    pub fn randn(shape: &[usize]) -> Self {
        let mut rng = rand::thread_rng();
        Tensor::from_array(ArrayD::from_shape_fn(IxDyn(shape), |_| {
            rng.sample(StandardNormal)
        }))
    }

    /// Builder-style variant of [`set_requires_grad`](Tensor::set_requires_grad).
    pub fn requiring_grad(mut self) -> Self {
        self.requires_grad = true;
        self
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn dtype(&self) -> DType {
        match &self.data {
            TensorData::F32(_) => DType::F32,
            TensorData::I64(_) => DType::I64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match &self.data {
            TensorData::F32(a) => a.shape(),
            TensorData::I64(a) => a.shape(),
        }
    }

    /// Number of axes (rank) of the tensor.
    pub fn n_axes(&self) -> usize {
        self.shape().len()
    }

    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Borrows the float data, or reports a dtype mismatch naming `operation`.
    pub fn as_f32(&self, operation: &str) -> Result<&ArrayD<f32>, GradRustError> {
        match &self.data {
            TensorData::F32(a) => Ok(a),
            TensorData::I64(_) => Err(GradRustError::DTypeMismatch {
                expected: DType::F32,
                actual: DType::I64,
                operation: operation.to_string(),
            }),
        }
    }

    /// Borrows the integer index data, or reports a dtype mismatch.
    pub fn as_i64(&self, operation: &str) -> Result<&ArrayD<i64>, GradRustError> {
        match &self.data {
            TensorData::I64(a) => Ok(a),
            TensorData::F32(_) => Err(GradRustError::DTypeMismatch {
                expected: DType::I64,
                actual: DType::F32,
                operation: operation.to_string(),
            }),
        }
    }

    /// Copies the float data out as a flat `Vec` in logical order.
    pub fn to_vec_f32(&self, operation: &str) -> Result<Vec<f32>, GradRustError> {
        Ok(self.as_f32(operation)?.iter().copied().collect())
    }
}
