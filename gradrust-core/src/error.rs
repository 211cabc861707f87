use crate::types::DType;
use thiserror::Error;

/// Custom error type for the GradRust core.
///
/// Shape and value errors are raised synchronously, before any partial
/// computation, so a failed call never leaves half-written state behind.
#[derive(Error, Debug, PartialEq, Clone)]
pub enum GradRustError {
    #[error("Shape mismatch: expected {expected:?}, got {actual:?} during operation {operation}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
        operation: String,
    },

    #[error("Dimension mismatch: expected {expected}, got {actual} during operation {operation}")]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        operation: String,
    },

    #[error("DType mismatch: expected {expected}, got {actual} during operation {operation}")]
    DTypeMismatch {
        expected: DType,
        actual: DType,
        operation: String,
    },

    #[error("Invalid value for operation {operation}: {message}")]
    InvalidValue { operation: String, message: String },

    #[error("Index out of bounds: index {index} for axis of size {size}")]
    IndexOutOfBounds { index: i64, size: usize },

    #[error("Tensor creation error: data length {data_len} does not match shape {shape:?}")]
    TensorCreationError { data_len: usize, shape: Vec<usize> },

    #[error("Function cache exhausted during backward of {operation}: forward/backward calls are not symmetric")]
    CacheExhausted { operation: String },

    #[error("Function cache holds unexpected state type during backward of {operation}: push/pop order violates LIFO discipline")]
    CacheTypeMismatch { operation: String },

    #[error("Backward of {operation} requested against a no-op cache: forward ran in inference mode")]
    NoopCacheBackward { operation: String },

    #[error("Internal error: {0}")]
    InternalError(String),
}
