//! # GradRust Core
//!
//! An eager automatic differentiation engine for neural network function
//! units. There is no global graph: every differentiable operation is a
//! pair of explicit `forward`/`backward` calls communicating through a
//! caller-owned [`FunctionCache`], which records intermediate state in
//! strict LIFO order during the forward pass and surrenders it during the
//! backward pass.
//!
//! Dense storage and shape arithmetic are delegated to `ndarray`; the
//! FFT-based convolution kernels build on `rustfft`.
//!
//! ```
//! use gradrust_core::{FunctionCache, Tensor};
//! use gradrust_core::func::ReLU;
//!
//! # fn main() -> Result<(), gradrust_core::GradRustError> {
//! let x = Tensor::from_vec(vec![-1.0, 2.0], &[2])?.requiring_grad();
//! let mut cache = FunctionCache::new();
//! let y = ReLU::forward(&mut cache, &x)?;
//! let dx = ReLU::backward(&mut cache, &Tensor::ones(y.shape()))?;
//! assert_eq!(dx.to_vec_f32("doc")?, vec![0.0, 1.0]);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod fft;
pub mod func;
pub mod grad_check;
pub mod tensor;
pub mod types;
pub mod utils;

pub use cache::FunctionCache;
pub use error::GradRustError;
pub use grad_check::{check_grad, GradCheckError, GradCheckOptions};
pub use tensor::Tensor;
pub use types::DType;
