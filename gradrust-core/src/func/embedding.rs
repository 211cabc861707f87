//! Embedding table lookup.
//!
//! The lookup is expressed as a one-hot matrix product: indices become a
//! `(N, V)` one-hot matrix whose product with the `(V, E)` table gathers
//! rows, and whose transpose scatters the gradient back, accumulating
//! contributions of repeated indices by construction.

use crate::cache::FunctionCache;
use crate::error::GradRustError;
use crate::tensor::Tensor;
use crate::utils::{reshape, to_2d};
use ndarray::{Array2, ArrayD, Ix2, IxDyn};

/// One-hot encodes an integer tensor into `n_classes` trailing slots.
///
/// Output shape is the input shape with `n_classes` appended; every index
/// must lie in `0..n_classes`.
pub fn one_hot_encode(x: &Tensor, n_classes: usize) -> Result<Tensor, GradRustError> {
    let xd = x.as_i64("one_hot_encode")?;
    let mut shape: Vec<usize> = xd.shape().to_vec();
    shape.push(n_classes);
    let mut out = ArrayD::<f32>::zeros(IxDyn(&shape));

    let flat = out
        .as_slice_mut()
        .ok_or_else(|| GradRustError::InternalError("one_hot: non-contiguous output".into()))?;
    for (row, &index) in xd.iter().enumerate() {
        if index < 0 || index as usize >= n_classes {
            return Err(GradRustError::IndexOutOfBounds {
                index,
                size: n_classes,
            });
        }
        flat[row * n_classes + index as usize] = 1.0;
    }
    Ok(Tensor::from_array(out))
}

struct EmbeddingState {
    /// One-hot matrix collapsed to `(N, V)`; its transpose scatters the
    /// gradient back into the table.
    onehot2: Array2<f32>,
    x_shape: Vec<usize>,
    embed_dim: usize,
    table_requires_grad: bool,
}

/// Row lookup into an embedding table.
///
/// Shapes: integer `x (…,)`, `table (V, E)` -> `y (…, E)`.
pub struct Embedding;

impl Embedding {
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        table: &Tensor,
    ) -> Result<Tensor, GradRustError> {
        if !x.dtype().is_integer() {
            return Err(GradRustError::InvalidValue {
                operation: "embedding".to_string(),
                message: format!("indices must be an integer tensor, got {}", x.dtype()),
            });
        }
        let td = table.as_f32("embedding")?;
        if td.ndim() != 2 {
            return Err(GradRustError::DimensionMismatch {
                expected: 2,
                actual: td.ndim(),
                operation: "embedding".to_string(),
            });
        }
        let (vocab, embed_dim) = (td.shape()[0], td.shape()[1]);

        let onehot = one_hot_encode(x, vocab)?;
        let oh2 = to_2d(onehot.as_f32("embedding")?, "embedding")?;
        let t2 = td
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| GradRustError::InternalError(format!("embedding table view: {e}")))?;
        let y2 = oh2.dot(&t2);

        let mut y_shape: Vec<usize> = x.shape().to_vec();
        y_shape.push(embed_dim);
        let y = reshape(&y2.into_dyn(), &y_shape, "embedding")?;

        cache.push_with(|| EmbeddingState {
            onehot2: oh2.clone(),
            x_shape: x.shape().to_vec(),
            embed_dim,
            table_requires_grad: table.requires_grad(),
        });

        let mut out = Tensor::from_array(y);
        out.set_requires_grad(table.requires_grad());
        Ok(out)
    }

    /// Returns the table gradient, or `None` when the table required no
    /// gradient. Indices are discrete and never receive one.
    pub fn backward(
        cache: &mut FunctionCache,
        dy: &Tensor,
    ) -> Result<Option<Tensor>, GradRustError> {
        let state: EmbeddingState = cache.pop("embedding")?;
        let dyd = dy.as_f32("embedding")?;

        let mut expected = state.x_shape.clone();
        expected.push(state.embed_dim);
        if dyd.shape() != expected.as_slice() {
            return Err(GradRustError::ShapeMismatch {
                expected,
                actual: dyd.shape().to_vec(),
                operation: "embedding".to_string(),
            });
        }
        if !state.table_requires_grad {
            return Ok(None);
        }

        // (V, N) @ (N, E): repeated indices accumulate into the same row
        let dy2 = to_2d(dyd, "embedding")?;
        let dtable = state.onehot2.t().dot(&dy2);
        Ok(Some(Tensor::from_array(dtable.into_dyn())))
    }
}

/// Eager embedding lookup with a throwaway no-op cache.
pub fn lookup_embedding(x: &Tensor, table: &Tensor) -> Result<Tensor, GradRustError> {
    Embedding::forward(&mut FunctionCache::noop(), x, table)
}
