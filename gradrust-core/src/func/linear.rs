//! Affine transformation `y = x @ w^T + b`.

use crate::cache::FunctionCache;
use crate::error::GradRustError;
use crate::tensor::Tensor;
use crate::utils::to_2d;
use ndarray::{Array2, ArrayD, Axis, Ix2, IxDyn};

struct LinearState {
    /// Input collapsed to `(batch, c_in)`; the weight gradient needs it.
    x2: Array2<f32>,
    w: Array2<f32>,
    x_shape: Vec<usize>,
    w_requires_grad: bool,
    b_requires_grad: Option<bool>,
}

/// Linear (affine) transformation over the last axis.
///
/// Shapes: `x (…, Cin)`, `w (Cout, Cin)`, `b (Cout,)` -> `y (…, Cout)`.
/// Any number of leading batch axes is supported; they are collapsed for
/// the matrix multiply and restored on the output.
pub struct Linear;

impl Linear {
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        w: &Tensor,
        b: Option<&Tensor>,
    ) -> Result<Tensor, GradRustError> {
        let xd = x.as_f32("linear")?;
        let wd = w.as_f32("linear")?;
        if wd.ndim() != 2 {
            return Err(GradRustError::DimensionMismatch {
                expected: 2,
                actual: wd.ndim(),
                operation: "linear".to_string(),
            });
        }
        let (c_out, c_in) = (wd.shape()[0], wd.shape()[1]);
        if xd.ndim() == 0 || xd.shape()[xd.ndim() - 1] != c_in {
            return Err(GradRustError::ShapeMismatch {
                expected: vec![c_in],
                actual: xd.shape().to_vec(),
                operation: "linear".to_string(),
            });
        }

        if let Some(bias) = b {
            let bd = bias.as_f32("linear")?;
            if bd.shape() != [c_out] {
                return Err(GradRustError::ShapeMismatch {
                    expected: vec![c_out],
                    actual: bd.shape().to_vec(),
                    operation: "linear".to_string(),
                });
            }
        }

        let x2 = to_2d(xd, "linear")?;
        let w2 = wd
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| GradRustError::InternalError(format!("linear weight view: {e}")))?;
        let y2 = x2.dot(&w2.t());

        let mut y_shape: Vec<usize> = xd.shape()[..xd.ndim() - 1].to_vec();
        y_shape.push(c_out);
        let mut y = y2
            .into_shape(IxDyn(&y_shape))
            .map_err(|e| GradRustError::InternalError(format!("linear output reshape: {e}")))?;

        if let Some(bias) = b {
            y = y + bias.as_f32("linear")?;
        }

        cache.push_with(|| LinearState {
            x2: x2.clone(),
            w: w2.to_owned(),
            x_shape: xd.shape().to_vec(),
            w_requires_grad: w.requires_grad(),
            b_requires_grad: b.map(|bias| bias.requires_grad()),
        });

        let mut out = Tensor::from_array(y);
        out.set_requires_grad(
            x.requires_grad() || w.requires_grad() || b.map_or(false, |t| t.requires_grad()),
        );
        Ok(out)
    }

    /// Returns `(dx, dw, db)`.
    ///
    /// `dw`/`db` are `None` when the corresponding parameter did not
    /// require a gradient (or, for `db`, when no bias was supplied): the
    /// absence is meaningful and distinct from a zero gradient.
    pub fn backward(
        cache: &mut FunctionCache,
        dy: &Tensor,
    ) -> Result<(Tensor, Option<Tensor>, Option<Tensor>), GradRustError> {
        let state: LinearState = cache.pop("linear")?;
        let dyd = dy.as_f32("linear")?;
        let c_out = state.w.shape()[0];

        let mut expected: Vec<usize> = state.x_shape[..state.x_shape.len() - 1].to_vec();
        expected.push(c_out);
        if dyd.shape() != expected.as_slice() {
            return Err(GradRustError::ShapeMismatch {
                expected,
                actual: dyd.shape().to_vec(),
                operation: "linear".to_string(),
            });
        }

        let dy2 = to_2d(dyd, "linear")?;

        // (N, Cout) @ (Cout, Cin) -> (N, Cin), restored to the input shape
        let dx2 = dy2.dot(&state.w);
        let dx: ArrayD<f32> = dx2
            .into_shape(IxDyn(&state.x_shape))
            .map_err(|e| GradRustError::InternalError(format!("linear dx reshape: {e}")))?;

        // (Cout, N) @ (N, Cin) -> (Cout, Cin); collapsing the batch axes
        // into N sums them out, so dw matches w for any leading rank.
        let dw = if state.w_requires_grad {
            Some(Tensor::from_array(dy2.t().dot(&state.x2).into_dyn()))
        } else {
            None
        };

        let db = match state.b_requires_grad {
            Some(true) => Some(Tensor::from_array(dy2.sum_axis(Axis(0)).into_dyn())),
            _ => None,
        };

        Ok((Tensor::from_array(dx), dw, db))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_linear_forward_known_values() {
        // x (2, 2) @ w^T (2, 3) + b
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let w = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2]).unwrap();
        let b = Tensor::from_vec(vec![0.5, 0.5, 0.5], &[3]).unwrap();
        let mut cache = FunctionCache::noop();
        let y = Linear::forward(&mut cache, &x, &w, Some(&b)).unwrap();
        assert_eq!(y.shape(), &[2, 3]);
        assert_eq!(
            y.to_vec_f32("t").unwrap(),
            vec![1.5, 2.5, 3.5, 3.5, 4.5, 7.5]
        );
    }

    #[test]
    fn test_linear_shape_mismatch_rejected() {
        let x = Tensor::zeros(&[2, 3]);
        let w = Tensor::zeros(&[4, 2]);
        let mut cache = FunctionCache::noop();
        assert!(matches!(
            Linear::forward(&mut cache, &x, &w, None),
            Err(GradRustError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_batched_gradient_reduction_shapes() {
        // Batch rank 2: x (4, 5, Cin); dw must come back (Cout, Cin) and
        // db (Cout,) with every batch axis summed out.
        let (c_in, c_out) = (3, 2);
        let x = Tensor::randn(&[4, 5, c_in]).requiring_grad();
        let w = Tensor::randn(&[c_out, c_in]).requiring_grad();
        let b = Tensor::randn(&[c_out]).requiring_grad();

        let mut cache = FunctionCache::new();
        let y = Linear::forward(&mut cache, &x, &w, Some(&b)).unwrap();
        assert_eq!(y.shape(), &[4, 5, c_out]);

        let dy = Tensor::ones(&[4, 5, c_out]);
        let (dx, dw, db) = Linear::backward(&mut cache, &dy).unwrap();
        assert_eq!(dx.shape(), &[4, 5, c_in]);
        assert_eq!(dw.unwrap().shape(), &[c_out, c_in]);
        let db = db.unwrap();
        assert_eq!(db.shape(), &[c_out]);
        // dy of ones: db sums 4 * 5 ones per output channel.
        for v in db.to_vec_f32("t").unwrap() {
            assert_abs_diff_eq!(v, 20.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_skipped_gradients_are_absent_not_zero() {
        let x = Tensor::randn(&[2, 3]).requiring_grad();
        let w = Tensor::randn(&[4, 3]); // no grad requested
        let b = Tensor::randn(&[4]); // no grad requested
        let mut cache = FunctionCache::new();
        Linear::forward(&mut cache, &x, &w, Some(&b)).unwrap();
        let (dx, dw, db) = Linear::backward(&mut cache, &Tensor::ones(&[2, 4])).unwrap();
        assert_eq!(dx.shape(), &[2, 3]);
        assert!(dw.is_none());
        assert!(db.is_none());
    }

    #[test]
    fn test_no_bias_means_no_bias_gradient() {
        let x = Tensor::randn(&[2, 3]);
        let w = Tensor::randn(&[4, 3]).requiring_grad();
        let mut cache = FunctionCache::new();
        Linear::forward(&mut cache, &x, &w, None).unwrap();
        let (_, dw, db) = Linear::backward(&mut cache, &Tensor::ones(&[2, 4])).unwrap();
        assert!(dw.is_some());
        assert!(db.is_none());
    }
}
