//! 2D max and average pooling over the trailing two axes.
//!
//! Both poolings share the same window decomposition: the trailing axes
//! are truncated down to whole multiples of the kernel, then reshaped to
//! `(..., oh, ky, ow, kx)` so the window axes can be reduced directly.
//! Rows and columns that do not fill a complete window are dropped
//! silently and receive zero gradient.

use crate::cache::FunctionCache;
use crate::error::GradRustError;
use crate::tensor::Tensor;
use crate::utils::{pad_to_shape, repeat_axis, reshape, unpad_trailing};
use ndarray::{ArrayD, Axis, Zip};

fn check_kernel(
    shape: &[usize],
    kernel: (usize, usize),
    operation: &str,
) -> Result<(), GradRustError> {
    if shape.len() < 2 {
        return Err(GradRustError::DimensionMismatch {
            expected: 2,
            actual: shape.len(),
            operation: operation.to_string(),
        });
    }
    let (h, w) = (shape[shape.len() - 2], shape[shape.len() - 1]);
    if kernel.0 == 0 || kernel.1 == 0 || kernel.0 > h || kernel.1 > w {
        return Err(GradRustError::InvalidValue {
            operation: operation.to_string(),
            message: format!(
                "kernel {:?} must fit the trailing extents ({h}, {w})",
                kernel
            ),
        });
    }
    Ok(())
}

/// Truncates the trailing axes to whole kernel multiples.
fn truncate_to_windows(
    x: &ArrayD<f32>,
    kernel: (usize, usize),
) -> Result<ArrayD<f32>, GradRustError> {
    let rank = x.ndim();
    let (h, w) = (x.shape()[rank - 2], x.shape()[rank - 1]);
    unpad_trailing(x, &[(0, h % kernel.0), (0, w % kernel.1)])
}

/// Reshapes `(..., oh * ky, ow * kx)` to `(..., oh, ky, ow, kx)`.
fn windowed(x: &ArrayD<f32>, kernel: (usize, usize)) -> Result<ArrayD<f32>, GradRustError> {
    let rank = x.ndim();
    let (h, w) = (x.shape()[rank - 2], x.shape()[rank - 1]);
    let mut shape: Vec<usize> = x.shape()[..rank - 2].to_vec();
    shape.extend([h / kernel.0, kernel.0, w / kernel.1, kernel.1]);
    reshape(x, &shape, "pooling")
}

fn upsample2d_array(
    x: &ArrayD<f32>,
    factors: (usize, usize),
    shape: &[usize],
) -> Result<ArrayD<f32>, GradRustError> {
    let rank = x.ndim();
    if rank < 2 {
        return Err(GradRustError::DimensionMismatch {
            expected: 2,
            actual: rank,
            operation: "upsample2d".to_string(),
        });
    }
    let repeated = repeat_axis(x, factors.0, rank - 2)?;
    let repeated = repeat_axis(&repeated, factors.1, rank - 1)?;
    pad_to_shape(&repeated, shape, "upsample2d")
}

/// Repeats each element `factors.0` times along the second-to-last axis and
/// `factors.1` times along the last, then zero-pads up to `shape`.
pub fn upsample2d(
    x: &Tensor,
    factors: (usize, usize),
    shape: &[usize],
) -> Result<Tensor, GradRustError> {
    let y = upsample2d_array(x.as_f32("upsample2d")?, factors, shape)?;
    Ok(Tensor::from_array(y))
}

struct MaxPool2dState {
    /// Input truncated to whole windows; the gradient mask is built on it.
    x_trunc: ArrayD<f32>,
    x_shape: Vec<usize>,
    y: ArrayD<f32>,
    kernel: (usize, usize),
}

/// Non-overlapping window maximum over the trailing two axes.
pub struct MaxPooling2d;

impl MaxPooling2d {
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        kernel: (usize, usize),
    ) -> Result<Tensor, GradRustError> {
        let xd = x.as_f32("maxpooling2d")?;
        check_kernel(xd.shape(), kernel, "maxpooling2d")?;

        let x_trunc = truncate_to_windows(xd, kernel)?;
        let win = windowed(&x_trunc, kernel)?;
        let lead = xd.ndim() - 2;
        let y = win
            .fold_axis(Axis(lead + 3), f32::NEG_INFINITY, |&acc, &v| acc.max(v))
            .fold_axis(Axis(lead + 1), f32::NEG_INFINITY, |&acc, &v| acc.max(v));

        cache.push_with(|| MaxPool2dState {
            x_trunc: x_trunc.clone(),
            x_shape: xd.shape().to_vec(),
            y: y.clone(),
            kernel,
        });

        let mut out = Tensor::from_array(y);
        out.set_requires_grad(x.requires_grad());
        Ok(out)
    }

    /// Routes the gradient to every element equal to its window maximum;
    /// ties all receive the full gradient. Truncated rows and columns get
    /// zero.
    pub fn backward(cache: &mut FunctionCache, dy: &Tensor) -> Result<Tensor, GradRustError> {
        let state: MaxPool2dState = cache.pop("maxpooling2d")?;
        let dyd = dy.as_f32("maxpooling2d")?;
        if dyd.shape() != state.y.shape() {
            return Err(GradRustError::ShapeMismatch {
                expected: state.y.shape().to_vec(),
                actual: dyd.shape().to_vec(),
                operation: "maxpooling2d".to_string(),
            });
        }

        let trunc_shape = state.x_trunc.shape().to_vec();
        let y_up = upsample2d_array(&state.y, state.kernel, &trunc_shape)?;
        let dy_up = upsample2d_array(dyd, state.kernel, &trunc_shape)?;
        let dx_trunc = Zip::from(&state.x_trunc)
            .and(&y_up)
            .and(&dy_up)
            .map_collect(|&v, &m, &g| if v == m { g } else { 0.0 });

        let dx = pad_to_shape(&dx_trunc, &state.x_shape, "maxpooling2d")?;
        Ok(Tensor::from_array(dx))
    }
}

struct AvgPool2dState {
    x_shape: Vec<usize>,
    y_shape: Vec<usize>,
    kernel: (usize, usize),
}

/// Non-overlapping window mean over the trailing two axes.
pub struct AvgPooling2d;

impl AvgPooling2d {
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        kernel: (usize, usize),
    ) -> Result<Tensor, GradRustError> {
        let xd = x.as_f32("avgpooling2d")?;
        check_kernel(xd.shape(), kernel, "avgpooling2d")?;

        let x_trunc = truncate_to_windows(xd, kernel)?;
        let win = windowed(&x_trunc, kernel)?;
        let lead = xd.ndim() - 2;
        let scale = 1.0 / (kernel.0 * kernel.1) as f32;
        let y = win.sum_axis(Axis(lead + 3)).sum_axis(Axis(lead + 1)) * scale;

        cache.push_with(|| AvgPool2dState {
            x_shape: xd.shape().to_vec(),
            y_shape: y.shape().to_vec(),
            kernel,
        });

        let mut out = Tensor::from_array(y);
        out.set_requires_grad(x.requires_grad());
        Ok(out)
    }

    /// Spreads each gradient value evenly over its window.
    pub fn backward(cache: &mut FunctionCache, dy: &Tensor) -> Result<Tensor, GradRustError> {
        let state: AvgPool2dState = cache.pop("avgpooling2d")?;
        let dyd = dy.as_f32("avgpooling2d")?;
        if dyd.shape() != state.y_shape.as_slice() {
            return Err(GradRustError::ShapeMismatch {
                expected: state.y_shape.clone(),
                actual: dyd.shape().to_vec(),
                operation: "avgpooling2d".to_string(),
            });
        }

        let scale = 1.0 / (state.kernel.0 * state.kernel.1) as f32;
        let dx = upsample2d_array(&(dyd * scale), state.kernel, &state.x_shape)?;
        Ok(Tensor::from_array(dx))
    }
}

/// Eager max pooling with a throwaway no-op cache.
pub fn maxpooling2d(x: &Tensor, kernel: (usize, usize)) -> Result<Tensor, GradRustError> {
    MaxPooling2d::forward(&mut FunctionCache::noop(), x, kernel)
}

/// Eager average pooling with a throwaway no-op cache.
pub fn avgpooling2d(x: &Tensor, kernel: (usize, usize)) -> Result<Tensor, GradRustError> {
    AvgPooling2d::forward(&mut FunctionCache::noop(), x, kernel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maxpool_known_values() {
        #[rustfmt::skip]
        let x = Tensor::from_vec(
            vec![
                1.0, 2.0, 5.0, 6.0,
                3.0, 4.0, 7.0, 8.0,
                9.0, 1.0, 2.0, 3.0,
                1.0, 1.0, 4.0, 1.0,
            ],
            &[1, 1, 4, 4],
        )
        .unwrap();
        let y = maxpooling2d(&x, (2, 2)).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_eq!(y.to_vec_f32("t").unwrap(), vec![4.0, 8.0, 9.0, 4.0]);
    }

    #[test]
    fn test_maxpool_backward_routes_to_maxima_only() {
        #[rustfmt::skip]
        let x = Tensor::from_vec(
            vec![
                1.0, 2.0,
                3.0, 4.0,
            ],
            &[2, 2],
        )
        .unwrap()
        .requiring_grad();
        let mut cache = FunctionCache::new();
        let y = MaxPooling2d::forward(&mut cache, &x, (2, 2)).unwrap();
        assert_eq!(y.to_vec_f32("t").unwrap(), vec![4.0]);

        let dy = Tensor::from_vec(vec![5.0], &[1, 1]).unwrap();
        let dx = MaxPooling2d::backward(&mut cache, &dy).unwrap();
        assert_eq!(dx.to_vec_f32("t").unwrap(), vec![0.0, 0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_maxpool_ties_all_receive_gradient() {
        let x = Tensor::from_vec(vec![7.0, 7.0, 1.0, 7.0], &[2, 2])
            .unwrap()
            .requiring_grad();
        let mut cache = FunctionCache::new();
        MaxPooling2d::forward(&mut cache, &x, (2, 2)).unwrap();
        let dx =
            MaxPooling2d::backward(&mut cache, &Tensor::from_vec(vec![1.0], &[1, 1]).unwrap())
                .unwrap();
        assert_eq!(dx.to_vec_f32("t").unwrap(), vec![1.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_truncated_region_gets_zero_gradient() {
        // 5x5 with a 2x2 kernel: the last row and column are dropped.
        let x = Tensor::from_vec((1..=25).map(|v| v as f32).collect(), &[5, 5])
            .unwrap()
            .requiring_grad();
        let mut cache = FunctionCache::new();
        let y = MaxPooling2d::forward(&mut cache, &x, (2, 2)).unwrap();
        assert_eq!(y.shape(), &[2, 2]);

        let dx = MaxPooling2d::backward(&mut cache, &Tensor::ones(&[2, 2])).unwrap();
        assert_eq!(dx.shape(), &[5, 5]);
        let flat = dx.to_vec_f32("t").unwrap();
        for i in 0..5 {
            assert_eq!(flat[i * 5 + 4], 0.0, "column 4 must be zero");
            assert_eq!(flat[4 * 5 + i], 0.0, "row 4 must be zero");
        }
        // window maxima of the kept 4x4 region: 7, 9, 17, 19
        assert_eq!(flat[1 * 5 + 1], 1.0);
        assert_eq!(flat[1 * 5 + 3], 1.0);
        assert_eq!(flat[3 * 5 + 1], 1.0);
        assert_eq!(flat[3 * 5 + 3], 1.0);
    }

    #[test]
    fn test_avgpool_forward_and_backward() {
        #[rustfmt::skip]
        let x = Tensor::from_vec(
            vec![
                1.0, 3.0, 2.0, 2.0,
                5.0, 7.0, 4.0, 4.0,
            ],
            &[2, 4],
        )
        .unwrap()
        .requiring_grad();
        let mut cache = FunctionCache::new();
        let y = AvgPooling2d::forward(&mut cache, &x, (2, 2)).unwrap();
        assert_eq!(y.shape(), &[1, 2]);
        assert_eq!(y.to_vec_f32("t").unwrap(), vec![4.0, 3.0]);

        let dy = Tensor::from_vec(vec![4.0, 8.0], &[1, 2]).unwrap();
        let dx = AvgPooling2d::backward(&mut cache, &dy).unwrap();
        assert_eq!(
            dx.to_vec_f32("t").unwrap(),
            vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]
        );
    }

    #[test]
    fn test_kernel_larger_than_input_rejected() {
        let x = Tensor::zeros(&[2, 2]);
        assert!(matches!(
            maxpooling2d(&x, (3, 2)),
            Err(GradRustError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_upsample2d_repeats_then_pads() {
        let x = Tensor::from_vec(vec![1.0, 2.0], &[1, 2]).unwrap();
        let y = upsample2d(&x, (2, 2), &[3, 5]).unwrap();
        assert_eq!(y.shape(), &[3, 5]);
        assert_eq!(
            y.to_vec_f32("t").unwrap(),
            vec![
                1.0, 1.0, 2.0, 2.0, 0.0,
                1.0, 1.0, 2.0, 2.0, 0.0,
                0.0, 0.0, 0.0, 0.0, 0.0,
            ]
        );
    }
}
