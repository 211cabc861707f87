//! Convolution function units.
//!
//! [`RawConv1d`]/[`RawConv2d`] wrap the FFT kernel of [`crate::fft`] with
//! filter flipping and stride subsampling, and know how to run themselves
//! backwards by reusing the very same kernel. [`Convolution1d`] and
//! [`Convolution2d`] compose dilation, padding and the raw kernel into the
//! full channeled operator.
//!
//! The composite inserts a fake batch axis on the filter and a fake
//! out-channel axis on the input so that one broadcast call to the raw
//! kernel covers the whole (batch, out-channel, in-channel) cross product,
//! then sums over the in-channel axis. The intermediate costs
//! O(Cin * Cout) extra memory; that trade is intentional, since the FFT
//! convolution dominates runtime anyway and the alternative is a
//! per-channel loop.

use crate::cache::FunctionCache;
use crate::error::GradRustError;
use crate::fft::{convolve1d_fft, convolve2d_fft};
use crate::func::dilate::{Dilate1d, Dilate2d};
use crate::func::pad::{Pad1d, Pad2d, Padding};
use crate::tensor::Tensor;
use crate::utils::{
    broadcast_to, dilate_trailing, flip_trailing, pad_to_shape, pad_trailing,
    subsample_trailing, sum_axes,
};
use ndarray::{ArrayD, Axis};

fn check_stride(stride: usize, operation: &str) -> Result<(), GradRustError> {
    if stride == 0 {
        return Err(GradRustError::InvalidValue {
            operation: operation.to_string(),
            message: "stride must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn check_rank(tensor: &Tensor, rank: usize, operation: &str) -> Result<(), GradRustError> {
    if tensor.n_axes() != rank {
        return Err(GradRustError::DimensionMismatch {
            expected: rank,
            actual: tensor.n_axes(),
            operation: operation.to_string(),
        });
    }
    Ok(())
}

struct RawConv1dState {
    x: ArrayD<f32>,
    f: ArrayD<f32>,
    stride: usize,
    /// Shape of the pre-stride valid convolution; backward re-expands the
    /// incoming gradient to it.
    conv_shape: Vec<usize>,
}

/// Strided valid convolution over the last axis.
///
/// Both inputs carry matching ranks; leading axes broadcast. Forward flips
/// the filter before handing it to the FFT kernel and subsamples the
/// result by `stride`.
pub struct RawConv1d;

impl RawConv1d {
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        f: &Tensor,
        stride: usize,
    ) -> Result<Tensor, GradRustError> {
        check_stride(stride, "conv1d")?;
        let xd = x.as_f32("conv1d")?;
        let fd = f.as_f32("conv1d")?;
        let f_flipped = flip_trailing(fd, 1)?;
        let conv = convolve1d_fft(xd, &f_flipped)?;
        let conv_shape = conv.shape().to_vec();
        let y = if stride == 1 {
            conv
        } else {
            subsample_trailing(&conv, &[stride])?
        };
        cache.push_with(|| RawConv1dState {
            x: xd.clone(),
            f: fd.clone(),
            stride,
            conv_shape,
        });
        let mut out = Tensor::from_array(y);
        out.set_requires_grad(x.requires_grad() || f.requires_grad());
        Ok(out)
    }

    /// Returns `(dx, df)`.
    ///
    /// The incoming gradient is re-dilated by the stride (zeros stand in
    /// for the skipped positions) and full-padded by `filter - 1`; then
    /// the forward FFT kernel is reused twice: against the filter for
    /// `dx`, and flipped against the input for `df`.
    pub fn backward(
        cache: &mut FunctionCache,
        dy: &Tensor,
    ) -> Result<(Tensor, Tensor), GradRustError> {
        let state: RawConv1dState = cache.pop("conv1d")?;
        let dyd = dy.as_f32("conv1d")?;

        let rank = state.conv_shape.len();
        let conv_len = state.conv_shape[rank - 1];
        let mut expected = state.conv_shape.clone();
        expected[rank - 1] = (conv_len + state.stride - 1) / state.stride;
        if dyd.shape() != expected.as_slice() {
            return Err(GradRustError::ShapeMismatch {
                expected,
                actual: dyd.shape().to_vec(),
                operation: "conv1d".to_string(),
            });
        }

        let g = if state.stride == 1 {
            dyd.clone()
        } else {
            dilate_trailing(dyd, &[state.stride])?
        };
        let g = pad_to_shape(&g, &state.conv_shape, "conv1d")?;

        let k = state.f.shape()[state.f.ndim() - 1];
        let g = pad_trailing(&g, &[(k - 1, k - 1)])?;

        let dx = convolve1d_fft(&g, &state.f)?;
        let g_flipped = flip_trailing(&g, 1)?;
        let df = convolve1d_fft(&g_flipped, &state.x)?;

        Ok((Tensor::from_array(dx), Tensor::from_array(df)))
    }
}

struct RawConv2dState {
    x: ArrayD<f32>,
    f: ArrayD<f32>,
    strides: (usize, usize),
    conv_shape: Vec<usize>,
}

/// Strided valid convolution over the last two axes.
pub struct RawConv2d;

impl RawConv2d {
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        f: &Tensor,
        strides: (usize, usize),
    ) -> Result<Tensor, GradRustError> {
        check_stride(strides.0, "conv2d")?;
        check_stride(strides.1, "conv2d")?;
        let xd = x.as_f32("conv2d")?;
        let fd = f.as_f32("conv2d")?;
        let f_flipped = flip_trailing(fd, 2)?;
        let conv = convolve2d_fft(xd, &f_flipped)?;
        let conv_shape = conv.shape().to_vec();
        let y = if strides == (1, 1) {
            conv
        } else {
            subsample_trailing(&conv, &[strides.0, strides.1])?
        };
        cache.push_with(|| RawConv2dState {
            x: xd.clone(),
            f: fd.clone(),
            strides,
            conv_shape,
        });
        let mut out = Tensor::from_array(y);
        out.set_requires_grad(x.requires_grad() || f.requires_grad());
        Ok(out)
    }

    pub fn backward(
        cache: &mut FunctionCache,
        dy: &Tensor,
    ) -> Result<(Tensor, Tensor), GradRustError> {
        let state: RawConv2dState = cache.pop("conv2d")?;
        let dyd = dy.as_f32("conv2d")?;

        let rank = state.conv_shape.len();
        let mut expected = state.conv_shape.clone();
        expected[rank - 2] = (expected[rank - 2] + state.strides.0 - 1) / state.strides.0;
        expected[rank - 1] = (expected[rank - 1] + state.strides.1 - 1) / state.strides.1;
        if dyd.shape() != expected.as_slice() {
            return Err(GradRustError::ShapeMismatch {
                expected,
                actual: dyd.shape().to_vec(),
                operation: "conv2d".to_string(),
            });
        }

        let g = if state.strides == (1, 1) {
            dyd.clone()
        } else {
            dilate_trailing(dyd, &[state.strides.0, state.strides.1])?
        };
        let g = pad_to_shape(&g, &state.conv_shape, "conv2d")?;

        let (kh, kw) = (
            state.f.shape()[state.f.ndim() - 2],
            state.f.shape()[state.f.ndim() - 1],
        );
        let g = pad_trailing(&g, &[(kh - 1, kh - 1), (kw - 1, kw - 1)])?;

        let dx = convolve2d_fft(&g, &state.f)?;
        let g_flipped = flip_trailing(&g, 2)?;
        let df = convolve2d_fft(&g_flipped, &state.x)?;

        Ok((Tensor::from_array(dx), Tensor::from_array(df)))
    }
}

struct Conv1dState {
    conv_shape: Vec<usize>,
    bias_requires_grad: Option<bool>,
}

/// Full 1D convolution: `x (B, Cin, T)` with `f (Cout, Cin, K)` and
/// optional `b (Cout,)`, under a padding preset, stride and filter
/// dilation.
pub struct Convolution1d;

impl Convolution1d {
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        f: &Tensor,
        b: Option<&Tensor>,
        padding: Padding,
        stride: usize,
        dilation: usize,
    ) -> Result<Tensor, GradRustError> {
        if x.n_axes() != f.n_axes() {
            return Err(GradRustError::DimensionMismatch {
                expected: x.n_axes(),
                actual: f.n_axes(),
                operation: "convolution1d".to_string(),
            });
        }
        check_rank(x, 3, "convolution1d")?;
        let c_out = f.shape()[0];
        if let Some(bias) = b {
            if bias.as_f32("convolution1d")?.shape() != [c_out] {
                return Err(GradRustError::ShapeMismatch {
                    expected: vec![c_out],
                    actual: bias.shape().to_vec(),
                    operation: "convolution1d".to_string(),
                });
            }
        }

        // dilate the filter and give it a fake batch axis: (1, Co, Ci, K)
        let f_dil = Dilate1d::forward(cache, f, dilation)?;
        let fd_ext = f_dil
            .as_f32("convolution1d")?
            .clone()
            .insert_axis(Axis(0));
        let kernel = fd_ext.shape()[3];
        if kernel == 0 {
            return Err(GradRustError::InvalidValue {
                operation: "convolution1d".to_string(),
                message: "filter must have a nonzero kernel extent".to_string(),
            });
        }

        // pad the input and give it a fake out-channel axis: (B, 1, Ci, T)
        let widths = padding.widths1d(kernel);
        let x_pad = Pad1d::forward(cache, x, widths)?;
        let xd_ext = x_pad
            .as_f32("convolution1d")?
            .clone()
            .insert_axis(Axis(1));

        let mut x_ext = Tensor::from_array(xd_ext);
        x_ext.set_requires_grad(x.requires_grad());
        let mut f_ext = Tensor::from_array(fd_ext);
        f_ext.set_requires_grad(f.requires_grad());

        // one broadcast convolution over (B, Co, Ci, T), then collapse Ci
        let conv = RawConv1d::forward(cache, &x_ext, &f_ext, stride)?;
        let convd = conv.as_f32("convolution1d")?;
        let mut y = convd.sum_axis(Axis(2));

        if let Some(bias) = b {
            let bd = bias.as_f32("convolution1d")?;
            y = y + &bd.view().insert_axis(Axis(1));
        }

        let conv_shape = convd.shape().to_vec();
        cache.push_with(|| Conv1dState {
            conv_shape,
            bias_requires_grad: b.map(|t| t.requires_grad()),
        });

        let mut out = Tensor::from_array(y);
        out.set_requires_grad(
            x.requires_grad() || f.requires_grad() || b.map_or(false, |t| t.requires_grad()),
        );
        Ok(out)
    }

    /// Returns `(dx, df, db)`; `db` is `None` when no bias was supplied or
    /// it required no gradient.
    pub fn backward(
        cache: &mut FunctionCache,
        dy: &Tensor,
    ) -> Result<(Tensor, Tensor, Option<Tensor>), GradRustError> {
        let state: Conv1dState = cache.pop("convolution1d")?;
        let dyd = dy.as_f32("convolution1d")?;

        // undo the in-channel sum: broadcast dy back over Ci
        let dy_ext = broadcast_to(
            &dyd.view().insert_axis(Axis(2)).to_owned(),
            &state.conv_shape,
            "convolution1d",
        )?;
        let (dx_raw, df_raw) = RawConv1d::backward(cache, &Tensor::from_array(dy_ext))?;

        // collapse the fake axes, then unwind padding and dilation
        let dx_sum = sum_axes(dx_raw.as_f32("convolution1d")?, &[1]);
        let dx = Pad1d::backward(cache, &Tensor::from_array(dx_sum))?;
        let df_sum = sum_axes(df_raw.as_f32("convolution1d")?, &[0]);
        let df = Dilate1d::backward(cache, &Tensor::from_array(df_sum))?;

        let db = match state.bias_requires_grad {
            Some(true) => Some(Tensor::from_array(sum_axes(dyd, &[0, 2]))),
            _ => None,
        };

        Ok((dx, df, db))
    }
}

/// Eager 1D convolution with a throwaway no-op cache.
pub fn convolve1d(
    x: &Tensor,
    f: &Tensor,
    b: Option<&Tensor>,
    padding: Padding,
    stride: usize,
    dilation: usize,
) -> Result<Tensor, GradRustError> {
    Convolution1d::forward(&mut FunctionCache::noop(), x, f, b, padding, stride, dilation)
}

struct Conv2dState {
    conv_shape: Vec<usize>,
    bias_requires_grad: Option<bool>,
}

/// Full 2D convolution: `x (B, Cin, H, W)` with `f (Cout, Cin, Kh, Kw)`
/// and optional `b (Cout,)`.
pub struct Convolution2d;

impl Convolution2d {
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        f: &Tensor,
        b: Option<&Tensor>,
        padding: Padding,
        stride: usize,
        dilation: usize,
    ) -> Result<Tensor, GradRustError> {
        if x.n_axes() != f.n_axes() {
            return Err(GradRustError::DimensionMismatch {
                expected: x.n_axes(),
                actual: f.n_axes(),
                operation: "convolution2d".to_string(),
            });
        }
        check_rank(x, 4, "convolution2d")?;
        let c_out = f.shape()[0];
        if let Some(bias) = b {
            if bias.as_f32("convolution2d")?.shape() != [c_out] {
                return Err(GradRustError::ShapeMismatch {
                    expected: vec![c_out],
                    actual: bias.shape().to_vec(),
                    operation: "convolution2d".to_string(),
                });
            }
        }

        let f_dil = Dilate2d::forward(cache, f, (dilation, dilation))?;
        let fd_ext = f_dil
            .as_f32("convolution2d")?
            .clone()
            .insert_axis(Axis(0)); // (1, Co, Ci, Kh, Kw)
        let kernel = (fd_ext.shape()[3], fd_ext.shape()[4]);
        if kernel.0 == 0 || kernel.1 == 0 {
            return Err(GradRustError::InvalidValue {
                operation: "convolution2d".to_string(),
                message: "filter must have nonzero kernel extents".to_string(),
            });
        }

        let widths = padding.widths2d(kernel)?;
        let x_pad = Pad2d::forward(cache, x, widths)?;
        let xd_ext = x_pad
            .as_f32("convolution2d")?
            .clone()
            .insert_axis(Axis(1)); // (B, 1, Ci, H, W)

        let mut x_ext = Tensor::from_array(xd_ext);
        x_ext.set_requires_grad(x.requires_grad());
        let mut f_ext = Tensor::from_array(fd_ext);
        f_ext.set_requires_grad(f.requires_grad());

        let conv = RawConv2d::forward(cache, &x_ext, &f_ext, (stride, stride))?;
        let convd = conv.as_f32("convolution2d")?;
        let mut y = convd.sum_axis(Axis(2)); // (B, Co, H', W')

        if let Some(bias) = b {
            let bd = bias.as_f32("convolution2d")?;
            y = y + &bd.view().insert_axis(Axis(1)).insert_axis(Axis(2));
        }

        let conv_shape = convd.shape().to_vec();
        cache.push_with(|| Conv2dState {
            conv_shape,
            bias_requires_grad: b.map(|t| t.requires_grad()),
        });

        let mut out = Tensor::from_array(y);
        out.set_requires_grad(
            x.requires_grad() || f.requires_grad() || b.map_or(false, |t| t.requires_grad()),
        );
        Ok(out)
    }

    pub fn backward(
        cache: &mut FunctionCache,
        dy: &Tensor,
    ) -> Result<(Tensor, Tensor, Option<Tensor>), GradRustError> {
        let state: Conv2dState = cache.pop("convolution2d")?;
        let dyd = dy.as_f32("convolution2d")?;

        let dy_ext = broadcast_to(
            &dyd.view().insert_axis(Axis(2)).to_owned(),
            &state.conv_shape,
            "convolution2d",
        )?;
        let (dx_raw, df_raw) = RawConv2d::backward(cache, &Tensor::from_array(dy_ext))?;

        let dx_sum = sum_axes(dx_raw.as_f32("convolution2d")?, &[1]);
        let dx = Pad2d::backward(cache, &Tensor::from_array(dx_sum))?;
        let df_sum = sum_axes(df_raw.as_f32("convolution2d")?, &[0]);
        let df = Dilate2d::backward(cache, &Tensor::from_array(df_sum))?;

        let db = match state.bias_requires_grad {
            Some(true) => Some(Tensor::from_array(sum_axes(dyd, &[0, 2, 3]))),
            _ => None,
        };

        Ok((dx, df, db))
    }
}

/// Eager 2D convolution with a throwaway no-op cache.
pub fn convolve2d(
    x: &Tensor,
    f: &Tensor,
    b: Option<&Tensor>,
    padding: Padding,
    stride: usize,
    dilation: usize,
) -> Result<Tensor, GradRustError> {
    Convolution2d::forward(&mut FunctionCache::noop(), x, f, b, padding, stride, dilation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn assert_close(tensor: &Tensor, expected: &[f32], epsilon: f32) {
        let got = tensor.to_vec_f32("test").unwrap();
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(g, e, epsilon = epsilon);
        }
    }

    #[test]
    fn test_convolve1d_known_values() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[1, 1, 4]).unwrap();
        let f = Tensor::from_vec(vec![1.0, 2.0], &[1, 1, 2]).unwrap();
        let y = convolve1d(&x, &f, None, Padding::Valid, 1, 1).unwrap();
        assert_eq!(y.shape(), &[1, 1, 3]);
        assert_close(&y, &[5.0, 8.0, 11.0], 1e-4);
    }

    #[test]
    fn test_convolve1d_sums_input_channels_and_adds_bias() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0], &[1, 2, 3]).unwrap();
        let f = Tensor::from_vec(vec![1.0, 1.0, 1.0, 1.0], &[1, 2, 2]).unwrap();
        let b = Tensor::from_vec(vec![0.5], &[1]).unwrap();
        let y = convolve1d(&x, &f, Some(&b), Padding::Valid, 1, 1).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2]);
        assert_close(&y, &[33.5, 55.5], 1e-3);
    }

    #[test]
    fn test_convolve1d_output_length_law() {
        // out = floor((L - (D * (K - 1) + 1)) / S) + 1 under valid padding
        for (l, k, s, d, want) in [
            (10usize, 3usize, 1usize, 1usize, 8usize),
            (10, 3, 2, 1, 4),
            (11, 3, 2, 2, 4),
            (9, 2, 2, 3, 3),
        ] {
            let x = Tensor::randn(&[1, 1, l]);
            let f = Tensor::randn(&[1, 1, k]);
            let y = convolve1d(&x, &f, None, Padding::Valid, s, d).unwrap();
            assert_eq!(y.shape(), &[1, 1, want], "L={l} K={k} S={s} D={d}");
            assert_eq!(want, (l - (d * (k - 1) + 1)) / s + 1);
        }
    }

    #[test]
    fn test_convolve1d_same_and_causal_preserve_length() {
        let x = Tensor::from_vec(vec![1.0, 0.0, 0.0], &[1, 1, 3]).unwrap();
        let f = Tensor::from_vec(vec![1.0, 1.0], &[1, 1, 2]).unwrap();

        let causal = convolve1d(&x, &f, None, Padding::Causal, 1, 1).unwrap();
        assert_eq!(causal.shape(), &[1, 1, 3]);
        // causal output never looks ahead of the current sample
        assert_close(&causal, &[1.0, 1.0, 0.0], 1e-4);

        let x2 = Tensor::randn(&[1, 1, 7]);
        let f3 = Tensor::randn(&[1, 1, 3]);
        let same = convolve1d(&x2, &f3, None, Padding::Same, 1, 1).unwrap();
        assert_eq!(same.shape(), &[1, 1, 7]);
    }

    #[test]
    fn test_rank_mismatch_rejected_before_work() {
        let x = Tensor::randn(&[1, 1, 8]);
        let f = Tensor::randn(&[1, 3]);
        let mut cache = FunctionCache::new();
        let err = Convolution1d::forward(&mut cache, &x, &f, None, Padding::Valid, 1, 1)
            .err()
            .unwrap();
        assert!(matches!(err, GradRustError::DimensionMismatch { .. }));
        assert!(cache.is_empty(), "failed forward must not leave state behind");
    }

    #[test]
    fn test_convolution1d_cache_symmetry() {
        let x = Tensor::randn(&[2, 3, 8]).requiring_grad();
        let f = Tensor::randn(&[4, 3, 3]).requiring_grad();
        let b = Tensor::randn(&[4]).requiring_grad();
        let mut cache = FunctionCache::new();
        let y =
            Convolution1d::forward(&mut cache, &x, &f, Some(&b), Padding::Same, 2, 1).unwrap();
        // dilate + pad + raw conv + composite
        assert_eq!(cache.len(), 4);

        let dy = Tensor::ones(y.shape());
        let (dx, df, db) = Convolution1d::backward(&mut cache, &dy).unwrap();
        assert!(cache.is_empty());
        assert_eq!(dx.shape(), x.shape());
        assert_eq!(df.shape(), f.shape());
        assert_eq!(db.unwrap().shape(), b.shape());
    }

    #[test]
    fn test_convolve2d_known_values() {
        let x = Tensor::from_vec((1..=9).map(|v| v as f32).collect(), &[1, 1, 3, 3]).unwrap();
        let f = Tensor::from_vec(vec![1.0; 4], &[1, 1, 2, 2]).unwrap();
        let y = convolve2d(&x, &f, None, Padding::Valid, 1, 1).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_close(&y, &[12.0, 16.0, 24.0, 28.0], 1e-3);
    }

    #[test]
    fn test_convolution2d_backward_shapes_with_stride_and_dilation() {
        let x = Tensor::randn(&[2, 2, 9, 9]).requiring_grad();
        let f = Tensor::randn(&[3, 2, 2, 2]).requiring_grad();
        let mut cache = FunctionCache::new();
        let y =
            Convolution2d::forward(&mut cache, &x, &f, None, Padding::Valid, 2, 2).unwrap();
        // dilated kernel 3 -> valid out 7 -> stride 2 -> 4
        assert_eq!(y.shape(), &[2, 3, 4, 4]);

        let (dx, df, db) = Convolution2d::backward(&mut cache, &Tensor::ones(y.shape())).unwrap();
        assert_eq!(dx.shape(), x.shape());
        assert_eq!(df.shape(), f.shape());
        assert!(db.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_bias_gradient_skipped_when_not_requested() {
        let x = Tensor::randn(&[1, 1, 6]).requiring_grad();
        let f = Tensor::randn(&[2, 1, 3]).requiring_grad();
        let b = Tensor::randn(&[2]); // grad not requested
        let mut cache = FunctionCache::new();
        let y = Convolution1d::forward(&mut cache, &x, &f, Some(&b), Padding::Valid, 1, 1)
            .unwrap();
        let (_, _, db) = Convolution1d::backward(&mut cache, &Tensor::ones(y.shape())).unwrap();
        assert!(db.is_none());
    }
}
