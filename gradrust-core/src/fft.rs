//! FFT-based valid convolution over the last one or two axes.
//!
//! Both kernels compute a circular convolution in the frequency domain
//! (forward FFT, elementwise complex multiply, inverse FFT, real part)
//! with the filter zero-padded to the input extent, then slice the
//! trailing `|x| - |f| + 1` window, which is exactly the region free of
//! wrap-around. Filter flipping and stride handling are deliberately left
//! to the caller: the convolution function units compose them on top.
//!
//! Leading axes of the two operands broadcast under trailing-axis rules,
//! so a single call can cover a whole (batch, channel, ...) cross product.

use crate::error::GradRustError;
use crate::utils::broadcast_shapes;
use ndarray::{ArrayD, IxDyn};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Row-major strides of `shape`, with broadcast axes (size 1) zeroed so a
/// broadcast coordinate always maps back to offset 0 on that axis.
fn broadcast_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; shape.len()];
    let mut acc = 1usize;
    for i in (0..shape.len()).rev() {
        strides[i] = if shape[i] == 1 { 0 } else { acc };
        acc *= shape[i];
    }
    strides
}

fn contiguous_data(x: &ArrayD<f32>, operation: &str) -> Result<Vec<f32>, GradRustError> {
    let std = x.as_standard_layout();
    std.as_slice()
        .map(|s| s.to_vec())
        .ok_or_else(|| GradRustError::InternalError(format!("{operation}: non-contiguous buffer")))
}

fn check_extent(input: usize, filter: usize, operation: &str) -> Result<(), GradRustError> {
    if filter == 0 || filter > input {
        return Err(GradRustError::InvalidValue {
            operation: operation.to_string(),
            message: format!("filter extent {filter} must be in 1..={input}"),
        });
    }
    Ok(())
}

/// Forward-transforms every `seg_len` chunk of `data`, zero-padding each
/// chunk to `fft_len` first. Returns one spectrum per chunk.
fn spectra(
    data: &[f32],
    seg_len: usize,
    fft_len: usize,
    fft: &Arc<dyn Fft<f32>>,
) -> Vec<Vec<Complex<f32>>> {
    data.chunks_exact(seg_len)
        .map(|chunk| {
            let mut buf = vec![Complex::new(0.0, 0.0); fft_len];
            for (slot, &v) in buf.iter_mut().zip(chunk.iter()) {
                *slot = Complex::new(v, 0.0);
            }
            fft.process(&mut buf);
            buf
        })
        .collect()
}

/// Iterates the broadcast leading index space, yielding the row indices of
/// the two operands for each output row.
fn broadcast_rows(lead: &[usize], a_lead: &[usize], b_lead: &[usize]) -> Vec<(usize, usize)> {
    let a_strides = broadcast_strides(a_lead);
    let b_strides = broadcast_strides(b_lead);
    let total: usize = lead.iter().product();
    let mut rows = Vec::with_capacity(total);
    let mut coords = vec![0usize; lead.len()];
    for _ in 0..total {
        let mut ai = 0;
        let mut bi = 0;
        for (d, &c) in coords.iter().enumerate() {
            ai += c * a_strides[d];
            bi += c * b_strides[d];
        }
        rows.push((ai, bi));
        for d in (0..lead.len()).rev() {
            coords[d] += 1;
            if coords[d] < lead[d] {
                break;
            }
            coords[d] = 0;
        }
    }
    rows
}

/// Valid FFT convolution over the last axis.
///
/// Output shape: broadcast leading axes + `[t - k + 1]` where `t` and `k`
/// are the trailing extents of `x` and `f`.
pub fn convolve1d_fft(x: &ArrayD<f32>, f: &ArrayD<f32>) -> Result<ArrayD<f32>, GradRustError> {
    let operation = "convolve1d_fft";
    if x.ndim() != f.ndim() || x.ndim() < 1 {
        return Err(GradRustError::DimensionMismatch {
            expected: x.ndim().max(1),
            actual: f.ndim(),
            operation: operation.to_string(),
        });
    }
    let t = x.shape()[x.ndim() - 1];
    let k = f.shape()[f.ndim() - 1];
    check_extent(t, k, operation)?;
    let out_len = t - k + 1;

    let x_lead = &x.shape()[..x.ndim() - 1];
    let f_lead = &f.shape()[..f.ndim() - 1];
    let lead = broadcast_shapes(x_lead, f_lead, operation)?;

    let mut planner = FftPlanner::<f32>::new();
    let forward = planner.plan_fft_forward(t);
    let inverse = planner.plan_fft_inverse(t);

    let x_spectra = spectra(&contiguous_data(x, operation)?, t, t, &forward);
    let f_spectra = spectra(&contiguous_data(f, operation)?, k, t, &forward);

    let scale = 1.0 / t as f32;
    let mut out = Vec::with_capacity(lead.iter().product::<usize>() * out_len);
    for (xi, fi) in broadcast_rows(&lead, x_lead, f_lead) {
        let mut buf: Vec<Complex<f32>> = x_spectra[xi]
            .iter()
            .zip(f_spectra[fi].iter())
            .map(|(a, b)| a * b)
            .collect();
        inverse.process(&mut buf);
        out.extend(buf[t - out_len..].iter().map(|c| c.re * scale));
    }

    let mut out_shape = lead;
    out_shape.push(out_len);
    ArrayD::from_shape_vec(IxDyn(&out_shape), out)
        .map_err(|e| GradRustError::InternalError(format!("{operation}: {e}")))
}

/// In-place 2D FFT of a row-major `h` x `w` buffer: transform the rows,
/// then the columns through a gather/scatter scratch.
fn fft2_in_place(
    buf: &mut [Complex<f32>],
    h: usize,
    w: usize,
    row_fft: &Arc<dyn Fft<f32>>,
    col_fft: &Arc<dyn Fft<f32>>,
) {
    for row in buf.chunks_exact_mut(w) {
        row_fft.process(row);
    }
    let mut column = vec![Complex::new(0.0, 0.0); h];
    for j in 0..w {
        for i in 0..h {
            column[i] = buf[i * w + j];
        }
        col_fft.process(&mut column);
        for i in 0..h {
            buf[i * w + j] = column[i];
        }
    }
}

/// Valid FFT convolution over the last two axes.
pub fn convolve2d_fft(x: &ArrayD<f32>, f: &ArrayD<f32>) -> Result<ArrayD<f32>, GradRustError> {
    let operation = "convolve2d_fft";
    if x.ndim() != f.ndim() || x.ndim() < 2 {
        return Err(GradRustError::DimensionMismatch {
            expected: x.ndim().max(2),
            actual: f.ndim(),
            operation: operation.to_string(),
        });
    }
    let (h, w) = (x.shape()[x.ndim() - 2], x.shape()[x.ndim() - 1]);
    let (kh, kw) = (f.shape()[f.ndim() - 2], f.shape()[f.ndim() - 1]);
    check_extent(h, kh, operation)?;
    check_extent(w, kw, operation)?;
    let (out_h, out_w) = (h - kh + 1, w - kw + 1);

    let x_lead = &x.shape()[..x.ndim() - 2];
    let f_lead = &f.shape()[..f.ndim() - 2];
    let lead = broadcast_shapes(x_lead, f_lead, operation)?;

    let mut planner = FftPlanner::<f32>::new();
    let row_fwd = planner.plan_fft_forward(w);
    let col_fwd = planner.plan_fft_forward(h);
    let row_inv = planner.plan_fft_inverse(w);
    let col_inv = planner.plan_fft_inverse(h);

    let x_data = contiguous_data(x, operation)?;
    let f_data = contiguous_data(f, operation)?;

    let x_spectra: Vec<Vec<Complex<f32>>> = x_data
        .chunks_exact(h * w)
        .map(|chunk| {
            let mut buf: Vec<Complex<f32>> =
                chunk.iter().map(|&v| Complex::new(v, 0.0)).collect();
            fft2_in_place(&mut buf, h, w, &row_fwd, &col_fwd);
            buf
        })
        .collect();
    let f_spectra: Vec<Vec<Complex<f32>>> = f_data
        .chunks_exact(kh * kw)
        .map(|chunk| {
            let mut buf = vec![Complex::new(0.0, 0.0); h * w];
            for i in 0..kh {
                for j in 0..kw {
                    buf[i * w + j] = Complex::new(chunk[i * kw + j], 0.0);
                }
            }
            fft2_in_place(&mut buf, h, w, &row_fwd, &col_fwd);
            buf
        })
        .collect();

    let scale = 1.0 / (h * w) as f32;
    let mut out = Vec::with_capacity(lead.iter().product::<usize>() * out_h * out_w);
    for (xi, fi) in broadcast_rows(&lead, x_lead, f_lead) {
        let mut buf: Vec<Complex<f32>> = x_spectra[xi]
            .iter()
            .zip(f_spectra[fi].iter())
            .map(|(a, b)| a * b)
            .collect();
        fft2_in_place(&mut buf, h, w, &row_inv, &col_inv);
        for i in kh - 1..h {
            for j in kw - 1..w {
                out.push(buf[i * w + j].re * scale);
            }
        }
    }

    let mut out_shape = lead;
    out_shape.push(out_h);
    out_shape.push(out_w);
    ArrayD::from_shape_vec(IxDyn(&out_shape), out)
        .map_err(|e| GradRustError::InternalError(format!("{operation}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    /// Direct valid convolution over the last axis for cross-checking:
    /// y[i] = sum_j x[i + j] * f[k - 1 - j].
    fn direct_valid_1d(x: &[f32], f: &[f32]) -> Vec<f32> {
        let k = f.len();
        (0..=x.len() - k)
            .map(|i| (0..k).map(|j| x[i + j] * f[k - 1 - j]).sum())
            .collect()
    }

    #[test]
    fn test_convolve1d_fft_matches_direct() {
        let x = arr1(&[1.0_f32, 2.0, 3.0, 4.0]).into_dyn();
        let f = arr1(&[2.0_f32, 1.0]).into_dyn();
        let y = convolve1d_fft(&x, &f).unwrap();
        let expected = direct_valid_1d(&[1.0, 2.0, 3.0, 4.0], &[2.0, 1.0]);
        assert_eq!(y.shape(), &[3]);
        for (got, want) in y.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(got, want, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_convolve1d_fft_broadcasts_leading_axes() {
        // x: (2, 1, 5), f: (1, 3, 2) -> y: (2, 3, 4)
        let x = ArrayD::from_shape_vec(
            IxDyn(&[2, 1, 5]),
            (1..=10).map(|v| v as f32).collect(),
        )
        .unwrap();
        let f = ArrayD::from_shape_vec(
            IxDyn(&[1, 3, 2]),
            vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        )
        .unwrap();
        let y = convolve1d_fft(&x, &f).unwrap();
        assert_eq!(y.shape(), &[2, 3, 4]);

        // filter [1, 0] (flipped kernel [0, 1]) selects x[i + 1]
        let row = y.index_axis(ndarray::Axis(0), 0);
        let row = row.index_axis(ndarray::Axis(0), 0);
        for (j, got) in row.iter().enumerate() {
            assert_abs_diff_eq!(got, &((j + 2) as f32), epsilon = 1e-4);
        }
    }

    #[test]
    fn test_convolve2d_fft_ones_filter_sums_windows() {
        let x = arr2(&[
            [1.0_f32, 2.0, 3.0],
            [4.0, 5.0, 6.0],
            [7.0, 8.0, 9.0],
        ])
        .into_dyn();
        let f = arr2(&[[1.0_f32, 1.0], [1.0, 1.0]]).into_dyn();
        let y = convolve2d_fft(&x, &f).unwrap();
        assert_eq!(y.shape(), &[2, 2]);
        let expected = [12.0, 16.0, 24.0, 28.0];
        for (got, want) in y.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(got, want, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_filter_longer_than_input_rejected() {
        let x = arr1(&[1.0_f32, 2.0]).into_dyn();
        let f = arr1(&[1.0_f32, 2.0, 3.0]).into_dyn();
        assert!(matches!(
            convolve1d_fft(&x, &f),
            Err(GradRustError::InvalidValue { .. })
        ));
    }
}
