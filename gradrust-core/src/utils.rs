//! Shape and slicing helpers shared by the function units.
//!
//! All helpers operate on the raw `ndarray` float storage; the `Tensor`
//! wrapper is unwrapped by the callers. Trailing-axis conventions follow
//! the function modules: a helper taking per-axis arguments of length `n`
//! touches the last `n` axes only.

use crate::error::GradRustError;
use ndarray::{Array2, ArrayD, Axis, IxDyn, SliceInfo, SliceInfoElem};

type DynSlice = SliceInfo<Vec<SliceInfoElem>, IxDyn, IxDyn>;

fn full_slice() -> SliceInfoElem {
    SliceInfoElem::Slice {
        start: 0,
        end: None,
        step: 1,
    }
}

fn slice_spec(elems: Vec<SliceInfoElem>) -> Result<DynSlice, GradRustError> {
    SliceInfo::try_from(elems)
        .map_err(|e| GradRustError::InternalError(format!("invalid slice spec: {e}")))
}

/// Resolves a possibly negative axis index against a rank.
pub fn normalize_axis(axis: isize, rank: usize, operation: &str) -> Result<usize, GradRustError> {
    let resolved = if axis < 0 { axis + rank as isize } else { axis };
    if resolved < 0 || resolved >= rank as isize {
        return Err(GradRustError::InvalidValue {
            operation: operation.to_string(),
            message: format!("axis {axis} out of range for rank {rank}"),
        });
    }
    Ok(resolved as usize)
}

/// Computes the broadcast result shape of two shapes (trailing-axis rules).
pub fn broadcast_shapes(
    a: &[usize],
    b: &[usize],
    operation: &str,
) -> Result<Vec<usize>, GradRustError> {
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(GradRustError::ShapeMismatch {
                    expected: a.to_vec(),
                    actual: b.to_vec(),
                    operation: operation.to_string(),
                })
            }
        };
    }
    Ok(out)
}

/// Materializes `x` broadcast to `shape`.
pub fn broadcast_to(
    x: &ArrayD<f32>,
    shape: &[usize],
    operation: &str,
) -> Result<ArrayD<f32>, GradRustError> {
    x.broadcast(IxDyn(shape))
        .map(|view| view.to_owned())
        .ok_or_else(|| GradRustError::ShapeMismatch {
            expected: shape.to_vec(),
            actual: x.shape().to_vec(),
            operation: operation.to_string(),
        })
}

/// Reshapes to `shape`, copying into standard layout if needed.
pub fn reshape(
    x: &ArrayD<f32>,
    shape: &[usize],
    operation: &str,
) -> Result<ArrayD<f32>, GradRustError> {
    let data = x.as_standard_layout().into_owned().into_raw_vec();
    let data_len = data.len();
    ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| GradRustError::ShapeMismatch {
        expected: shape.to_vec(),
        actual: vec![data_len],
        operation: operation.to_string(),
    })
}

/// Collapses all leading axes so the result is `(numel / last, last)`.
pub fn to_2d(x: &ArrayD<f32>, operation: &str) -> Result<Array2<f32>, GradRustError> {
    if x.ndim() == 0 {
        return Err(GradRustError::DimensionMismatch {
            expected: 1,
            actual: 0,
            operation: operation.to_string(),
        });
    }
    let cols = x.shape()[x.ndim() - 1];
    let rows = x.len() / cols.max(1);
    let data = x.as_standard_layout().into_owned().into_raw_vec();
    Array2::from_shape_vec((rows, cols), data)
        .map_err(|e| GradRustError::InternalError(format!("2d collapse failed: {e}")))
}

/// Sums over the listed axes (no kept dims).
pub fn sum_axes(x: &ArrayD<f32>, axes: &[usize]) -> ArrayD<f32> {
    let mut sorted: Vec<usize> = axes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut out = x.clone();
    for &axis in sorted.iter().rev() {
        out = out.sum_axis(Axis(axis));
    }
    out
}

/// Reverses the last `n_axes` axes.
pub fn flip_trailing(x: &ArrayD<f32>, n_axes: usize) -> Result<ArrayD<f32>, GradRustError> {
    let rank = x.ndim();
    let mut elems = vec![full_slice(); rank];
    for elem in elems.iter_mut().skip(rank - n_axes) {
        *elem = SliceInfoElem::Slice {
            start: 0,
            end: None,
            step: -1,
        };
    }
    Ok(x
        .slice(slice_spec(elems)?.as_ref())
        .as_standard_layout()
        .to_owned())
}

/// Takes every `step[i]`-th element along the trailing axes.
pub fn subsample_trailing(
    x: &ArrayD<f32>,
    steps: &[usize],
) -> Result<ArrayD<f32>, GradRustError> {
    let rank = x.ndim();
    let mut elems = vec![full_slice(); rank];
    for (elem, &step) in elems.iter_mut().skip(rank - steps.len()).zip(steps.iter()) {
        *elem = SliceInfoElem::Slice {
            start: 0,
            end: None,
            step: step as isize,
        };
    }
    Ok(x.slice(slice_spec(elems)?.as_ref()).to_owned())
}

/// Zero-pads the trailing axes by `(before, after)` widths.
pub fn pad_trailing(
    x: &ArrayD<f32>,
    widths: &[(usize, usize)],
) -> Result<ArrayD<f32>, GradRustError> {
    let rank = x.ndim();
    let offset = rank - widths.len();
    let mut shape: Vec<usize> = x.shape().to_vec();
    for (i, &(before, after)) in widths.iter().enumerate() {
        shape[offset + i] += before + after;
    }
    let mut out = ArrayD::zeros(IxDyn(&shape));
    let mut elems = vec![full_slice(); rank];
    for (i, &(before, _)) in widths.iter().enumerate() {
        elems[offset + i] = SliceInfoElem::Slice {
            start: before as isize,
            end: Some((before + x.shape()[offset + i]) as isize),
            step: 1,
        };
    }
    out.slice_mut(slice_spec(elems)?.as_ref()).assign(x);
    Ok(out)
}

/// Exact inverse of [`pad_trailing`]: slices `(before, after)` widths back
/// off the trailing axes.
pub fn unpad_trailing(
    x: &ArrayD<f32>,
    widths: &[(usize, usize)],
) -> Result<ArrayD<f32>, GradRustError> {
    let rank = x.ndim();
    let offset = rank - widths.len();
    let mut elems = vec![full_slice(); rank];
    for (i, &(before, after)) in widths.iter().enumerate() {
        let len = x.shape()[offset + i];
        if before + after > len {
            return Err(GradRustError::InvalidValue {
                operation: "unpad".to_string(),
                message: format!("widths ({before}, {after}) exceed axis of size {len}"),
            });
        }
        elems[offset + i] = SliceInfoElem::Slice {
            start: before as isize,
            end: Some((len - after) as isize),
            step: 1,
        };
    }
    Ok(x.slice(slice_spec(elems)?.as_ref()).to_owned())
}

/// Zero-pads `x` at the end of each axis up to `target` (same rank).
pub fn pad_to_shape(
    x: &ArrayD<f32>,
    target: &[usize],
    operation: &str,
) -> Result<ArrayD<f32>, GradRustError> {
    if x.ndim() != target.len() || x.shape().iter().zip(target).any(|(&s, &t)| s > t) {
        return Err(GradRustError::ShapeMismatch {
            expected: target.to_vec(),
            actual: x.shape().to_vec(),
            operation: operation.to_string(),
        });
    }
    if x.shape() == target {
        return Ok(x.clone());
    }
    let mut out = ArrayD::zeros(IxDyn(target));
    let elems: Vec<SliceInfoElem> = x
        .shape()
        .iter()
        .map(|&len| SliceInfoElem::Slice {
            start: 0,
            end: Some(len as isize),
            step: 1,
        })
        .collect();
    out.slice_mut(slice_spec(elems)?.as_ref()).assign(x);
    Ok(out)
}

/// Inserts `factor - 1` zeros between neighbors along the trailing axes,
/// producing length `factor * (n - 1) + 1` per axis.
pub fn dilate_trailing(
    x: &ArrayD<f32>,
    factors: &[usize],
) -> Result<ArrayD<f32>, GradRustError> {
    let rank = x.ndim();
    let offset = rank - factors.len();
    let mut shape: Vec<usize> = x.shape().to_vec();
    for (i, &factor) in factors.iter().enumerate() {
        let n = shape[offset + i];
        shape[offset + i] = if n == 0 { 0 } else { factor * (n - 1) + 1 };
    }
    let mut out = ArrayD::zeros(IxDyn(&shape));
    let mut elems = vec![full_slice(); rank];
    for (i, &factor) in factors.iter().enumerate() {
        elems[offset + i] = SliceInfoElem::Slice {
            start: 0,
            end: None,
            step: factor as isize,
        };
    }
    out.slice_mut(slice_spec(elems)?.as_ref()).assign(x);
    Ok(out)
}

/// Repeats each element `factor` times along `axis`
/// (`[a, b]` with factor 2 becomes `[a, a, b, b]`).
pub fn repeat_axis(
    x: &ArrayD<f32>,
    factor: usize,
    axis: usize,
) -> Result<ArrayD<f32>, GradRustError> {
    let rank = x.ndim();
    let mut shape: Vec<usize> = x.shape().to_vec();
    shape[axis] *= factor;
    let mut out = ArrayD::zeros(IxDyn(&shape));
    for k in 0..factor {
        let mut elems = vec![full_slice(); rank];
        elems[axis] = SliceInfoElem::Slice {
            start: k as isize,
            end: None,
            step: factor as isize,
        };
        out.slice_mut(slice_spec(elems)?.as_ref()).assign(x);
    }
    Ok(out)
}
