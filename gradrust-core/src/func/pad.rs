//! Zero-padding of the trailing one or two axes.
//!
//! Padding is a reversible shape transform: backward slices the gradient
//! back to the original extent. The all-zero-width case is a true no-op in
//! both directions, and that fact is recorded in the cache per call rather
//! than inferred from shapes, so a zero-width pad and a coincidentally
//! shape-preserving one can never be confused.

use crate::cache::FunctionCache;
use crate::error::GradRustError;
use crate::tensor::Tensor;
use crate::utils::{pad_trailing, unpad_trailing};

/// Named padding presets, resolved once at the call boundary into concrete
/// `(before, after)` widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// No padding.
    Valid,
    /// `kernel_size / 2` on each side, preserving the spatial extent for
    /// stride 1.
    Same,
    /// `kernel_size - 1` zeros before the data, none after (1D only).
    Causal,
    /// `kernel_size - 1` zeros on both sides.
    Full,
}

impl Padding {
    /// Widths for a 1D convolution with the given (dilated) kernel size.
    pub fn widths1d(&self, kernel_size: usize) -> (usize, usize) {
        match self {
            Padding::Valid => (0, 0),
            Padding::Same => (kernel_size / 2, kernel_size / 2),
            Padding::Causal => (kernel_size - 1, 0),
            Padding::Full => (kernel_size - 1, kernel_size - 1),
        }
    }

    /// Per-axis widths for a 2D convolution. Causal padding has no 2D
    /// meaning and is rejected.
    pub fn widths2d(
        &self,
        kernel_size: (usize, usize),
    ) -> Result<[(usize, usize); 2], GradRustError> {
        match self {
            Padding::Causal => Err(GradRustError::InvalidValue {
                operation: "pad2d".to_string(),
                message: "causal padding is only defined for 1D convolutions".to_string(),
            }),
            _ => Ok([
                self.widths1d(kernel_size.0),
                self.widths1d(kernel_size.1),
            ]),
        }
    }
}

struct Pad1dState {
    /// `None` records the zero-width no-op.
    padding: Option<(usize, usize)>,
}

/// Pads the last axis with zeros.
pub struct Pad1d;

impl Pad1d {
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        padding: (usize, usize),
    ) -> Result<Tensor, GradRustError> {
        let xd = x.as_f32("pad1d")?;
        if xd.ndim() < 1 {
            return Err(GradRustError::DimensionMismatch {
                expected: 1,
                actual: 0,
                operation: "pad1d".to_string(),
            });
        }
        if padding == (0, 0) {
            cache.push_with(|| Pad1dState { padding: None });
            return Ok(x.clone());
        }
        let y = pad_trailing(xd, &[padding])?;
        cache.push_with(|| Pad1dState {
            padding: Some(padding),
        });
        let mut out = Tensor::from_array(y);
        out.set_requires_grad(x.requires_grad());
        Ok(out)
    }

    pub fn backward(cache: &mut FunctionCache, dy: &Tensor) -> Result<Tensor, GradRustError> {
        let state: Pad1dState = cache.pop("pad1d")?;
        match state.padding {
            None => Ok(dy.clone()),
            Some(widths) => {
                let dx = unpad_trailing(dy.as_f32("pad1d")?, &[widths])?;
                Ok(Tensor::from_array(dx))
            }
        }
    }
}

struct Pad2dState {
    padding: Option<[(usize, usize); 2]>,
}

/// Pads the last two axes with zeros.
pub struct Pad2d;

impl Pad2d {
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        padding: [(usize, usize); 2],
    ) -> Result<Tensor, GradRustError> {
        let xd = x.as_f32("pad2d")?;
        if xd.ndim() < 2 {
            return Err(GradRustError::DimensionMismatch {
                expected: 2,
                actual: xd.ndim(),
                operation: "pad2d".to_string(),
            });
        }
        if padding == [(0, 0), (0, 0)] {
            cache.push_with(|| Pad2dState { padding: None });
            return Ok(x.clone());
        }
        let y = pad_trailing(xd, &padding)?;
        cache.push_with(|| Pad2dState {
            padding: Some(padding),
        });
        let mut out = Tensor::from_array(y);
        out.set_requires_grad(x.requires_grad());
        Ok(out)
    }

    pub fn backward(cache: &mut FunctionCache, dy: &Tensor) -> Result<Tensor, GradRustError> {
        let state: Pad2dState = cache.pop("pad2d")?;
        match state.padding {
            None => Ok(dy.clone()),
            Some(widths) => {
                let dx = unpad_trailing(dy.as_f32("pad2d")?, &widths)?;
                Ok(Tensor::from_array(dx))
            }
        }
    }
}
