//! Dilation of the trailing one or two axes.
//!
//! Dilation inserts `factor - 1` zeros between neighboring elements,
//! growing an axis of length `n` to `factor * (n - 1) + 1`. Backward is
//! the strided subsample at `factor`. A factor of 1 is a true identity in
//! both directions, recorded in the cache per call.

use crate::cache::FunctionCache;
use crate::error::GradRustError;
use crate::tensor::Tensor;
use crate::utils::{dilate_trailing, subsample_trailing};

fn check_factor(factor: usize, operation: &str) -> Result<(), GradRustError> {
    if factor == 0 {
        return Err(GradRustError::InvalidValue {
            operation: operation.to_string(),
            message: "dilation factor must be at least 1".to_string(),
        });
    }
    Ok(())
}

struct Dilate1dState {
    /// `None` records the factor-1 identity.
    dilation: Option<usize>,
}

/// Dilates the last axis.
pub struct Dilate1d;

impl Dilate1d {
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        dilation: usize,
    ) -> Result<Tensor, GradRustError> {
        check_factor(dilation, "dilate1d")?;
        let xd = x.as_f32("dilate1d")?;
        if dilation == 1 {
            cache.push_with(|| Dilate1dState { dilation: None });
            return Ok(x.clone());
        }
        let y = dilate_trailing(xd, &[dilation])?;
        cache.push_with(|| Dilate1dState {
            dilation: Some(dilation),
        });
        let mut out = Tensor::from_array(y);
        out.set_requires_grad(x.requires_grad());
        Ok(out)
    }

    pub fn backward(cache: &mut FunctionCache, dy: &Tensor) -> Result<Tensor, GradRustError> {
        let state: Dilate1dState = cache.pop("dilate1d")?;
        match state.dilation {
            None => Ok(dy.clone()),
            Some(factor) => {
                let dx = subsample_trailing(dy.as_f32("dilate1d")?, &[factor])?;
                Ok(Tensor::from_array(dx))
            }
        }
    }
}

struct Dilate2dState {
    dilation: Option<(usize, usize)>,
}

/// Dilates the last two axes.
pub struct Dilate2d;

impl Dilate2d {
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        dilation: (usize, usize),
    ) -> Result<Tensor, GradRustError> {
        check_factor(dilation.0, "dilate2d")?;
        check_factor(dilation.1, "dilate2d")?;
        let xd = x.as_f32("dilate2d")?;
        if xd.ndim() < 2 {
            return Err(GradRustError::DimensionMismatch {
                expected: 2,
                actual: xd.ndim(),
                operation: "dilate2d".to_string(),
            });
        }
        if dilation == (1, 1) {
            cache.push_with(|| Dilate2dState { dilation: None });
            return Ok(x.clone());
        }
        let y = dilate_trailing(xd, &[dilation.0, dilation.1])?;
        cache.push_with(|| Dilate2dState {
            dilation: Some(dilation),
        });
        let mut out = Tensor::from_array(y);
        out.set_requires_grad(x.requires_grad());
        Ok(out)
    }

    pub fn backward(cache: &mut FunctionCache, dy: &Tensor) -> Result<Tensor, GradRustError> {
        let state: Dilate2dState = cache.pop("dilate2d")?;
        match state.dilation {
            None => Ok(dy.clone()),
            Some((fy, fx)) => {
                let dx = subsample_trailing(dy.as_f32("dilate2d")?, &[fy, fx])?;
                Ok(Tensor::from_array(dx))
            }
        }
    }
}
