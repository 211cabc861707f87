//! Numerical gradient checking against central finite differences.
//!
//! A function unit is checked through two closures: one running its
//! forward pass over a slice of inputs, one running its backward pass and
//! returning one optional gradient per input, aligned by position. The
//! scalar probe is `sum(output * seed)` for a fixed random seed tensor,
//! accumulated in `f64` so the comparison is not drowned by single
//! precision rounding in the reduction itself.

use crate::cache::FunctionCache;
use crate::error::GradRustError;
use crate::tensor::Tensor;
use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GradCheckError {
    #[error("gradient check forward/backward failed: {0}")]
    Operation(#[from] GradRustError),

    #[error("no analytic gradient returned for input {index}, which requires one")]
    MissingGradient { index: usize },

    #[error("gradient returned for input {index} has shape {actual:?}, input has {expected:?}")]
    GradientShape {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(
        "gradient mismatch for input {input}, element {element}: \
         analytic {analytic:.6e} vs numeric {numeric:.6e} (diff {diff:.3e} > {allowed:.3e})"
    )]
    Mismatch {
        input: usize,
        element: usize,
        analytic: f64,
        numeric: f64,
        diff: f64,
        allowed: f64,
    },
}

/// Step size and tolerance of the finite-difference probe.
///
/// The defaults are tuned for `f32` storage with FFT-based operations in
/// the chain: a large step keeps the difference quotient above the noise
/// floor, and the tolerance is relative to the gradient magnitude.
#[derive(Debug, Clone, Copy)]
pub struct GradCheckOptions {
    pub epsilon: f32,
    pub tolerance: f64,
}

impl Default for GradCheckOptions {
    fn default() -> Self {
        GradCheckOptions {
            epsilon: 1e-2,
            tolerance: 1e-2,
        }
    }
}

fn probe_loss(output: &Tensor, seed: &Tensor) -> Result<f64, GradRustError> {
    let o = output.to_vec_f32("grad_check")?;
    let s = seed.to_vec_f32("grad_check")?;
    Ok(o.iter()
        .zip(s.iter())
        .map(|(&a, &b)| a as f64 * b as f64)
        .sum())
}

fn perturbed_loss<F>(
    forward: &F,
    inputs: &[Tensor],
    index: usize,
    data: Vec<f32>,
    seed: &Tensor,
) -> Result<f64, GradCheckError>
where
    F: Fn(&mut FunctionCache, &[Tensor]) -> Result<Tensor, GradRustError>,
{
    let mut shifted = Tensor::from_vec(data, inputs[index].shape())?;
    shifted.set_requires_grad(inputs[index].requires_grad());
    let mut perturbed: Vec<Tensor> = inputs.to_vec();
    perturbed[index] = shifted;
    let output = forward(&mut FunctionCache::noop(), &perturbed)?;
    Ok(probe_loss(&output, seed)?)
}

/// Checks the analytic gradients of every input with `requires_grad`
/// against central differences of the probe loss.
///
/// `backward` must return one `Option<Tensor>` per input, in input order;
/// `None` is only acceptable for inputs that require no gradient.
pub fn check_grad<F, B>(
    forward: F,
    backward: B,
    inputs: &[Tensor],
    options: &GradCheckOptions,
) -> Result<(), GradCheckError>
where
    F: Fn(&mut FunctionCache, &[Tensor]) -> Result<Tensor, GradRustError>,
    B: Fn(&mut FunctionCache, &Tensor) -> Result<Vec<Option<Tensor>>, GradRustError>,
{
    let mut cache = FunctionCache::new();
    let output = forward(&mut cache, inputs)?;
    let seed = Tensor::randn(output.shape());
    let grads = backward(&mut cache, &seed)?;

    let eps = options.epsilon as f64;
    for (index, input) in inputs.iter().enumerate() {
        if !input.requires_grad() {
            debug!("grad check: input {index} requires no gradient, skipping");
            continue;
        }
        let analytic = grads
            .get(index)
            .and_then(|g| g.as_ref())
            .ok_or(GradCheckError::MissingGradient { index })?;
        if analytic.shape() != input.shape() {
            return Err(GradCheckError::GradientShape {
                index,
                expected: input.shape().to_vec(),
                actual: analytic.shape().to_vec(),
            });
        }

        let base = input.to_vec_f32("grad_check")?;
        let analytic_flat = analytic.to_vec_f32("grad_check")?;
        for element in 0..base.len() {
            let mut plus = base.clone();
            plus[element] += options.epsilon;
            let mut minus = base.clone();
            minus[element] -= options.epsilon;

            let loss_plus = perturbed_loss(&forward, inputs, index, plus, &seed)?;
            let loss_minus = perturbed_loss(&forward, inputs, index, minus, &seed)?;
            let numeric = (loss_plus - loss_minus) / (2.0 * eps);
            let analytic_value = analytic_flat[element] as f64;

            let diff = (analytic_value - numeric).abs();
            let allowed = options.tolerance * (1.0 + analytic_value.abs().max(numeric.abs()));
            if diff > allowed {
                debug!(
                    "grad check: input {index} element {element} failed \
                     (analytic {analytic_value:.6e}, numeric {numeric:.6e})"
                );
                return Err(GradCheckError::Mismatch {
                    input: index,
                    element,
                    analytic: analytic_value,
                    numeric,
                    diff,
                    allowed,
                });
            }
        }
    }
    Ok(())
}
