//! Element-wise activation functions and the softmax family.
//!
//! The softmax variants are terminal nonlinearities: they expose no
//! backward here because their gradient is folded into the loss functions
//! of the orchestration layer.

use crate::cache::FunctionCache;
use crate::error::GradRustError;
use crate::tensor::Tensor;
use crate::utils::normalize_axis;
use ndarray::{ArrayD, Axis, Zip};

/// sqrt(2 / pi), the scale constant of the tanh GELU approximation.
const GELU_S: f32 = 0.797_884_6;
const GELU_C: f32 = 0.044_715;

fn check_grad_shape(
    expected: &[usize],
    dy: &ArrayD<f32>,
    operation: &str,
) -> Result<(), GradRustError> {
    if dy.shape() != expected {
        return Err(GradRustError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: dy.shape().to_vec(),
            operation: operation.to_string(),
        });
    }
    Ok(())
}

fn propagating(y: ArrayD<f32>, x: &Tensor) -> Tensor {
    let mut out = Tensor::from_array(y);
    out.set_requires_grad(x.requires_grad());
    out
}

struct ReluState {
    y: ArrayD<f32>,
}

/// Rectified Linear Unit: `y = max(x, 0)`.
pub struct ReLU;

impl ReLU {
    pub fn forward(cache: &mut FunctionCache, x: &Tensor) -> Result<Tensor, GradRustError> {
        let xd = x.as_f32("relu")?;
        let y = xd.mapv(|v| v.max(0.0));
        cache.push_with(|| ReluState { y: y.clone() });
        Ok(propagating(y, x))
    }

    /// `dx = (y > 0) * dy`
    pub fn backward(cache: &mut FunctionCache, dy: &Tensor) -> Result<Tensor, GradRustError> {
        let state: ReluState = cache.pop("relu")?;
        let dyd = dy.as_f32("relu")?;
        check_grad_shape(state.y.shape(), dyd, "relu")?;
        let dx = Zip::from(&state.y)
            .and(dyd)
            .map_collect(|&y, &g| if y > 0.0 { g } else { 0.0 });
        Ok(Tensor::from_array(dx))
    }
}

struct LeakyReluState {
    y: ArrayD<f32>,
    alpha: f32,
}

/// Leaky ReLU: `y = max(x, 0) + alpha * min(x, 0)`.
pub struct LeakyReLU;

impl LeakyReLU {
    pub fn forward(
        cache: &mut FunctionCache,
        x: &Tensor,
        alpha: f32,
    ) -> Result<Tensor, GradRustError> {
        let xd = x.as_f32("leaky_relu")?;
        let y = xd.mapv(|v| if v > 0.0 { v } else { alpha * v });
        cache.push_with(|| LeakyReluState { y: y.clone(), alpha });
        Ok(propagating(y, x))
    }

    /// `dx = ((y > 0) + alpha * (y < 0)) * dy`
    pub fn backward(cache: &mut FunctionCache, dy: &Tensor) -> Result<Tensor, GradRustError> {
        let state: LeakyReluState = cache.pop("leaky_relu")?;
        let dyd = dy.as_f32("leaky_relu")?;
        check_grad_shape(state.y.shape(), dyd, "leaky_relu")?;
        let alpha = state.alpha;
        let dx = Zip::from(&state.y).and(dyd).map_collect(|&y, &g| {
            if y > 0.0 {
                g
            } else if y < 0.0 {
                alpha * g
            } else {
                0.0
            }
        });
        Ok(Tensor::from_array(dx))
    }
}

struct GeluState {
    x: ArrayD<f32>,
    tanh_inner: ArrayD<f32>,
}

/// Gaussian Error Linear Unit, tanh approximation:
/// `y = 0.5 * x * (1 + tanh(S * (x + C * x^3)))`.
pub struct GELU;

impl GELU {
    pub fn forward(cache: &mut FunctionCache, x: &Tensor) -> Result<Tensor, GradRustError> {
        let xd = x.as_f32("gelu")?;
        let tanh_inner = xd.mapv(|v| (GELU_S * (v + GELU_C * v.powi(3))).tanh());
        let y = Zip::from(xd)
            .and(&tanh_inner)
            .map_collect(|&v, &t| 0.5 * v * (1.0 + t));
        cache.push_with(|| GeluState {
            x: xd.clone(),
            tanh_inner: tanh_inner.clone(),
        });
        Ok(propagating(y, x))
    }

    /// Analytic derivative of the closed form, using `sech^2 = 1 - tanh^2`:
    /// `dx = (0.5 * (1 + tanh) + 0.5 * x * sech^2 * S * (1 + 3 * C * x^2)) * dy`
    pub fn backward(cache: &mut FunctionCache, dy: &Tensor) -> Result<Tensor, GradRustError> {
        let state: GeluState = cache.pop("gelu")?;
        let dyd = dy.as_f32("gelu")?;
        check_grad_shape(state.x.shape(), dyd, "gelu")?;
        let dx = Zip::from(&state.x)
            .and(&state.tanh_inner)
            .and(dyd)
            .map_collect(|&v, &t, &g| {
                let sech2 = 1.0 - t * t;
                (0.5 * (1.0 + t) + 0.5 * v * sech2 * GELU_S * (1.0 + 3.0 * GELU_C * v * v)) * g
            });
        Ok(Tensor::from_array(dx))
    }
}

struct SigmoidState {
    y: ArrayD<f32>,
}

/// Sigmoid, computed as `e^x / (1 + e^x)` so that very negative inputs
/// underflow to 0 instead of overflowing.
pub struct Sigmoid;

impl Sigmoid {
    pub fn forward(cache: &mut FunctionCache, x: &Tensor) -> Result<Tensor, GradRustError> {
        let xd = x.as_f32("sigmoid")?;
        let y = xd.mapv(|v| {
            let e = v.exp();
            e / (1.0 + e)
        });
        cache.push_with(|| SigmoidState { y: y.clone() });
        Ok(propagating(y, x))
    }

    /// `dx = y * (1 - y) * dy`
    pub fn backward(cache: &mut FunctionCache, dy: &Tensor) -> Result<Tensor, GradRustError> {
        let state: SigmoidState = cache.pop("sigmoid")?;
        let dyd = dy.as_f32("sigmoid")?;
        check_grad_shape(state.y.shape(), dyd, "sigmoid")?;
        let dx = Zip::from(&state.y)
            .and(dyd)
            .map_collect(|&y, &g| y * (1.0 - y) * g);
        Ok(Tensor::from_array(dx))
    }
}

struct TanhState {
    y: ArrayD<f32>,
}

/// Hyperbolic tangent.
pub struct Tanh;

impl Tanh {
    pub fn forward(cache: &mut FunctionCache, x: &Tensor) -> Result<Tensor, GradRustError> {
        let xd = x.as_f32("tanh")?;
        let y = xd.mapv(f32::tanh);
        cache.push_with(|| TanhState { y: y.clone() });
        Ok(propagating(y, x))
    }

    /// `dx = (1 - y^2) * dy`
    pub fn backward(cache: &mut FunctionCache, dy: &Tensor) -> Result<Tensor, GradRustError> {
        let state: TanhState = cache.pop("tanh")?;
        let dyd = dy.as_f32("tanh")?;
        check_grad_shape(state.y.shape(), dyd, "tanh")?;
        let dx = Zip::from(&state.y)
            .and(dyd)
            .map_collect(|&y, &g| (1.0 - y * y) * g);
        Ok(Tensor::from_array(dx))
    }
}

/// Shifted exponentials along `axis`: `exp((x - max(x, axis)) / temperature)`.
/// The max subtraction keeps the exponentials from overflowing.
fn shifted_exp(
    xd: &ArrayD<f32>,
    axis: usize,
    temperature: f32,
) -> ArrayD<f32> {
    let max = xd
        .fold_axis(Axis(axis), f32::NEG_INFINITY, |acc, &v| acc.max(v))
        .insert_axis(Axis(axis));
    let shifted = xd - &max;
    shifted.mapv(|v| (v / temperature).exp())
}

/// Softmax over `axis` (negative indices allowed).
pub fn softmax(x: &Tensor, axis: isize) -> Result<Tensor, GradRustError> {
    let xd = x.as_f32("softmax")?;
    let axis = normalize_axis(axis, xd.ndim(), "softmax")?;
    let e = shifted_exp(xd, axis, 1.0);
    let sum = e.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    Ok(propagating(&e / &sum, x))
}

/// Natural log of the softmax over `axis`.
pub fn log_softmax(x: &Tensor, axis: isize) -> Result<Tensor, GradRustError> {
    let xd = x.as_f32("log_softmax")?;
    let axis = normalize_axis(axis, xd.ndim(), "log_softmax")?;
    let e = shifted_exp(xd, axis, 1.0);
    let sum = e.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    Ok(propagating((&e / &sum).mapv(f32::ln), x))
}

/// Softmax with temperature scaling. A temperature of zero is rejected.
pub fn temperature_softmax(
    x: &Tensor,
    temperature: f32,
    axis: isize,
) -> Result<Tensor, GradRustError> {
    if temperature == 0.0 {
        return Err(GradRustError::InvalidValue {
            operation: "temperature_softmax".to_string(),
            message: "temperature cannot be 0".to_string(),
        });
    }
    let xd = x.as_f32("temperature_softmax")?;
    let axis = normalize_axis(axis, xd.ndim(), "temperature_softmax")?;
    let e = shifted_exp(xd, axis, temperature);
    let sum = e.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    Ok(propagating(&e / &sum, x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tensor_1d(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), &[values.len()]).unwrap()
    }

    #[test]
    fn test_relu_forward_backward() {
        let x = tensor_1d(&[-2.0, -1.0, 0.0, 1.0, 2.0]).requiring_grad();
        let mut cache = FunctionCache::new();
        let y = ReLU::forward(&mut cache, &x).unwrap();
        assert_eq!(y.to_vec_f32("t").unwrap(), vec![0.0, 0.0, 0.0, 1.0, 2.0]);
        assert!(y.requires_grad());

        let dy = tensor_1d(&[1.0, 1.0, 1.0, 1.0, 1.0]);
        let dx = ReLU::backward(&mut cache, &dy).unwrap();
        assert_eq!(dx.to_vec_f32("t").unwrap(), vec![0.0, 0.0, 0.0, 1.0, 1.0]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_leaky_relu_negative_slope() {
        let x = tensor_1d(&[-2.0, 3.0]);
        let mut cache = FunctionCache::new();
        let y = LeakyReLU::forward(&mut cache, &x, 0.1).unwrap();
        let got = y.to_vec_f32("t").unwrap();
        assert_abs_diff_eq!(got[0], -0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(got[1], 3.0, epsilon = 1e-6);

        let dx = LeakyReLU::backward(&mut cache, &tensor_1d(&[1.0, 1.0])).unwrap();
        let got = dx.to_vec_f32("t").unwrap();
        assert_abs_diff_eq!(got[0], 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(got[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_sigmoid_saturates_cleanly() {
        let x = tensor_1d(&[-100.0, 0.0]);
        let mut cache = FunctionCache::noop();
        let y = Sigmoid::forward(&mut cache, &x).unwrap();
        let got = y.to_vec_f32("t").unwrap();
        assert_abs_diff_eq!(got[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(got[1], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 400.0, 500.0, 600.0], &[2, 3]).unwrap();
        let y = softmax(&x, -1).unwrap();
        let data = y.to_vec_f32("t").unwrap();
        // Large inputs must not overflow thanks to the max subtraction.
        assert!(data.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(data[0] + data[1] + data[2], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(data[3] + data[4] + data[5], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_log_softmax_matches_softmax_log() {
        let x = tensor_1d(&[0.5, -1.0, 2.0]);
        let a = log_softmax(&x, -1).unwrap().to_vec_f32("t").unwrap();
        let b = softmax(&x, -1).unwrap().to_vec_f32("t").unwrap();
        for (la, sb) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*la, sb.ln(), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_temperature_softmax_zero_rejected() {
        let x = tensor_1d(&[1.0, 2.0]);
        let err = temperature_softmax(&x, 0.0, -1).err().unwrap();
        assert!(matches!(err, GradRustError::InvalidValue { .. }));
    }

    #[test]
    fn test_temperature_flattens_distribution() {
        let x = tensor_1d(&[1.0, 2.0]);
        let sharp = temperature_softmax(&x, 0.5, -1).unwrap().to_vec_f32("t").unwrap();
        let flat = temperature_softmax(&x, 10.0, -1).unwrap().to_vec_f32("t").unwrap();
        assert!(sharp[1] > flat[1]);
    }

    #[test]
    fn test_tanh_backward_formula() {
        let x = tensor_1d(&[0.5]);
        let mut cache = FunctionCache::new();
        let y = Tanh::forward(&mut cache, &x).unwrap();
        let yv = y.to_vec_f32("t").unwrap()[0];
        let dx = Tanh::backward(&mut cache, &tensor_1d(&[2.0])).unwrap();
        assert_abs_diff_eq!(
            dx.to_vec_f32("t").unwrap()[0],
            (1.0 - yv * yv) * 2.0,
            epsilon = 1e-6
        );
    }
}
