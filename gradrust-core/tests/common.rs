use gradrust_core::Tensor;

// Deterministic test inputs. Gradient checks perturb elements by a finite
// step, so inputs must keep piecewise-defined functions (relu, max
// pooling) away from their decision boundaries.

/// Smooth deterministic values in roughly [-1, 1].
#[allow(dead_code)]
pub fn smooth_tensor(shape: &[usize]) -> Tensor {
    let numel: usize = shape.iter().product();
    let data: Vec<f32> = (0..numel).map(|i| ((i as f32) * 0.7 + 0.3).sin()).collect();
    Tensor::from_vec(data, shape).expect("test tensor shape/data mismatch")
}

/// Alternating-sign values with magnitude at least `margin`, so that a
/// finite-difference step never crosses zero.
#[allow(dead_code)]
pub fn kink_free_tensor(shape: &[usize], margin: f32) -> Tensor {
    let numel: usize = shape.iter().product();
    let data: Vec<f32> = (0..numel)
        .map(|i| {
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            sign * (margin + 0.1 * ((i % 7) as f32))
        })
        .collect();
    Tensor::from_vec(data, shape).expect("test tensor shape/data mismatch")
}

/// Strictly increasing values spaced by `step`, so window maxima are
/// unique and stable under small perturbations.
#[allow(dead_code)]
pub fn distinct_tensor(shape: &[usize], step: f32) -> Tensor {
    let numel: usize = shape.iter().product();
    let data: Vec<f32> = (0..numel).map(|i| (i as f32) * step).collect();
    Tensor::from_vec(data, shape).expect("test tensor shape/data mismatch")
}
