//! Test utilities for gradient checking

use super::module::Module;
use ndarray::ArrayD;

/// Finite difference gradient checker
///
/// Computes numerical gradient using central difference:
/// f'(x) ≈ (f(x + h) - f(x - h)) / (2h)
pub fn finite_difference<F>(mut f: F, x: &[f32], epsilon: f32) -> Vec<f32>
where
    F: FnMut(&[f32]) -> f32,
{
    let mut grad = vec![0.0; x.len()];
    let mut point = x.to_vec();

    for i in 0..x.len() {
        point[i] = x[i] + epsilon;
        let f_plus = f(&point);
        point[i] = x[i] - epsilon;
        let f_minus = f(&point);
        point[i] = x[i];

        grad[i] = (f_plus - f_minus) / (2.0 * epsilon);
    }

    grad
}

/// Numerical gradient of `sum(layer(x) * g)` w.r.t. `x`
pub fn numeric_input_grad(
    layer: &mut dyn Module,
    x: &ArrayD<f32>,
    g: &ArrayD<f32>,
) -> ArrayD<f32> {
    let flat: Vec<f32> = x.iter().copied().collect();
    let grad = finite_difference(
        |values| {
            let point = ArrayD::from_shape_vec(x.raw_dim(), values.to_vec()).unwrap();
            let y = layer.forward(&point).unwrap();
            (&y * g).sum()
        },
        &flat,
        1e-2,
    );
    ArrayD::from_shape_vec(x.raw_dim(), grad).unwrap()
}

#[test]
fn test_finite_difference_quadratic() {
    let grad = finite_difference(|x| x.iter().map(|v| v * v).sum(), &[1.0, -2.0], 1e-3);
    assert!((grad[0] - 2.0).abs() < 1e-2);
    assert!((grad[1] + 4.0).abs() < 1e-2);
}
