#![allow(dead_code)]

use float_cmp::approx_eq;
use rtg::prelude::*;

/// Root mean square error of `actual` against `expected`, relative to the largest
/// magnitude in either, within 80 float epsilons.
pub fn verify_range(actual: &[f32], expected: &[f32]) -> bool {
    if actual.len() != expected.len() {
        return false;
    }
    let magnitude = actual
        .iter()
        .chain(expected)
        .fold(0f64, |m, v| m.max(v.abs() as f64));
    let squares: f64 = actual
        .iter()
        .zip(expected)
        .map(|(a, e)| (*a as f64 - *e as f64).powi(2))
        .sum();
    let rms = (squares / actual.len().max(1) as f64).sqrt();
    let error = if magnitude == 0.0 { rms } else { rms / magnitude };
    error <= f32::EPSILON as f64 * 80.0
}

/// Element-wise comparison with an absolute tolerance of 1e-6.
pub fn close(actual: &[f32], expected: &[f32]) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected)
            .all(|(a, e)| approx_eq!(f32, *a, *e, epsilon = 1e-6))
}

pub fn float(lens: &[usize]) -> Shape {
    Shape::new(Dtype::Float, lens.to_vec())
}

pub fn literal(lens: &[usize], data: &[f32]) -> Literal {
    Literal::new(float(lens), data).unwrap()
}

/// Compiles `p` for the host target and evaluates it without parameters.
pub fn eval_cpu(mut p: Program) -> anyhow::Result<Vec<f32>> {
    p.compile(CpuTarget)?;
    Ok(p.eval(&Parameters::new())?.to_vec::<f32>()?)
}
