//! Reconstruction quality metrics.

use crate::types::EPSILON;

/// Mean squared difference of two equally long sample slices.
///
/// Returns NaN for empty input. Extra trailing samples in the longer slice
/// are ignored.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mse(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return f64::NAN;
    }
    let sum: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    sum / n as f64
}

/// Contrast-invariant relative residual of an estimate `estimate` against
/// reference `reference`, judged by how closely its per-sample contrast
/// against the reference matches that of `prediction`.
///
/// `sum (c(p, a) - c(chat, a))^2 / (sum c(p, a)^2 + eps)`.
#[must_use]
pub fn cirr(prediction: &[f64], reference: &[f64], estimate: &[f64]) -> f64 {
    let (num, den) = prediction
        .iter()
        .zip(reference)
        .zip(estimate)
        .fold((0.0, 0.0), |(num, den), ((&p, &a), &chat)| {
            let c_true = contrast(p, a);
            let c_hat = contrast(chat, a);
            let d = c_true - c_hat;
            (d.mul_add(d, num), c_true.mul_add(c_true, den))
        });
    num / (den + EPSILON)
}

/// Per-sample contrast between `p` and reference `a`.
fn contrast(p: f64, a: f64) -> f64 {
    match (sign(p), sign(a)) {
        (sp, sa) if sp == sa => (p - a).abs() / (p.abs() + a.abs() + EPSILON),
        (-1, 1) => ((a + (a - p)) - a).abs() / ((p + (a - p)).abs() + EPSILON),
        (1, -1) => ((a + (a - p)) + a).abs() / ((p + (p - a)).abs() + EPSILON),
        _ => 0.0,
    }
}

/// Sign as `-1`, `0`, or `1` (zero maps to zero).
fn sign(x: f64) -> i8 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}
