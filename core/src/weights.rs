//! Log-space importance weights.
//!
//! Weights are always kept as logarithms with the particle axis last. Normalization never
//! exponentiates an unshifted weight, and a lane whose weights have all collapsed keeps its
//! `-inf`/`NaN` values so that the degeneracy stays visible downstream.
use ndarray::{ArrayD, ArrayView1, Axis};

use crate::error::{FilterError, Result};

fn log_sum_exp_lane(lane: ArrayView1<'_, f64>) -> f64 {
    if lane.iter().any(|x| x.is_nan()) {
        return f64::NAN;
    }
    let max = lane.fold(f64::NEG_INFINITY, |m, &x| m.max(x));
    if max.is_infinite() {
        return max;
    }
    max + lane.iter().map(|&x| (x - max).exp()).sum::<f64>().ln()
}

fn last_axis(values: &ArrayD<f64>) -> Result<Axis> {
    match values.ndim() {
        0 => Err(FilterError::ShapeMismatch(
            "log-weights need a particle axis".to_string(),
        )),
        ndim => Ok(Axis(ndim - 1)),
    }
}

/// Numerically stable `log(sum(exp(x)))` over the last axis.
///
/// ```rust
/// use ndarray::array;
/// use smc::weights::log_sum_exp;
///
/// let lse = log_sum_exp(&array![1000.0, 1000.0].into_dyn()).unwrap();
/// assert!((lse[[]] - (1000.0 + 2.0_f64.ln())).abs() < 1e-9);
/// ```
pub fn log_sum_exp(values: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let axis = last_axis(values)?;
    Ok(values.map_axis(axis, log_sum_exp_lane))
}

/// Normalized log-weights together with the log of their pre-normalization mean.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedWeights {
    /// Same shape as the input; `log_sum_exp` of every lane is zero.
    pub log_weights: ArrayD<f64>,
    /// One entry per batch instance: `log_sum_exp(w) - ln(num_particles)`.
    pub log_mean_weight: ArrayD<f64>,
}

/// Normalize log-weights over the particle axis.
///
/// # Arguments
/// * `unnormalized` - log-weights shaped `batch + [N]`
///
/// # Returns
/// The normalized log-weights and, per batch instance, the log of the mean unnormalized weight,
/// which is the step's log marginal likelihood increment. A lane whose weights are all `-inf`
/// (or contain NaN) normalizes to NaN and its increment is `-inf`/NaN; this is not an error.
///
/// # Errors
/// Returns a `ShapeMismatch` for a zero-dimensional input.
pub fn normalize_log_weights(unnormalized: &ArrayD<f64>) -> Result<NormalizedWeights> {
    let axis = last_axis(unnormalized)?;
    let num_particles = unnormalized.shape()[axis.index()];
    let lse = unnormalized.map_axis(axis, log_sum_exp_lane);
    let log_weights = unnormalized - &lse.clone().insert_axis(axis);
    let log_mean_weight = lse.mapv(|x| x - (num_particles as f64).ln());
    Ok(NormalizedWeights {
        log_weights,
        log_mean_weight,
    })
}

/// `1 / sum(w^2)` for normalized log-weights, per batch instance.
pub fn effective_sample_size(log_weights: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let axis = last_axis(log_weights)?;
    Ok(log_weights.map_axis(axis, |lane| {
        let sum_of_squares: f64 = lane.iter().map(|&w| (2.0 * w).exp()).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }))
}
