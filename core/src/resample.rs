//! Ancestor selection.
//!
//! Every batch instance resamples independently, from its own child of the step seed, so the
//! indices drawn for one instance never depend on the batch size or on which other instances
//! were resampled. Instances that are skipped (by the resampling criterion or because their
//! weights are degenerate) get the identity ancestry and keep their weights.
use log::warn;
use ndarray::{ArrayD, Axis, IxDyn};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::seed::Seed;
use crate::weights::effective_sample_size;

/// How ancestor indices are drawn from normalized weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingStrategy {
    /// One uniform offset per instance, evenly strided positions.
    #[default]
    Systematic,
    /// Independent categorical draws.
    Multinomial,
    /// One uniform draw inside each of `N` equal strata.
    Stratified,
    /// Deterministic `floor(N w)` copies, remainder drawn systematically from the residuals.
    Residual,
}

/// When a batch instance is resampled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResampleCriterion {
    #[default]
    Always,
    Never,
    /// Resample when the effective sample size drops below `fraction * num_particles`.
    EffectiveSampleSizeBelow { fraction: f64 },
}

impl ResampleCriterion {
    /// One flag per batch instance for normalized `log_weights` (particle axis last).
    pub fn should_resample(&self, log_weights: &ArrayD<f64>) -> Result<ArrayD<bool>> {
        let ess = effective_sample_size(log_weights)?;
        let num_particles = log_weights.shape()[log_weights.ndim() - 1] as f64;
        Ok(match *self {
            ResampleCriterion::Always => ess.mapv(|_| true),
            ResampleCriterion::Never => ess.mapv(|_| false),
            ResampleCriterion::EffectiveSampleSizeBelow { fraction } => {
                ess.mapv(|e| e < fraction * num_particles)
            }
        })
    }
}

/// Index of the first cumulative weight strictly above `position`.
fn inverse_cdf(cdf: &[f64], position: f64) -> usize {
    cdf.partition_point(|&c| c <= position)
        .min(cdf.len().saturating_sub(1))
}

fn cumulative(weights: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .scan(0.0, |total, &w| {
            *total += w;
            Some(*total)
        })
        .collect()
}

fn strided(cdf: &[f64], count: usize, scale: f64, rng: &mut StdRng) -> Vec<usize> {
    let offset: f64 = rng.random();
    (0..count)
        .map(|i| inverse_cdf(cdf, scale * (i as f64 + offset) / count as f64))
        .collect()
}

impl ResamplingStrategy {
    /// Draw `weights.len()` ancestors from probabilities that sum to one.
    pub fn ancestors(&self, weights: &[f64], rng: &mut StdRng) -> Vec<usize> {
        let n = weights.len();
        match self {
            ResamplingStrategy::Systematic => strided(&cumulative(weights), n, 1.0, rng),
            ResamplingStrategy::Multinomial => {
                let cdf = cumulative(weights);
                (0..n).map(|_| inverse_cdf(&cdf, rng.random())).collect()
            }
            ResamplingStrategy::Stratified => {
                let cdf = cumulative(weights);
                (0..n)
                    .map(|i| inverse_cdf(&cdf, (i as f64 + rng.random::<f64>()) / n as f64))
                    .collect()
            }
            ResamplingStrategy::Residual => {
                let mut ancestors = Vec::with_capacity(n);
                let mut residual = Vec::with_capacity(n);
                for (i, &w) in weights.iter().enumerate() {
                    let copies = (w * n as f64).floor();
                    ancestors.extend(std::iter::repeat_n(i, copies as usize));
                    residual.push(w * n as f64 - copies);
                }
                let remaining = n.saturating_sub(ancestors.len());
                if remaining > 0 {
                    let total: f64 = residual.iter().sum();
                    ancestors.extend(strided(&cumulative(&residual), remaining, total, rng));
                }
                ancestors.truncate(n);
                ancestors
            }
        }
    }
}

/// Ancestor indices for normalized `log_weights` of shape `batch + [N]`.
///
/// # Arguments
/// * `strategy` - the resampling scheme applied to every instance
/// * `log_weights` - normalized log-weights, `batch + [N]`
/// * `mask` - when given, one flag per batch instance; instances flagged `false` keep the
///   identity ancestry
/// * `seed` - instance `b` (in row-major batch order) draws from `seed.fold_in(b)`
///
/// # Returns
/// Ancestor indices shaped like `log_weights`. Instances whose weights are not finite keep the
/// identity ancestry and are logged as degenerate.
pub fn resample(
    strategy: ResamplingStrategy,
    log_weights: &ArrayD<f64>,
    mask: Option<&ArrayD<bool>>,
    seed: Seed,
) -> Result<ArrayD<usize>> {
    let ndim = log_weights.ndim();
    if ndim == 0 {
        return Err(FilterError::ShapeMismatch(
            "log-weights need a particle axis".to_string(),
        ));
    }
    let batch_shape = &log_weights.shape()[..ndim - 1];
    let num_particles = log_weights.shape()[ndim - 1];
    let flags: Option<Vec<bool>> = match mask {
        Some(mask) if mask.shape() != batch_shape => {
            return Err(FilterError::ShapeMismatch(format!(
                "resample mask has shape {:?}, expected the batch shape {batch_shape:?}",
                mask.shape()
            )));
        }
        Some(mask) => Some(mask.iter().copied().collect()),
        None => None,
    };

    let mut indices = Vec::with_capacity(log_weights.len());
    for (instance, lane) in log_weights.lanes(Axis(ndim - 1)).into_iter().enumerate() {
        let identity = 0..num_particles;
        if flags.as_ref().is_some_and(|f| !f[instance]) {
            indices.extend(identity);
            continue;
        }
        let weights: Vec<f64> = lane.iter().map(|w| w.exp()).collect();
        let total: f64 = weights.iter().sum();
        if !(total.is_finite() && total > 0.0) || weights.iter().any(|w| !w.is_finite()) {
            warn!(
                "batch instance {instance}: weights are degenerate (sum = {total}), keeping current particles"
            );
            indices.extend(identity);
            continue;
        }
        let weights: Vec<f64> = weights.iter().map(|w| w / total).collect();
        let mut rng = seed.fold_in(instance as u64).rng();
        indices.extend(strategy.ancestors(&weights, &mut rng));
    }
    Ok(ArrayD::from_shape_vec(IxDyn(log_weights.shape()), indices)?)
}
