//! Demonstration models and CSV summaries of inferred trajectories.
//!
//! This module provides:
//! - `random_walk_model`, a biased walk whose observations carry no information, so that the
//!   inferred trajectories show the pure dynamics
//! - `epidemic_model`, a discrete SIR model with Poisson noise observed through daily case counts,
//!   together with a reference series of counts (`EPIDEMIC_CASE_COUNTS`)
//! - `TrajectorySummary`, per-step means and spreads of every state field, with CSV import/export
use std::collections::BTreeMap;
use std::path::Path;

use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

use crate::distributions::{
    Bernoulli, Deterministic, Distribution, JointDistribution, Poisson, Shifted, Uniform,
};
use crate::error::{FilterError, Result};
use crate::model::{ModelFn, StateSpaceModel};
use crate::state::State;

/// Daily detected cases of a small outbreak in a population of 1000.
pub const EPIDEMIC_CASE_COUNTS: [f64; 40] = [
    0., 4., 1., 5., 23., 27., 75., 127., 248., 384., 540., 683., 714., 611., 561., 493., 385., 348.,
    300., 277., 249., 219., 216., 174., 132., 122., 115., 99., 76., 84., 77., 56., 42., 56., 46.,
    38., 34., 44., 25., 27.,
];

fn drawn_array<'a>(drawn: &'a BTreeMap<String, State>, name: &str) -> Result<&'a ArrayD<f64>> {
    drawn
        .get(name)
        .ok_or_else(|| FilterError::StructureMismatch(format!("`{name}` has not been drawn")))?
        .array()
}

/// A walk on the integers that starts at 0 and moves up by one with probability
/// `step_probability` (otherwise stays put), observed through a flat `Uniform(-100, 100)`.
///
/// The state has a single field, `position`.
pub fn random_walk_model(step_probability: f64) -> Result<StateSpaceModel> {
    Bernoulli::new(step_probability)?;
    let prior = JointDistribution::new().with("position", Deterministic::new(0.0));
    let transition_fn = ModelFn::new(move |_, previous| {
        let position = previous.field_array("position")?;
        // one Bernoulli draw per particle
        let step = Bernoulli::new(position.mapv(|_| step_probability))?;
        Ok(JointDistribution::new()
            .with("position", Shifted::new(step, position.clone())?)
            .boxed())
    });
    let observation_fn = ModelFn::new(|_, _| Ok(Uniform::new(-100.0, 100.0)?.boxed()));
    Ok(StateSpaceModel::new(prior.boxed(), transition_fn, observation_fn))
}

/// Parameters of the discrete SIR model.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpidemicParameters {
    pub population_size: f64,
    /// Expected new infections per infected individual per day in a fully susceptible population.
    pub infection_rate: f64,
    /// Mean number of days an individual stays infected.
    pub infectious_period: f64,
    pub initial_infected: f64,
}

impl Default for EpidemicParameters {
    fn default() -> Self {
        EpidemicParameters {
            population_size: 1000.0,
            infection_rate: 1.1,
            infectious_period: 8.0,
            initial_infected: 1.0,
        }
    }
}

/// Discrete SIR dynamics with fields `susceptible`, `infected`, `new_infections` and
/// `new_recoveries`. Each day
///
/// - `new_infections ~ Poisson(infection_rate * infected * susceptible / population_size)`
/// - `new_recoveries ~ Poisson(infected / infectious_period)`
///
/// and the compartments are updated (clamped at zero). The detected case count is
/// `Poisson(infected)`.
pub fn epidemic_model(params: EpidemicParameters) -> Result<StateSpaceModel> {
    if !(params.population_size > 0.0 && params.infectious_period > 0.0) {
        return Err(FilterError::InvalidParameter(format!(
            "population size {} and infectious period {} must be positive",
            params.population_size, params.infectious_period
        )));
    }
    let prior = JointDistribution::new()
        .with(
            "susceptible",
            Deterministic::new(params.population_size - params.initial_infected),
        )
        .with("infected", Deterministic::new(params.initial_infected))
        .with("new_infections", Deterministic::new(params.initial_infected))
        .with("new_recoveries", Deterministic::new(0.0));

    let transition_fn = ModelFn::new(move |_, previous| {
        let susceptible = previous.field_array("susceptible")?.clone();
        let infected = previous.field_array("infected")?.clone();
        let infection_pressure =
            (&infected * &susceptible) * (params.infection_rate / params.population_size);
        let recovery_pressure = &infected / params.infectious_period;
        Ok(JointDistribution::new()
            .with("new_infections", Poisson::new(infection_pressure)?)
            .with("new_recoveries", Poisson::new(recovery_pressure)?)
            .with_dependent("susceptible", move |drawn| {
                let new_infections = drawn_array(drawn, "new_infections")?;
                Ok(Deterministic::new((&susceptible - new_infections).mapv(|x| x.max(0.0))).boxed())
            })
            .with_dependent("infected", move |drawn| {
                let new_infections = drawn_array(drawn, "new_infections")?;
                let new_recoveries = drawn_array(drawn, "new_recoveries")?;
                Ok(Deterministic::new(
                    (&infected + new_infections - new_recoveries).mapv(|x| x.max(0.0)),
                )
                .boxed())
            })
            .boxed())
    });
    let observation_fn = ModelFn::new(|_, state| {
        Ok(Poisson::new(state.field_array("infected")?.clone())?.boxed())
    });
    Ok(StateSpaceModel::new(prior.boxed(), transition_fn, observation_fn))
}

/// Summary statistics of one state field at one step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySummary {
    pub step: usize,
    /// Dotted field path, or `value` for an unstructured state.
    pub field: String,
    pub mean: f64,
    pub std_dev: f64,
    /// Incremental log marginal likelihood of the step, averaged over batch instances.
    pub log_marginal_likelihood: f64,
}

impl TrajectorySummary {
    /// One row per step and field of `trajectories` (leaves `[T] + ...`).
    pub fn from_trajectories(
        trajectories: &State,
        step_log_marginal_likelihoods: &ArrayD<f64>,
    ) -> Result<Vec<Self>> {
        let num_timesteps = step_log_marginal_likelihoods.shape().first().copied().unwrap_or(0);
        let mut rows = Vec::new();
        for t in 0..num_timesteps {
            let lml = step_log_marginal_likelihoods
                .index_axis(Axis(0), t)
                .mean()
                .unwrap_or(f64::NAN);
            for (path, leaf) in trajectories.flatten() {
                if leaf.ndim() == 0 || leaf.shape()[0] != num_timesteps {
                    return Err(FilterError::ShapeMismatch(format!(
                        "trajectory field `{path}` has shape {:?}, expected {num_timesteps} steps",
                        leaf.shape()
                    )));
                }
                let values = leaf.index_axis(Axis(0), t);
                let mean = values.mean().unwrap_or(f64::NAN);
                let variance = values.mapv(|x| (x - mean).powi(2)).mean().unwrap_or(f64::NAN);
                rows.push(TrajectorySummary {
                    step: t,
                    field: if path.is_empty() { "value".to_string() } else { path },
                    mean,
                    std_dev: variance.sqrt(),
                    log_marginal_likelihood: lml,
                });
            }
        }
        Ok(rows)
    }

    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in reader.deserialize() {
            records.push(result?);
        }
        Ok(records)
    }
}
