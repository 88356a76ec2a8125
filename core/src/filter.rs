//! The particle filter step driver.
//!
//! A run walks the observation sequence one step at a time:
//!
//! 1. propose particles (from the prior or initial proposal at step 0, from the transition or
//!    proposal callback afterwards) together with their importance correction,
//! 2. weight them by the observation model evaluated at the current observation,
//! 3. normalize the weights and record the step's log marginal likelihood increment,
//! 4. resample every batch instance the criterion selects, and
//! 5. update the state and observation history windows.
//!
//! Ancestor indices produced by resampling at the end of step `t` describe which step-`t`
//! particle each step-`t + 1` particle descends from, so they are recorded with step `t + 1`;
//! step 0 records the identity. The filter is exposed both as a state machine
//! ([`ParticleFilter`]) and through the [`particle_filter`] and [`infer_trajectories`] entry
//! points.
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use log::{debug, info, warn};
use ndarray::{ArrayD, Axis, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::history::HistoryBuffer;
use crate::model::{HistoryArgs, StateSpaceModel};
use crate::proposal::{propose, propose_initial};
use crate::resample::{ResampleCriterion, ResamplingStrategy, resample};
use crate::seed::Seed;
use crate::state::{State, broadcast_to, identity_indices, stack_arrays};
use crate::trajectory::reconstruct_trajectories;
use crate::weights::{NormalizedWeights, effective_sample_size, normalize_log_weights};

/// Run configuration.
///
/// Every field has a default, so a configuration file only needs the fields it changes.
///
/// # Example
/// ```rust
/// use smc::filter::FilterConfig;
///
/// let config: FilterConfig = toml::from_str("num_particles = 500").unwrap();
/// assert_eq!(config.num_particles, 500);
/// assert_eq!(config.num_steps_state_history_to_pass, 0);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Particles per batch instance.
    pub num_particles: usize,
    /// Length of the state history window handed to callbacks (0 disables it).
    pub num_steps_state_history_to_pass: usize,
    /// Length of the observation history window handed to callbacks (0 disables it).
    pub num_steps_observation_history_to_pass: usize,
    pub resampling_strategy: ResamplingStrategy,
    /// Root seed; the same seed reproduces a run exactly.
    pub seed: Seed,
    pub resample_criterion: ResampleCriterion,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: 100,
            num_steps_state_history_to_pass: 0,
            num_steps_observation_history_to_pass: 0,
            resampling_strategy: ResamplingStrategy::default(),
            seed: Seed::default(),
            resample_criterion: ResampleCriterion::default(),
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(FilterError::InvalidConfig(
                "num_particles must be positive".to_string(),
            ));
        }
        if let ResampleCriterion::EffectiveSampleSizeBelow { fraction } = self.resample_criterion {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(FilterError::InvalidConfig(format!(
                    "effective sample size fraction {fraction} is outside (0, 1]"
                )));
            }
        }
        Ok(())
    }

    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| FilterError::ConfigFormat(e.to_string()))
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(|e| FilterError::ConfigFormat(e.to_string()))
    }

    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(|e| FilterError::ConfigFormat(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(|e| FilterError::ConfigFormat(e.to_string()))
    }

    /// Write as JSON or TOML depending on the file extension.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported_extension()),
        }
    }

    /// Read JSON or TOML depending on the file extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported_extension()),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported_extension() -> FilterError {
    FilterError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        "unsupported file extension",
    ))
}

/// Where a [`ParticleFilter`] is in its run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterPhase {
    /// Nothing drawn yet; the next step samples the initial particles.
    Initializing,
    /// The next step to process.
    Stepping(usize),
    Done,
}

/// Everything produced by one step. Never modified once emitted.
#[derive(Clone, Debug)]
pub struct StepRecord {
    pub step: usize,
    /// Particles before resampling, `batch + [N] + event`.
    pub particles: State,
    /// Normalized log-weights of `particles`, `batch + [N]`.
    pub log_weights: ArrayD<f64>,
    /// Which particle of the previous step each particle descends from.
    pub ancestor_indices: ArrayD<usize>,
    /// Incremental log marginal likelihood, one per batch instance.
    pub log_marginal_likelihood: ArrayD<f64>,
    /// Batch instances resampled at the end of this step.
    pub resampled: ArrayD<bool>,
    /// Particles carried into the next step.
    pub resampled_particles: State,
}

/// Stacked step records, with a leading time axis on every field.
#[derive(Clone, Debug)]
pub struct FilterOutput {
    /// `[T] + batch + [N] + event`
    pub particles: State,
    /// `[T] + batch + [N]`
    pub log_weights: ArrayD<f64>,
    /// `[T] + batch + [N]`
    pub ancestor_indices: ArrayD<usize>,
    /// `[T] + batch`
    pub step_log_marginal_likelihoods: ArrayD<f64>,
    /// `[T] + batch`
    pub resampled: ArrayD<bool>,
}

impl FilterOutput {
    pub fn from_records(records: &[StepRecord]) -> Result<Self> {
        if records.is_empty() {
            return Err(FilterError::EmptyObservations);
        }
        let particles: Vec<State> = records.iter().map(|r| r.particles.clone()).collect();
        let log_weights: Vec<ArrayD<f64>> = records.iter().map(|r| r.log_weights.clone()).collect();
        let ancestors: Vec<ArrayD<usize>> =
            records.iter().map(|r| r.ancestor_indices.clone()).collect();
        let lml: Vec<ArrayD<f64>> = records
            .iter()
            .map(|r| r.log_marginal_likelihood.clone())
            .collect();
        let resampled: Vec<ArrayD<bool>> = records.iter().map(|r| r.resampled.clone()).collect();
        Ok(FilterOutput {
            particles: State::stack(&particles, 0)?,
            log_weights: stack_arrays(&log_weights, 0)?,
            ancestor_indices: stack_arrays(&ancestors, 0)?,
            step_log_marginal_likelihoods: stack_arrays(&lml, 0)?,
            resampled: stack_arrays(&resampled, 0)?,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.step_log_marginal_likelihoods.shape()[0]
    }

    /// Sum of the step increments, one per batch instance.
    pub fn log_marginal_likelihood(&self) -> ArrayD<f64> {
        self.step_log_marginal_likelihoods.sum_axis(Axis(0))
    }

    /// Steps whose increment is `-inf` or `NaN` for at least one batch instance.
    pub fn degenerate_steps(&self) -> Vec<usize> {
        self.step_log_marginal_likelihoods
            .outer_iter()
            .enumerate()
            .filter(|(_, lml)| lml.iter().any(|x| !x.is_finite()))
            .map(|(t, _)| t)
            .collect()
    }
}

/// Check the observation leaves against the prior's batch shape and return the number of
/// timesteps.
fn num_timesteps(observations: &State, batch_shape: &[usize]) -> Result<usize> {
    let mut timesteps = None;
    for (path, leaf) in observations.flatten() {
        let name = if path.is_empty() { "observations" } else { path.as_str() };
        let shape = leaf.shape();
        if shape.len() < 1 + batch_shape.len() || shape[1..1 + batch_shape.len()] != *batch_shape {
            return Err(FilterError::ShapeMismatch(format!(
                "`{name}` has shape {shape:?}; expected [num_timesteps] + {batch_shape:?} + event shape"
            )));
        }
        match timesteps {
            Some(t) if t != shape[0] => {
                return Err(FilterError::ShapeMismatch(format!(
                    "`{name}` has {} timesteps, other observations have {t}",
                    shape[0]
                )));
            }
            _ => timesteps = Some(shape[0]),
        }
    }
    match timesteps {
        Some(0) | None => Err(FilterError::EmptyObservations),
        Some(t) => Ok(t),
    }
}

type ResampleFn<'m> = dyn Fn(usize, &ArrayD<f64>) -> ArrayD<bool> + 'm;

/// A particle filter run over a fixed observation sequence.
///
/// Configuration problems (bad config values, callbacks reading history windows that are not
/// kept, observations whose batch shape disagrees with the prior) are reported by
/// [`ParticleFilter::new`], before any particle is drawn. Distributions returned by the
/// callbacks only exist once a step builds them, so a transition or proposal of the wrong shape
/// fails step 1, after the record of step 0 has been emitted.
pub struct ParticleFilter<'m> {
    model: &'m StateSpaceModel,
    config: FilterConfig,
    observations: State,
    num_timesteps: usize,
    batch_ndim: usize,
    particle_shape: Vec<usize>,
    phase: FilterPhase,
    particles: Option<State>,
    log_weights: ArrayD<f64>,
    ancestors: ArrayD<usize>,
    state_history: HistoryBuffer,
    observation_history: HistoryBuffer,
    records: Vec<StepRecord>,
    resample_when: Option<Box<ResampleFn<'m>>>,
}

impl<'m> ParticleFilter<'m> {
    pub fn new(model: &'m StateSpaceModel, observations: State, config: FilterConfig) -> Result<Self> {
        config.validate()?;
        model.check_arity(
            config.num_steps_state_history_to_pass,
            config.num_steps_observation_history_to_pass,
        )?;
        let batch_shape = model.initial_state_prior.batch_shape();
        let num_timesteps = num_timesteps(&observations, &batch_shape)?;
        let mut particle_shape = batch_shape.clone();
        particle_shape.push(config.num_particles);
        let uniform = -(config.num_particles as f64).ln();
        Ok(ParticleFilter {
            model,
            observations,
            num_timesteps,
            batch_ndim: batch_shape.len(),
            log_weights: ArrayD::from_elem(IxDyn(&particle_shape), uniform),
            ancestors: identity_indices(&particle_shape),
            particle_shape,
            phase: FilterPhase::Initializing,
            particles: None,
            state_history: HistoryBuffer::new(config.num_steps_state_history_to_pass),
            observation_history: HistoryBuffer::new(config.num_steps_observation_history_to_pass),
            records: Vec::with_capacity(num_timesteps),
            resample_when: None,
            config,
        })
    }

    /// Replace the configured criterion with `criterion(step, normalized_log_weights)`, which
    /// must return one flag per batch instance.
    pub fn resample_when<F>(mut self, criterion: F) -> Self
    where
        F: Fn(usize, &ArrayD<f64>) -> ArrayD<bool> + 'm,
    {
        self.resample_when = Some(Box::new(criterion));
        self
    }

    pub fn phase(&self) -> FilterPhase {
        self.phase
    }

    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn batch_shape(&self) -> &[usize] {
        &self.particle_shape[..self.batch_ndim]
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// Process the next observation. Returns `None` once the run is done.
    pub fn step(&mut self) -> Result<Option<&StepRecord>> {
        let t = match self.phase {
            FilterPhase::Done => return Ok(None),
            FilterPhase::Initializing => 0,
            FilterPhase::Stepping(t) => t,
        };
        let record = self.advance(t)?;
        self.records.push(record);
        self.phase = if t + 1 < self.num_timesteps {
            FilterPhase::Stepping(t + 1)
        } else {
            FilterPhase::Done
        };
        Ok(self.records.last())
    }

    /// Step until every observation is consumed, then stack the records.
    pub fn run(mut self) -> Result<FilterOutput> {
        info!(
            "running particle filter: {} particles, {} timesteps, batch shape {:?}",
            self.config.num_particles,
            self.num_timesteps,
            self.batch_shape()
        );
        while self.step()?.is_some() {}
        self.finish()
    }

    /// Stack the records emitted so far.
    pub fn finish(self) -> Result<FilterOutput> {
        let output = FilterOutput::from_records(&self.records)?;
        info!(
            "particle filter finished after {} steps, log marginal likelihood {}",
            output.num_timesteps(),
            output.log_marginal_likelihood()
        );
        Ok(output)
    }

    fn advance(&mut self, t: usize) -> Result<StepRecord> {
        let step_seed = self.config.seed.fold_in(t as u64);
        let mut rng = step_seed.fold_in(0).rng();
        let state_window = self.state_history.current()?;
        let observation_window = self.observation_history.current()?;
        let histories = HistoryArgs {
            state_history: state_window.as_ref(),
            observation_history: observation_window.as_ref(),
        };

        let proposal = match &self.particles {
            None => propose_initial(self.model, &self.particle_shape, &mut rng)?,
            Some(previous) => propose(
                self.model,
                t - 1,
                previous,
                &histories,
                &self.particle_shape,
                &mut rng,
            )?,
        };

        let observation = self.observations.index_axis(0, t)?;
        let observation_dist = self
            .model
            .observation_fn
            .call(t, &proposal.particles, &histories)?;
        let observation_log_prob = broadcast_to(
            &observation_dist.log_prob(&observation.insert_axis(self.batch_ndim)?)?,
            &self.particle_shape,
        )?;

        let num_particles = self.config.num_particles as f64;
        let unnormalized = &self.log_weights + num_particles.ln()
            + &proposal.log_weight_correction
            + &observation_log_prob;
        let NormalizedWeights {
            log_weights,
            log_mean_weight,
        } = normalize_log_weights(&unnormalized)?;
        if log_mean_weight.iter().any(|x| !x.is_finite()) {
            warn!("step {t}: particle weights collapsed, log marginal likelihood {log_mean_weight}");
        }

        let requested = match &self.resample_when {
            Some(criterion) => criterion(t, &log_weights),
            None => self.config.resample_criterion.should_resample(&log_weights)?,
        };
        if requested.shape() != self.batch_shape() {
            return Err(FilterError::ShapeMismatch(format!(
                "resampling criterion returned shape {:?}, expected the batch shape {:?}",
                requested.shape(),
                self.batch_shape()
            )));
        }
        // Degenerate instances keep their non-finite weights instead of being reset.
        let resampled = Zip::from(&requested)
            .and(&log_mean_weight)
            .map_collect(|&r, &lml| r && lml.is_finite());
        let ancestors = resample(
            self.config.resampling_strategy,
            &log_weights,
            Some(&resampled),
            step_seed.fold_in(1),
        )?;
        let resampled_particles = proposal.particles.gather(self.batch_ndim, &ancestors)?;

        let mut carried = log_weights.clone();
        for (mut lane, &r) in carried
            .lanes_mut(Axis(self.batch_ndim))
            .into_iter()
            .zip(resampled.iter())
        {
            if r {
                lane.fill(-num_particles.ln());
            }
        }

        if self.state_history.is_enabled() {
            self.state_history.reindex(self.batch_ndim, &ancestors)?;
            self.state_history.append(resampled_particles.clone());
        }
        self.observation_history.append(observation);

        debug!(
            "step {t}: mean effective sample size {:.1}, {} of {} batch instances resampled",
            effective_sample_size(&log_weights)?.mean().unwrap_or(f64::NAN),
            resampled.iter().filter(|&&r| r).count(),
            resampled.len()
        );

        let ancestor_indices = std::mem::replace(&mut self.ancestors, ancestors);
        self.particles = Some(resampled_particles.clone());
        self.log_weights = carried;
        Ok(StepRecord {
            step: t,
            particles: proposal.particles,
            log_weights,
            ancestor_indices,
            log_marginal_likelihood: log_mean_weight,
            resampled,
            resampled_particles,
        })
    }
}

/// Run a particle filter over `observations`.
///
/// # Arguments
/// * `model` - the state-space model; its initial prior fixes the batch shape
/// * `observations` - leaves shaped `[T] + batch + event`
/// * `config` - particle count, seed, resampling policy and history window lengths
///
/// # Returns
/// Every step's pre-resampling particles, normalized log-weights, ancestor indices,
/// incremental log marginal likelihoods and resampling flags, stacked along a leading time axis.
///
/// # Errors
/// Configuration, arity and observation shape errors are raised before any particle is drawn.
/// A callback returning a distribution of the wrong shape fails the step that calls it.
pub fn particle_filter(
    model: &StateSpaceModel,
    observations: &State,
    config: &FilterConfig,
) -> Result<FilterOutput> {
    ParticleFilter::new(model, observations.clone(), config.clone())?.run()
}

/// Filter, reconstruct trajectories and resample them by the final weights, so that every
/// returned trajectory carries equal weight.
///
/// Returns the trajectories (`[T] + batch + [N] + event`) and the per-step log marginal
/// likelihoods (`[T] + batch`).
pub fn infer_trajectories(
    model: &StateSpaceModel,
    observations: &State,
    config: &FilterConfig,
) -> Result<(State, ArrayD<f64>)> {
    let output = particle_filter(model, observations, config)?;
    let weighted = reconstruct_trajectories(&output.particles, &output.ancestor_indices)?;

    let num_timesteps = output.num_timesteps();
    let final_log_weights = output
        .log_weights
        .index_axis(Axis(0), num_timesteps - 1)
        .to_owned();
    let final_ancestors = resample(
        config.resampling_strategy,
        &final_log_weights,
        None,
        config.seed.fold_in(num_timesteps as u64).fold_in(1),
    )?;
    let particle_axis = final_log_weights.ndim();
    let every_step = broadcast_to(
        &final_ancestors.insert_axis(Axis(0)),
        output.ancestor_indices.shape(),
    )?;
    let trajectories = weighted.gather(particle_axis, &every_step)?;
    Ok((trajectories, output.step_log_marginal_likelihoods))
}
