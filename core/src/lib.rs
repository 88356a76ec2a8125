//! Batched sequential Monte Carlo (particle filtering) for state-space models
//!
//! This crate runs a particle filter over a sequence of observations for any model that can be
//! written as a prior over the initial state, a transition distribution and an observation
//! distribution. Models are described through the small [`distributions::Distribution`] trait,
//! so priors and callbacks can be any family that can draw and score values. A whole batch of
//! independent filters (one per batch instance) advances in lock-step: every per-particle
//! quantity is an array shaped `batch + [num_particles] + event`, and every per-instance
//! quantity (incremental log marginal likelihoods, resampling decisions) is shaped `batch`.
//!
//! Beyond the classical bootstrap filter, the callbacks may read a window of the most recent
//! particle states and observations, which allows models with longer memory (autoregressive
//! observations, higher-order dynamics) without widening the state. An optional proposal
//! distribution replaces the transition when drawing particles, with the importance correction
//! folded into the weights.
//!
//! This crate is primarily built on:
//! - [`ndarray`](https://crates.io/crates/ndarray): batched particle and weight arrays.
//! - [`nalgebra`](https://crates.io/crates/nalgebra): dense linear algebra for the Gaussian
//!   families and the reference Kalman filter.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr):
//!   seeded random number generation and sampling.
//!
//! ## Crate overview
//!
//! - [distributions]: the [`Distribution`] trait and the families used by the bundled models.
//! - [error]: the crate-wide error type.
//! - [filter]: the step driver, its configuration and its output.
//! - [history]: fixed-length windows of past particles and observations.
//! - [kalman]: linear-Gaussian models and their exact Kalman filter, used as a reference.
//! - [linalg]: covariance factorization and related helpers.
//! - [model]: state-space models and their history-aware callbacks.
//! - [proposal]: drawing particles and their importance corrections.
//! - [resample]: resampling schemes and resampling criteria.
//! - [seed]: deterministic seed derivation.
//! - [sim]: demonstration models and CSV summaries of inferred trajectories.
//! - [state]: nested particle states and the array helpers they rely on.
//! - [trajectory]: tracing ancestry back into full trajectories.
//! - [weights]: log-space weight normalization and effective sample size.
//!
//! ## Example
//!
//! ```rust
//! use smc::distributions::{Distribution, Normal};
//! use smc::{FilterConfig, ModelFn, State, StateSpaceModel, infer_trajectories};
//!
//! let model = StateSpaceModel::new(
//!     Normal::new(0.0, 1.0).unwrap().boxed(),
//!     ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 0.1)?.boxed())),
//!     ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 0.5)?.boxed())),
//! );
//! let observations = State::from_vec(vec![0.2, 0.4, 0.5, 0.3]);
//! let config = FilterConfig { num_particles: 200, ..Default::default() };
//! let (trajectories, log_marginal_likelihoods) =
//!     infer_trajectories(&model, &observations, &config).unwrap();
//! assert_eq!(trajectories.array().unwrap().shape(), &[4, 200]);
//! assert_eq!(log_marginal_likelihoods.shape(), &[4]);
//! ```
pub mod distributions;
pub mod error;
pub mod filter;
pub mod history;
pub mod kalman;
pub mod linalg;
pub mod model;
pub mod proposal;
pub mod resample;
pub mod seed;
pub mod sim;
pub mod state;
pub mod trajectory;
pub mod weights;

pub use distributions::{BoxedDistribution, Distribution};
pub use error::{FilterError, Result};
pub use filter::{
    FilterConfig, FilterOutput, FilterPhase, ParticleFilter, StepRecord, infer_trajectories,
    particle_filter,
};
pub use model::{HistoryArgs, ModelFn, StateSpaceModel};
pub use resample::{ResampleCriterion, ResamplingStrategy};
pub use seed::Seed;
pub use state::State;
pub use trajectory::reconstruct_trajectories;
