//! End-to-end tests of the particle filter on models with known behaviour.
//!
//! The models range from a pure-dynamics random walk (uninformative observations) to a
//! linear-Gaussian system whose exact marginal likelihood is available from the Kalman filter.
//! Tolerances on Monte Carlo estimates are loose enough to hold for any reasonable seed; every
//! run is seeded, so the tests are deterministic.
//!
//! ## Test Structure
//!
//! 1. Pure dynamics and batched filters
//! 2. Trajectory reconstruction
//! 3. Proposals and history-dependent models
//! 4. Agreement with the exact Kalman filter
//! 5. Configuration errors, degenerate steps and resampling policy
use assert_approx_eq::assert_approx_eq;
use nalgebra::{dmatrix, dvector};
use ndarray::{Array1, ArrayD, Axis, IxDyn, Slice, array};

use smc::distributions::{Deterministic, Distribution, JointDistribution, Normal, Poisson, Uniform};
use smc::filter::{FilterConfig, FilterOutput, ParticleFilter, infer_trajectories, particle_filter};
use smc::kalman::LinearGaussianStateSpaceModel;
use smc::model::{ModelFn, StateSpaceModel};
use smc::resample::ResampleCriterion;
use smc::seed::Seed;
use smc::sim::{EPIDEMIC_CASE_COUNTS, EpidemicParameters, epidemic_model, random_walk_model};
use smc::state::State;
use smc::trajectory::reconstruct_trajectories;
use smc::weights::log_sum_exp;
use smc::FilterError;

const HALF_LN_TWO_PI: f64 = 0.918_938_533_204_672_7;

fn config(num_particles: usize, seed: u64) -> FilterConfig {
    FilterConfig {
        num_particles,
        seed: Seed::new(seed),
        ..Default::default()
    }
}

/// Posterior mean of `values` (`... + [N]`) under normalized `log_weights` of the same shape.
fn weighted_mean(values: &ArrayD<f64>, log_weights: &ArrayD<f64>) -> ArrayD<f64> {
    let last = Axis(log_weights.ndim() - 1);
    (values * &log_weights.mapv(f64::exp)).sum_axis(last)
}

fn gaussian_model(transition_scale: f64, observation_scale: f64) -> StateSpaceModel {
    StateSpaceModel::new(
        Normal::new(0.0, 1.0).unwrap().boxed(),
        ModelFn::new(move |_, x| Ok(Normal::new(x.array()?.clone(), transition_scale)?.boxed())),
        ModelFn::new(move |_, x| Ok(Normal::new(x.array()?.clone(), observation_scale)?.boxed())),
    )
}

// ==================== Pure dynamics and batched filters ====================

#[test]
fn test_random_walk() {
    let model = random_walk_model(0.75).unwrap();
    let observations = State::from_vec(vec![0.0; 9]);
    let (trajectories, _) = infer_trajectories(&model, &observations, &config(16384, 1)).unwrap();
    let position = trajectories.field_array("position").unwrap();
    assert_eq!(position.shape(), &[9, 16384]);

    assert!(position.iter().all(|&x| (0.0..=8.0).contains(&x)));
    for t in 1..9 {
        let step = &position.index_axis(Axis(0), t) - &position.index_axis(Axis(0), t - 1);
        assert!(step.iter().all(|&s| s == 0.0 || s == 1.0));
    }

    // Eight Bernoulli(0.75) steps: mean 6, variance 1.5.
    let last = position.index_axis(Axis(0), 8);
    let mean = last.mean().unwrap();
    let variance = last.mapv(|x| (x - mean).powi(2)).mean().unwrap();
    assert_approx_eq!(mean, 6.0, 0.1);
    assert_approx_eq!(variance, 1.5, 0.1);
}

#[test]
fn test_batch_of_filters() {
    let batch_shape = [3, 2];
    let num_particles = 1000;
    let num_timesteps = 40;

    let prior = JointDistribution::new()
        .with("position", Normal::new(0.0, ArrayD::<f64>::ones(IxDyn(&batch_shape))).unwrap())
        .with(
            "velocity",
            Normal::new(0.0, ArrayD::from_elem(IxDyn(&batch_shape), 0.1)).unwrap(),
        );
    let transition_fn = ModelFn::new(|_, previous| {
        let position = previous.field_array("position")?;
        let velocity = previous.field_array("velocity")?;
        Ok(JointDistribution::new()
            .with("position", Normal::new(position + velocity, 0.1)?)
            .with("velocity", Normal::new(velocity.clone(), 0.01)?)
            .boxed())
    });
    let observation_fn =
        ModelFn::new(|_, state| Ok(Normal::new(state.field_array("position")?.clone(), 0.1)?.boxed()));
    let model = StateSpaceModel::new(prior.boxed(), transition_fn, observation_fn);

    let true_initial_positions = array![[0.5, -0.3], [1.2, 0.0], [-0.8, 0.4]];
    let true_velocities = array![[0.05, -0.1], [0.12, 0.0], [-0.03, 0.08]];
    let observed_positions = ArrayD::from_shape_fn(IxDyn(&[num_timesteps, 3, 2]), |ix| {
        true_velocities[[ix[1], ix[2]]] * ix[0] as f64 + true_initial_positions[[ix[1], ix[2]]]
    });

    let output = particle_filter(
        &model,
        &State::Array(observed_positions.clone()),
        &config(num_particles, 3),
    )
    .unwrap();

    let expected = [num_timesteps, 3, 2, num_particles];
    let position = output.particles.field_array("position").unwrap();
    let velocity = output.particles.field_array("velocity").unwrap();
    assert_eq!(position.shape(), &expected);
    assert_eq!(velocity.shape(), &expected);
    assert_eq!(output.ancestor_indices.shape(), &expected);
    assert_eq!(output.log_weights.shape(), &expected);
    assert_eq!(output.step_log_marginal_likelihoods.shape(), &[num_timesteps, 3, 2]);

    let position_means = weighted_mean(position, &output.log_weights);
    for (estimate, observed) in position_means.iter().zip(observed_positions.iter()) {
        assert_approx_eq!(*estimate, *observed, 0.1);
    }

    let velocity_means = weighted_mean(velocity, &output.log_weights);
    let final_velocity = velocity_means.index_axis(Axis(0), num_timesteps - 1);
    for (estimate, truth) in final_velocity.iter().zip(true_velocities.iter()) {
        assert_approx_eq!(*estimate, *truth, 0.05);
    }

    // Uncertainty in velocity decreases over time.
    let velocity_std = velocity.std_axis(Axis(3), 0.0);
    let first = velocity_std.index_axis(Axis(0), 0);
    let last = velocity_std.index_axis(Axis(0), num_timesteps - 1);
    assert!(first.iter().zip(last.iter()).all(|(f, l)| l < f));

    let trajectories = reconstruct_trajectories(&output.particles, &output.ancestor_indices).unwrap();
    assert_eq!(trajectories.field_array("position").unwrap().shape(), &expected);
    assert_eq!(trajectories.field_array("velocity").unwrap().shape(), &expected);
}

#[test]
fn test_normalized_weights_sum_to_one() {
    let prior = Normal::new(vec![0.0, 1.0, -1.0], 1.0).unwrap();
    let model = StateSpaceModel::new(
        prior.boxed(),
        ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 0.3)?.boxed())),
        ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 0.5)?.boxed())),
    );
    let observations = State::Array(ArrayD::from_shape_fn(IxDyn(&[6, 3]), |ix| {
        0.2 * ix[0] as f64 - ix[1] as f64
    }));
    let output = particle_filter(&model, &observations, &config(64, 5)).unwrap();
    assert_eq!(output.log_weights.shape(), &[6, 3, 64]);
    for lane in output.log_weights.lanes(Axis(2)) {
        let total: f64 = lane.iter().map(|w| w.exp()).sum();
        assert_approx_eq!(total, 1.0, 1e-9);
    }
    let lse = log_sum_exp(&output.log_weights).unwrap();
    assert!(lse.iter().all(|x| x.abs() < 1e-9));
}

#[test]
fn test_epidemiological_model() {
    let model = epidemic_model(EpidemicParameters::default()).unwrap();
    let observations = State::from_vec(EPIDEMIC_CASE_COUNTS.to_vec());
    let (trajectories, lps) = infer_trajectories(&model, &observations, &config(100, 11)).unwrap();
    assert_eq!(lps.shape(), &[40]);

    // The susceptible population never grows.
    let susceptible = trajectories.field_array("susceptible").unwrap();
    assert_eq!(susceptible.shape(), &[40, 100]);
    let later = susceptible.slice_axis(Axis(0), Slice::from(1..));
    let earlier = susceptible.slice_axis(Axis(0), Slice::new(0, Some(-1), 1));
    assert!(later.iter().zip(earlier.iter()).all(|(l, e)| l <= e));
    let infected = trajectories.field_array("infected").unwrap();
    assert!(infected.iter().all(|&i| i >= 0.0));
}

// ==================== Trajectory reconstruction ====================

#[test]
fn test_reconstruct_trajectories_toy_example() {
    // 1  --  4  -- 7
    // 2  \/  5  .- 8
    // 3  /\  6 /-- 9
    let particles = State::Array(array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]].into_dyn());
    let parents: ArrayD<usize> = array![[0, 1, 2], [0, 2, 1], [0, 2, 2]].into_dyn();
    let trajectories = reconstruct_trajectories(&particles, &parents).unwrap();
    assert_eq!(
        trajectories.array().unwrap(),
        &array![[1.0, 2.0, 2.0], [4.0, 6.0, 6.0], [7.0, 8.0, 9.0]].into_dyn()
    );
}

#[test]
fn test_reconstruction_is_idempotent() {
    let model = gaussian_model(0.5, 1.0);
    let observations = State::from_vec(vec![0.3, -0.1, 0.8, 1.2, 0.4]);
    let output = particle_filter(&model, &observations, &config(32, 9)).unwrap();
    let before = output.particles.clone();
    let first = reconstruct_trajectories(&output.particles, &output.ancestor_indices).unwrap();
    let second = reconstruct_trajectories(&output.particles, &output.ancestor_indices).unwrap();
    assert_eq!(first, second);
    assert_eq!(output.particles, before);

    // The final step is the particle set itself.
    assert_eq!(
        first.array().unwrap().index_axis(Axis(0), 4),
        output.particles.array().unwrap().index_axis(Axis(0), 4)
    );
}

// ==================== Proposals and history-dependent models ====================

#[test]
fn test_data_driven_proposal() {
    let targets = [60.0, -179.2, 1337.42];
    let num_particles = 100;

    // Constrained almost entirely by the observations; the dynamics would be a poor proposal.
    let model = StateSpaceModel::new(
        Normal::new(0.0, 1e6).unwrap().boxed(),
        ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 1e6)?.boxed())),
        ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 0.1)?.boxed())),
    )
    .with_initial_state_proposal(Normal::new(targets[0], 0.1).unwrap().boxed())
    .with_proposal_fn(ModelFn::new(move |step, x| {
        Ok(Normal::new(x.array()?.mapv(|_| targets[step + 1]), 1.0)?.boxed())
    }));

    let observations = State::from_vec(targets.to_vec());
    let (trajectories, _) =
        infer_trajectories(&model, &observations, &config(num_particles, 21)).unwrap();
    let trajectories = trajectories.array().unwrap();
    assert_eq!(trajectories.shape(), &[3, num_particles]);
    for (t, target) in targets.iter().enumerate() {
        for x in trajectories.index_axis(Axis(0), t) {
            assert_approx_eq!(*x, *target, 1.0);
        }
    }
}

fn normal_log_prob(x: f64, loc: f64, scale: f64) -> f64 {
    let z = (x - loc) / scale;
    -0.5 * z * z - scale.ln() - HALF_LN_TWO_PI
}

#[test]
fn test_initial_proposal_with_batched_prior() {
    let locs = [0.0, 10.0, 20.0];
    let model = StateSpaceModel::new(
        Normal::new(locs.to_vec(), 1.0).unwrap().boxed(),
        ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 0.1)?.boxed())),
        ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 1.0)?.boxed())),
    )
    .with_initial_state_proposal(Normal::new(locs.to_vec(), 2.0).unwrap().boxed());
    let observed = ArrayD::from_shape_fn(IxDyn(&[2, 3]), |ix| locs[ix[1]] + 0.5);

    // Particle counts equal to and different from the batch size.
    for num_particles in [3, 5, 400] {
        let output = particle_filter(
            &model,
            &State::Array(observed.clone()),
            &config(num_particles, 17),
        )
        .unwrap();
        let particles = output.particles.array().unwrap();
        assert_eq!(particles.shape(), &[2, 3, num_particles]);

        for b in 0..3 {
            let unnormalized: Array1<f64> = (0..num_particles)
                .map(|j| {
                    let x = particles[[0, b, j]];
                    normal_log_prob(x, locs[b], 1.0) - normal_log_prob(x, locs[b], 2.0)
                        + normal_log_prob(observed[[0, b]], x, 1.0)
                })
                .collect();
            let lse = log_sum_exp(&unnormalized.clone().into_dyn()).unwrap()[[]];
            for j in 0..num_particles {
                assert_approx_eq!(output.log_weights[[0, b, j]], unnormalized[j] - lse, 1e-9);
            }
        }

        if num_particles == 400 {
            let means = weighted_mean(
                &particles.index_axis(Axis(0), 0).to_owned(),
                &output.log_weights.index_axis(Axis(0), 0).to_owned(),
            );
            for b in 0..3 {
                // Posterior of N(loc, 1) prior and N(x, 1) likelihood at loc + 0.5.
                assert_approx_eq!(means[[b]], locs[b] + 0.25, 0.2);
            }
        }
    }
}

#[test]
fn test_model_can_use_state_history() {
    let prior = JointDistribution::new().with("x", Poisson::new(1.0).unwrap());

    // Deterministic dynamics compute a Fibonacci sequence.
    let fibonacci_transition_fn = ModelFn::with_state_history(|_, _, history| {
        let history = history.ok_or_else(|| {
            FilterError::InvalidConfig("transition needs the state history".to_string())
        })?;
        let x = history.field_array("x")?;
        let len = x.shape()[0];
        let last_two = x.slice_axis(Axis(0), Slice::from(len.saturating_sub(2)..));
        Ok(JointDistribution::new()
            .with("x", Deterministic::new(last_two.sum_axis(Axis(0))))
            .boxed())
    });

    // Observe the ratio of the current and previous state.
    let ratio_observation_fn = ModelFn::with_state_history(|_, state, history| {
        let x = state.field_array("x")?;
        let ratio = match history {
            None => x.mapv(|_| 1.0),
            Some(history) => {
                let previous = history.field_array("x")?;
                let last = previous.index_axis(Axis(0), previous.shape()[0] - 1);
                x / &last.mapv(|p| p + 1e-6)
            }
        };
        Ok(Normal::new(ratio, 0.1)?.boxed())
    });

    let model = StateSpaceModel::new(prior.boxed(), fibonacci_transition_fn, ratio_observation_fn);
    let golden_ratio = (1.0 + 5.0_f64.sqrt()) / 2.0;
    let observations = State::from_vec(vec![golden_ratio; 10]);
    let config = FilterConfig {
        num_steps_state_history_to_pass: 2,
        ..config(100, 13)
    };
    let (trajectories, lps) = infer_trajectories(&model, &observations, &config).unwrap();
    let x = trajectories.field_array("x").unwrap();

    for t in 2..10 {
        for i in 0..100 {
            assert_approx_eq!(x[[t, i]], x[[t - 1, i]] + x[[t - 2, i]], 1e-9);
        }
    }

    // Successive ratios approach the golden ratio, so the likelihoods increase.
    for t in 2..10 {
        assert!(lps[[t]] > lps[[t - 2]], "step {t}: {} <= {}", lps[[t]], lps[[t - 2]]);
    }

    // Series starting at zero never approach the golden ratio and are weeded out.
    assert!(x.index_axis(Axis(0), 0).iter().all(|&x0| x0 >= 1.0));
}

#[test]
fn test_model_can_use_observation_history() {
    let weights = [0.1, -0.2, 0.7];
    let observations = [0.1, 3.0, -0.7, 1.1, 0.0, 14.0, -3.0, 5.8];

    // Autoregressive on the observations; the state plays no part.
    let prior = JointDistribution::new().with("dummy_state", Deterministic::new(0.0));
    let transition_fn = ModelFn::new(|_, state| {
        Ok(JointDistribution::new()
            .with("dummy_state", Deterministic::new(state.field_array("dummy_state")?.clone()))
            .boxed())
    });
    let autoregressive_observation_fn = ModelFn::with_observation_history(move |step, _, history| {
        let loc = match history {
            None => 0.0,
            Some(history) => {
                let history = history.array()?;
                let num_terms = step.min(weights.len());
                let usable = &weights[weights.len() - num_terms..];
                history.iter().zip(usable).map(|(y, w)| y * w).sum::<f64>()
            }
        };
        Ok(Normal::new(loc, 1.0)?.boxed())
    });

    // Reference conditional log-probs under the truncated autoregressive model.
    let expected_lps: Vec<f64> = (0..observations.len())
        .map(|t| {
            let start = t.saturating_sub(weights.len());
            let context = t - start;
            let loc: f64 = observations[start..t]
                .iter()
                .zip(&weights[weights.len() - context..])
                .map(|(y, w)| y * w)
                .sum();
            -0.5 * (observations[t] - loc).powi(2) - HALF_LN_TWO_PI
        })
        .collect();

    let model = StateSpaceModel::new(prior.boxed(), transition_fn, autoregressive_observation_fn);
    let config = FilterConfig {
        num_steps_observation_history_to_pass: weights.len(),
        ..config(2, 0)
    };
    let output = particle_filter(&model, &State::from_vec(observations.to_vec()), &config).unwrap();
    let lps = &output.step_log_marginal_likelihoods;
    assert_eq!(lps.shape(), &[observations.len()]);
    for (t, expected) in expected_lps.iter().enumerate() {
        assert_approx_eq!(lps[[t]], *expected, 1e-9);
    }
}

// ==================== Agreement with the exact Kalman filter ====================

fn two_dimensional_lgssm() -> LinearGaussianStateSpaceModel {
    let transition_scale = dmatrix![0.3, 0.0; -0.1, 0.2];
    let observation_scale = dmatrix![0.5, 0.0; 0.1, 0.5];
    LinearGaussianStateSpaceModel::new(
        dvector![0.0, 0.0],
        dmatrix![1.0, 0.0; 0.0, 1.0],
        dmatrix![1.0, -0.5; 0.4, -1.0],
        dvector![1.0, 1.0],
        &transition_scale * transition_scale.transpose(),
        dmatrix![0.1, 1.0; 1.0, 0.2],
        dvector![-0.3, -0.3],
        &observation_scale * observation_scale.transpose(),
    )
    .unwrap()
}

#[test]
fn test_estimated_prob_approximates_true_prob() {
    let lgssm = two_dimensional_lgssm();
    let (_, observations) = lgssm.sample(20, Seed::new(31)).unwrap();
    let exact = lgssm.forward_filter(&observations).unwrap();

    let model = lgssm.to_state_space_model().unwrap();
    let output = particle_filter(&model, &State::Array(observations), &config(2000, 37)).unwrap();
    let particles = output.particles.array().unwrap();
    assert_eq!(particles.shape(), &[20, 2000, 2]);

    for t in 0..20 {
        let weights = output.log_weights.index_axis(Axis(0), t).mapv(f64::exp);
        let step = particles.index_axis(Axis(0), t);
        let estimate: Array1<f64> = (0..2)
            .map(|i| (&step.index_axis(Axis(1), i) * &weights).sum())
            .collect();
        for i in 0..2 {
            let mean = exact.filtered_means[t][i];
            assert_approx_eq!(estimate[i], mean, 0.1 + 0.1 * mean.abs());
        }
        assert_approx_eq!(
            output.step_log_marginal_likelihoods[[t]],
            exact.log_likelihoods[t],
            0.5
        );
    }
}

// ==================== Configuration, degeneracy and resampling policy ====================

#[test]
fn test_same_seed_reproduces_run() {
    let model = gaussian_model(0.5, 0.5);
    let observations = State::from_vec(vec![0.1, 0.5, 0.2, -0.4]);
    let first = particle_filter(&model, &observations, &config(50, 77)).unwrap();
    let second = particle_filter(&model, &observations, &config(50, 77)).unwrap();
    let other = particle_filter(&model, &observations, &config(50, 78)).unwrap();

    assert_eq!(first.particles, second.particles);
    assert_eq!(first.ancestor_indices, second.ancestor_indices);
    assert_eq!(first.step_log_marginal_likelihoods, second.step_log_marginal_likelihoods);
    assert_ne!(first.particles, other.particles);
}

#[test]
fn test_history_consumer_without_window_is_rejected() {
    let transition_fn =
        ModelFn::with_state_history(|_, x, _| Ok(Normal::new(x.array()?.clone(), 1.0)?.boxed()));
    let observation_fn =
        ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 1.0)?.boxed()));
    let model = StateSpaceModel::new(
        Normal::new(0.0, 1.0).unwrap().boxed(),
        transition_fn,
        observation_fn,
    );
    let observations = State::from_vec(vec![0.0, 1.0]);

    let err = ParticleFilter::new(&model, observations.clone(), FilterConfig::default())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        FilterError::CallbackArity { callback: "transition_fn", history: "state" }
    ));
    assert!(err.to_string().contains("num_steps_state_history_to_pass"));

    let config = FilterConfig {
        num_steps_state_history_to_pass: 1,
        ..Default::default()
    };
    assert!(ParticleFilter::new(&model, observations, config).is_ok());
}

#[test]
fn test_observation_batch_shape_mismatch_is_rejected() {
    // Prior over a batch of 3 filters.
    let model = StateSpaceModel::new(
        Normal::new(0.0, vec![1.0, 1.0, 1.0]).unwrap().boxed(),
        ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 1.0)?.boxed())),
        ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 1.0)?.boxed())),
    );
    let unbatched = State::from_vec(vec![0.0; 5]);
    let wrong_batch = State::Array(ArrayD::zeros(IxDyn(&[5, 2])));
    for observations in [unbatched, wrong_batch] {
        assert!(matches!(
            particle_filter(&model, &observations, &FilterConfig::default()),
            Err(FilterError::ShapeMismatch(_))
        ));
    }
    let batched = State::Array(ArrayD::zeros(IxDyn(&[5, 3])));
    assert!(particle_filter(&model, &batched, &config(10, 0)).is_ok());
}

#[test]
fn test_transition_batch_shape_mismatch_fails_first_transition() {
    let model = StateSpaceModel::new(
        Normal::new(0.0, vec![1.0, 1.0, 1.0]).unwrap().boxed(),
        ModelFn::new(|_, _| Ok(Normal::new(vec![0.0, 0.0], 1.0)?.boxed())),
        ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 1.0)?.boxed())),
    );
    let observations = State::Array(ArrayD::zeros(IxDyn(&[4, 3])));
    let mut filter = ParticleFilter::new(&model, observations, config(10, 0)).unwrap();
    assert!(filter.step().unwrap().is_some());
    assert!(matches!(filter.step(), Err(FilterError::ShapeMismatch(_))));
    assert_eq!(filter.records().len(), 1);
}

#[test]
fn test_weight_collapse_is_reported_not_raised() {
    // No particle can explain an observation at 0.
    let model = StateSpaceModel::new(
        Normal::new(0.0, 1.0).unwrap().boxed(),
        ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 1.0)?.boxed())),
        ModelFn::new(|_, _| Ok(Uniform::new(10.0, 11.0)?.boxed())),
    );
    let observations = State::from_vec(vec![0.0, 0.0]);
    let output: FilterOutput = particle_filter(&model, &observations, &config(20, 4)).unwrap();

    assert_eq!(output.step_log_marginal_likelihoods[[0]], f64::NEG_INFINITY);
    assert_eq!(output.degenerate_steps(), vec![0, 1]);
    assert!(!output.log_marginal_likelihood()[[]].is_finite());
    // Collapsed weights are never resampled; the ancestry stays the identity.
    assert!(output.resampled.iter().all(|&r| !r));
    let ancestors = output.ancestor_indices.index_axis(Axis(0), 1);
    assert!(ancestors.iter().enumerate().all(|(i, &a)| a == i));
}

#[test]
fn test_skipped_resampling_keeps_weights() {
    // Static particles weighted by two observations without any resampling in between.
    let model = StateSpaceModel::new(
        Normal::new(0.0, 1.0).unwrap().boxed(),
        ModelFn::new(|_, x| Ok(Deterministic::new(x.array()?.clone()).boxed())),
        ModelFn::new(|_, x| Ok(Normal::new(x.array()?.clone(), 1.0)?.boxed())),
    );
    let observations = [0.5, -0.2];
    let config = FilterConfig {
        resample_criterion: ResampleCriterion::Never,
        ..config(50, 8)
    };
    let output = particle_filter(&model, &State::from_vec(observations.to_vec()), &config).unwrap();
    assert!(output.resampled.iter().all(|&r| !r));

    let particles = output.particles.array().unwrap();
    let x = particles.index_axis(Axis(0), 0).to_owned();
    assert_eq!(x, particles.index_axis(Axis(0), 1));

    let log_likelihood = |obs: f64| x.mapv(|xi| -0.5 * (obs - xi).powi(2) - HALF_LN_TWO_PI);
    let joint = (log_likelihood(observations[0]) + log_likelihood(observations[1])).into_dyn();
    let lse = log_sum_exp(&joint).unwrap()[[]];

    let final_weights = output.log_weights.index_axis(Axis(0), 1);
    for (w, j) in final_weights.iter().zip(joint.iter()) {
        assert_approx_eq!(*w, *j - lse, 1e-9);
    }
    assert_approx_eq!(output.log_marginal_likelihood()[[]], lse - 50.0_f64.ln(), 1e-9);
}

#[test]
fn test_custom_resampling_criterion() {
    let model = gaussian_model(0.5, 1.0);
    let observations = State::from_vec(vec![0.0, 0.3, 0.1, -0.2, 0.4]);
    let output = ParticleFilter::new(&model, observations, config(40, 2))
        .unwrap()
        .resample_when(|step, _| ArrayD::from_elem(IxDyn(&[]), step % 2 == 0))
        .run()
        .unwrap();
    let flags: Vec<bool> = output.resampled.iter().copied().collect();
    assert_eq!(flags, vec![true, false, true, false, true]);

    // Steps following a skipped resampling inherit the identity ancestry.
    for t in [2, 4] {
        let ancestors = output.ancestor_indices.index_axis(Axis(0), t);
        assert!(ancestors.iter().enumerate().all(|(i, &a)| a == i));
    }
}
