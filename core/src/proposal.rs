//! Drawing the next particle set and the importance correction that goes with it.
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;

use crate::distributions::Distribution;
use crate::error::{FilterError, Result};
use crate::model::{HistoryArgs, StateSpaceModel};
use crate::state::{State, broadcast_to, move_array_axis, sub};

/// New particles plus `log p(x) - log q(x)`, shaped `batch_shape + [num_particles]`.
#[derive(Clone, Debug)]
pub struct Proposal {
    pub particles: State,
    pub log_weight_correction: ArrayD<f64>,
}

/// `log p(x) - log q(x)` broadcast to the particle shape.
fn correction(
    target: &dyn Distribution,
    proposal: &dyn Distribution,
    particles: &State,
    particle_shape: &[usize],
) -> Result<ArrayD<f64>> {
    let ratio = sub(&target.log_prob(particles)?, &proposal.log_prob(particles)?)?;
    broadcast_to(&ratio, particle_shape)
}

/// `log p(x) - log q(x)` for particles drawn with `sample_n`, whose particle axis sits after the
/// batch axes. Distribution parameters are shaped `batch` and align with trailing axes, so the
/// particle axis is moved to the front for scoring and moved back afterwards.
fn initial_correction(
    target: &dyn Distribution,
    proposal: &dyn Distribution,
    particles: &State,
    particle_shape: &[usize],
) -> Result<ArrayD<f64>> {
    let batch_ndim = particle_shape.len().saturating_sub(1);
    let leading = particles.move_axis(batch_ndim, 0)?;
    let ratio = sub(&target.log_prob(&leading)?, &proposal.log_prob(&leading)?)?;
    let mut leading_shape = Vec::with_capacity(particle_shape.len());
    leading_shape.push(particle_shape[batch_ndim]);
    leading_shape.extend_from_slice(&particle_shape[..batch_ndim]);
    move_array_axis(&broadcast_to(&ratio, &leading_shape)?, 0, batch_ndim)
}

/// Sample the initial particle set from the initial proposal, or from the prior when there is
/// none.
///
/// # Arguments
/// * `model` - the model supplying the initial prior and the optional initial proposal
/// * `particle_shape` - `batch_shape + [num_particles]`
/// * `rng` - the random stream for this step
///
/// # Returns
/// The particles (every leaf shaped `particle_shape + event_shape`) and the importance
/// correction `log prior(x) - log proposal(x)`, which is zero without an initial proposal.
///
/// # Errors
/// Returns a `ShapeMismatch` when the drawn particles do not start with `particle_shape`.
pub fn propose_initial(
    model: &StateSpaceModel,
    particle_shape: &[usize],
    rng: &mut StdRng,
) -> Result<Proposal> {
    if particle_shape.is_empty() {
        return Err(FilterError::ShapeMismatch(
            "particle shape needs a particle axis".to_string(),
        ));
    }
    let num_particles = particle_shape[particle_shape.len() - 1];
    let prior = model.initial_state_prior.as_ref();
    let (particles, log_weight_correction) = match &model.initial_state_proposal {
        Some(proposal) => {
            let particles = proposal.sample_n(num_particles, rng)?;
            particles.check_leading_shape(particle_shape, "initial particles")?;
            let ratio = initial_correction(prior, proposal.as_ref(), &particles, particle_shape)?;
            (particles, ratio)
        }
        None => (
            prior.sample_n(num_particles, rng)?,
            ArrayD::zeros(IxDyn(particle_shape)),
        ),
    };
    particles.check_leading_shape(particle_shape, "initial particles")?;
    Ok(Proposal {
        particles,
        log_weight_correction,
    })
}

/// Advance `previous` by one step.
///
/// The transition (and the proposal, when the model has one) is built from the previous
/// particles, so its parameters already carry the particle axis and score the new particles
/// directly.
///
/// # Arguments
/// * `model` - the model supplying the transition and the optional proposal
/// * `step` - the index of the step being transitioned from
/// * `previous` - the particles after resampling at `step`
/// * `histories` - the history windows ending at `step`
/// * `particle_shape` - `batch_shape + [num_particles]`
/// * `rng` - the random stream for this step
///
/// # Returns
/// The new particles and `log transition(x) - log proposal(x)`, zero without a proposal.
pub fn propose(
    model: &StateSpaceModel,
    step: usize,
    previous: &State,
    histories: &HistoryArgs<'_>,
    particle_shape: &[usize],
    rng: &mut StdRng,
) -> Result<Proposal> {
    let transition = model.transition_fn.call(step, previous, histories)?;
    let (particles, log_weight_correction) = match &model.proposal_fn {
        Some(proposal_fn) => {
            let proposal = proposal_fn.call(step, previous, histories)?;
            let particles = proposal.sample(rng)?;
            let ratio = correction(
                transition.as_ref(),
                proposal.as_ref(),
                &particles,
                particle_shape,
            )?;
            (particles, ratio)
        }
        None => (
            transition.sample(rng)?,
            ArrayD::zeros(IxDyn(particle_shape)),
        ),
    };
    particles.check_leading_shape(particle_shape, "proposed particles")?;
    Ok(Proposal {
        particles,
        log_weight_correction,
    })
}
