//! Tracing particle ancestry backward into full trajectories.
use ndarray::{ArrayD, Axis};

use crate::error::{FilterError, Result};
use crate::state::{State, gather_along_axis, identity_indices};

/// Follow ancestor indices backward from the final step.
///
/// `particles` leaves are shaped `[T] + batch + [N] + event` and `ancestor_indices` is
/// `[T] + batch + [N]`, where `ancestor_indices[t]` names the step `t - 1` parent of every step
/// `t` particle. The result has the shape of `particles`; entry `[t, .., i]` is the step `t`
/// ancestor of final particle `i`. The inputs are left untouched.
///
/// # Example
/// ```rust
/// use ndarray::{array, ArrayD};
/// use smc::state::State;
/// use smc::trajectory::reconstruct_trajectories;
///
/// let particles = State::Array(array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]].into_dyn());
/// let parents: ArrayD<usize> = array![[0, 1, 2], [0, 2, 1], [0, 2, 2]].into_dyn();
/// let trajectories = reconstruct_trajectories(&particles, &parents).unwrap();
/// assert_eq!(
///     trajectories.array().unwrap(),
///     &array![[1.0, 2.0, 2.0], [4.0, 6.0, 6.0], [7.0, 8.0, 9.0]].into_dyn()
/// );
/// ```
pub fn reconstruct_trajectories(particles: &State, ancestor_indices: &ArrayD<usize>) -> Result<State> {
    let shape = ancestor_indices.shape();
    if shape.len() < 2 {
        return Err(FilterError::ShapeMismatch(format!(
            "ancestor indices of shape {shape:?} need a time axis and a particle axis"
        )));
    }
    let num_timesteps = shape[0];
    if num_timesteps == 0 {
        return Err(FilterError::EmptyObservations);
    }
    particles.check_leading_shape(shape, "particles")?;
    let particle_axis = shape.len() - 2;

    // lineage[.., i] is the index at step t of the ancestor of final particle i.
    let mut lineage = identity_indices(&shape[1..]);
    let mut steps = Vec::with_capacity(num_timesteps);
    for t in (0..num_timesteps).rev() {
        steps.push(particles.index_axis(0, t)?.gather(particle_axis, &lineage)?);
        if t > 0 {
            let parents = ancestor_indices.index_axis(Axis(0), t);
            lineage = gather_along_axis(&parents, particle_axis, &lineage)?;
        }
    }
    steps.reverse();
    State::stack(&steps, 0)
}
