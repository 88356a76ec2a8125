//! State-space models as seen by the filter.
//!
//! A model is a prior over the initial state plus three kinds of callbacks: the transition, the
//! observation model and (optionally) a proposal. Each callback is wrapped in a [`ModelFn`] that
//! declares up front which history windows it reads, so the filter can reject a callback that
//! needs a window nobody is keeping before the first particle is drawn.
use crate::distributions::BoxedDistribution;
use crate::error::{FilterError, Result};
use crate::state::State;

/// History windows available to a callback at one step.
///
/// Each window stacks up to `k` past entries along a new leading axis, oldest first. `None`
/// means no history has been recorded yet (always the case at step 0) or the callback did not
/// ask for that window.
#[derive(Clone, Copy, Debug, Default)]
pub struct HistoryArgs<'a> {
    pub state_history: Option<&'a State>,
    pub observation_history: Option<&'a State>,
}

type Callback = dyn Fn(usize, &State, &HistoryArgs<'_>) -> Result<BoxedDistribution>;

/// A model callback together with the history arguments it consumes.
///
/// ```rust
/// use smc::distributions::{Distribution, Normal};
/// use smc::model::ModelFn;
///
/// let transition = ModelFn::new(|_step, state| {
///     Ok(Normal::new(state.array()?.clone(), 1.0)?.boxed())
/// });
/// assert!(!transition.consumes_state_history());
/// ```
pub struct ModelFn {
    call: Box<Callback>,
    state_history: bool,
    observation_history: bool,
}

impl ModelFn {
    /// A callback of `(step, state)` only.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(usize, &State) -> Result<BoxedDistribution> + 'static,
    {
        ModelFn {
            call: Box::new(move |step: usize, state: &State, _: &HistoryArgs<'_>| f(step, state)),
            state_history: false,
            observation_history: false,
        }
    }

    /// A callback of `(step, state, state_history)`.
    pub fn with_state_history<F>(f: F) -> Self
    where
        F: Fn(usize, &State, Option<&State>) -> Result<BoxedDistribution> + 'static,
    {
        ModelFn {
            call: Box::new(move |step: usize, state: &State, h: &HistoryArgs<'_>| {
                f(step, state, h.state_history)
            }),
            state_history: true,
            observation_history: false,
        }
    }

    /// A callback of `(step, state, observation_history)`.
    pub fn with_observation_history<F>(f: F) -> Self
    where
        F: Fn(usize, &State, Option<&State>) -> Result<BoxedDistribution> + 'static,
    {
        ModelFn {
            call: Box::new(move |step: usize, state: &State, h: &HistoryArgs<'_>| {
                f(step, state, h.observation_history)
            }),
            state_history: false,
            observation_history: true,
        }
    }

    /// A callback reading both windows.
    pub fn with_histories<F>(f: F) -> Self
    where
        F: Fn(usize, &State, &HistoryArgs<'_>) -> Result<BoxedDistribution> + 'static,
    {
        ModelFn {
            call: Box::new(f),
            state_history: true,
            observation_history: true,
        }
    }

    pub fn consumes_state_history(&self) -> bool {
        self.state_history
    }

    pub fn consumes_observation_history(&self) -> bool {
        self.observation_history
    }

    /// Invoke the callback, passing only the windows it declared.
    pub fn call(&self, step: usize, state: &State, histories: &HistoryArgs<'_>) -> Result<BoxedDistribution> {
        let visible = HistoryArgs {
            state_history: histories.state_history.filter(|_| self.state_history),
            observation_history: histories
                .observation_history
                .filter(|_| self.observation_history),
        };
        (self.call)(step, state, &visible)
    }

    /// Fail when the callback reads a window configured with zero length.
    pub fn check_arity(
        &self,
        callback: &'static str,
        state_window: usize,
        observation_window: usize,
    ) -> Result<()> {
        if self.state_history && state_window == 0 {
            return Err(FilterError::CallbackArity {
                callback,
                history: "state",
            });
        }
        if self.observation_history && observation_window == 0 {
            return Err(FilterError::CallbackArity {
                callback,
                history: "observation",
            });
        }
        Ok(())
    }
}

/// Prior, dynamics, observation model and optional proposals of one filtering problem.
pub struct StateSpaceModel {
    pub(crate) initial_state_prior: BoxedDistribution,
    pub(crate) transition_fn: ModelFn,
    pub(crate) observation_fn: ModelFn,
    pub(crate) initial_state_proposal: Option<BoxedDistribution>,
    pub(crate) proposal_fn: Option<ModelFn>,
}

impl StateSpaceModel {
    pub fn new(
        initial_state_prior: BoxedDistribution,
        transition_fn: ModelFn,
        observation_fn: ModelFn,
    ) -> Self {
        StateSpaceModel {
            initial_state_prior,
            transition_fn,
            observation_fn,
            initial_state_proposal: None,
            proposal_fn: None,
        }
    }

    /// Draw the initial particles from `proposal` and reweight them against the prior.
    pub fn with_initial_state_proposal(mut self, proposal: BoxedDistribution) -> Self {
        self.initial_state_proposal = Some(proposal);
        self
    }

    /// Draw every later step from `proposal_fn` and reweight against the transition.
    pub fn with_proposal_fn(mut self, proposal_fn: ModelFn) -> Self {
        self.proposal_fn = Some(proposal_fn);
        self
    }

    pub fn initial_state_prior(&self) -> &BoxedDistribution {
        &self.initial_state_prior
    }

    pub fn has_proposal(&self) -> bool {
        self.proposal_fn.is_some() || self.initial_state_proposal.is_some()
    }

    /// Check every callback against the configured history windows.
    pub fn check_arity(&self, state_window: usize, observation_window: usize) -> Result<()> {
        self.transition_fn
            .check_arity("transition_fn", state_window, observation_window)?;
        self.observation_fn
            .check_arity("observation_fn", state_window, observation_window)?;
        if let Some(proposal_fn) = &self.proposal_fn {
            proposal_fn.check_arity("proposal_fn", state_window, observation_window)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Deterministic, Distribution};

    fn echo_history() -> ModelFn {
        ModelFn::with_state_history(|_, state, history| {
            let value = match history {
                Some(h) => h.array()?.sum(),
                None => -1.0,
            };
            Ok(Deterministic::new(state.array()?.mapv(|_| value)).boxed())
        })
    }

    #[test]
    fn test_arity_check_names_the_callback() {
        let err = echo_history().check_arity("transition_fn", 0, 0).unwrap_err();
        assert!(matches!(
            err,
            FilterError::CallbackArity {
                callback: "transition_fn",
                history: "state"
            }
        ));
        assert!(err.to_string().contains("num_steps_state_history_to_pass"));
        assert!(echo_history().check_arity("transition_fn", 2, 0).is_ok());
    }

    #[test]
    fn test_only_declared_history_is_passed() {
        let history = State::from_vec(vec![1.0, 2.0]);
        let observations = State::from_vec(vec![5.0]);
        let args = HistoryArgs {
            state_history: Some(&history),
            observation_history: Some(&observations),
        };
        let state = State::scalar(0.0);
        let mut rng = crate::seed::Seed::new(0).rng();

        let seen = echo_history().call(0, &state, &args).unwrap();
        assert_eq!(seen.sample(&mut rng).unwrap(), State::scalar(3.0));

        let observation_only = ModelFn::with_observation_history(|_, _, history| {
            assert!(history.is_some());
            Ok(Deterministic::new(0.0).boxed())
        });
        assert!(observation_only.call(0, &state, &args).is_ok());

        let sentinel = echo_history()
            .call(0, &state, &HistoryArgs::default())
            .unwrap();
        assert_eq!(sentinel.sample(&mut rng).unwrap(), State::scalar(-1.0));
    }
}
