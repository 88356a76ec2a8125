//! Linear-Gaussian state-space models and their exact Kalman filter.
//!
//! The model is
//!
//! $$
//! \begin{aligned}
//! x_0 &\sim N(\mu_0, P_0) \\\\
//! x_{t+1} &= F x_t + b + w_t, \quad w_t \sim N(0, Q) \\\\
//! y_t &= H x_t + c + v_t, \quad v_t \sim N(0, R)
//! \end{aligned}
//! $$
//!
//! [`LinearGaussianStateSpaceModel::forward_filter`] gives the exact per-step log marginal
//! likelihoods and filtered moments, which makes the model the reference against which the
//! particle filter's estimates are checked. The same model is available as particle filter
//! callbacks through [`LinearGaussianStateSpaceModel::to_state_space_model`].
use nalgebra::{DMatrix, DVector};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::distributions::{Distribution, MultivariateNormalTriL};
use crate::error::{FilterError, Result};
use crate::linalg::{cholesky_factor, gaussian_log_density, matvec_last_axis, robust_spd_solve, symmetrize};
use crate::model::{ModelFn, StateSpaceModel};
use crate::seed::Seed;
use crate::state::add;

#[derive(Clone, Debug)]
pub struct LinearGaussianStateSpaceModel {
    pub initial_mean: DVector<f64>,
    pub initial_covariance: DMatrix<f64>,
    pub transition_matrix: DMatrix<f64>,
    pub transition_offset: DVector<f64>,
    pub transition_covariance: DMatrix<f64>,
    pub observation_matrix: DMatrix<f64>,
    pub observation_offset: DVector<f64>,
    pub observation_covariance: DMatrix<f64>,
}

/// Output of [`LinearGaussianStateSpaceModel::forward_filter`], one entry per timestep.
#[derive(Clone, Debug)]
pub struct KalmanFilterOutput {
    /// `log p(y_t | y_{0..t-1})`
    pub log_likelihoods: Vec<f64>,
    pub filtered_means: Vec<DVector<f64>>,
    pub filtered_covariances: Vec<DMatrix<f64>>,
    pub predicted_means: Vec<DVector<f64>>,
    pub predicted_covariances: Vec<DMatrix<f64>>,
}

fn dimension_error(what: &str, expected: (usize, usize), found: (usize, usize)) -> FilterError {
    FilterError::ShapeMismatch(format!(
        "{what} should be {}x{}, found {}x{}",
        expected.0, expected.1, found.0, found.1
    ))
}

fn standard_normal(dim: usize, rng: &mut impl Rng) -> DVector<f64> {
    DVector::from_fn(dim, |_, _| rng.sample(StandardNormal))
}

fn to_array(v: &DVector<f64>) -> ArrayD<f64> {
    ndarray::Array1::from_iter(v.iter().copied()).into_dyn()
}

impl LinearGaussianStateSpaceModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initial_mean: DVector<f64>,
        initial_covariance: DMatrix<f64>,
        transition_matrix: DMatrix<f64>,
        transition_offset: DVector<f64>,
        transition_covariance: DMatrix<f64>,
        observation_matrix: DMatrix<f64>,
        observation_offset: DVector<f64>,
        observation_covariance: DMatrix<f64>,
    ) -> Result<Self> {
        let n = initial_mean.len();
        let m = observation_matrix.nrows();
        let checks = [
            ("initial_covariance", (n, n), initial_covariance.shape()),
            ("transition_matrix", (n, n), transition_matrix.shape()),
            ("transition_offset", (n, 1), transition_offset.shape()),
            ("transition_covariance", (n, n), transition_covariance.shape()),
            ("observation_matrix", (m, n), observation_matrix.shape()),
            ("observation_offset", (m, 1), observation_offset.shape()),
            ("observation_covariance", (m, m), observation_covariance.shape()),
        ];
        for (what, expected, found) in checks {
            if expected != found {
                return Err(dimension_error(what, expected, found));
            }
        }
        Ok(LinearGaussianStateSpaceModel {
            initial_mean,
            initial_covariance,
            transition_matrix,
            transition_offset,
            transition_covariance,
            observation_matrix,
            observation_offset,
            observation_covariance,
        })
    }

    pub fn state_size(&self) -> usize {
        self.initial_mean.len()
    }

    pub fn observation_size(&self) -> usize {
        self.observation_matrix.nrows()
    }

    /// Simulate `num_timesteps` latent states (`[T, n]`) and observations (`[T, m]`).
    pub fn sample(&self, num_timesteps: usize, seed: Seed) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let mut rng = seed.rng();
        let l0 = cholesky_factor(&self.initial_covariance)?;
        let lq = cholesky_factor(&self.transition_covariance)?;
        let lr = cholesky_factor(&self.observation_covariance)?;
        let (n, m) = (self.state_size(), self.observation_size());

        let mut states = Vec::with_capacity(num_timesteps * n);
        let mut observations = Vec::with_capacity(num_timesteps * m);
        let mut x = &self.initial_mean + &l0 * standard_normal(n, &mut rng);
        for t in 0..num_timesteps {
            if t > 0 {
                x = &self.transition_matrix * &x
                    + &self.transition_offset
                    + &lq * standard_normal(n, &mut rng);
            }
            let y = &self.observation_matrix * &x
                + &self.observation_offset
                + &lr * standard_normal(m, &mut rng);
            states.extend(x.iter());
            observations.extend(y.iter());
        }
        Ok((
            ArrayD::from_shape_vec(IxDyn(&[num_timesteps, n]), states)?,
            ArrayD::from_shape_vec(IxDyn(&[num_timesteps, m]), observations)?,
        ))
    }

    /// Exact Kalman filter over observations shaped `[T, m]`.
    ///
    /// The update uses the Joseph form
    ///
    /// $$
    /// P^+ = (I - K H) P^- (I - K H)^T + K R K^T
    /// $$
    ///
    /// so the filtered covariance stays symmetric positive semi-definite.
    pub fn forward_filter(&self, observations: &ArrayD<f64>) -> Result<KalmanFilterOutput> {
        let m = self.observation_size();
        if observations.ndim() != 2 || observations.shape()[1] != m {
            return Err(FilterError::ShapeMismatch(format!(
                "observations of shape {:?} do not match [num_timesteps, {m}]",
                observations.shape()
            )));
        }
        let num_timesteps = observations.shape()[0];
        let h = &self.observation_matrix;
        let identity = DMatrix::<f64>::identity(self.state_size(), self.state_size());

        let mut output = KalmanFilterOutput {
            log_likelihoods: Vec::with_capacity(num_timesteps),
            filtered_means: Vec::with_capacity(num_timesteps),
            filtered_covariances: Vec::with_capacity(num_timesteps),
            predicted_means: Vec::with_capacity(num_timesteps),
            predicted_covariances: Vec::with_capacity(num_timesteps),
        };
        let mut mean = self.initial_mean.clone();
        let mut covariance = self.initial_covariance.clone();
        for row in observations.outer_iter() {
            let y = DVector::from_iterator(m, row.iter().copied());
            let innovation_covariance =
                symmetrize(&(h * &covariance * h.transpose() + &self.observation_covariance));
            let predicted_observation = h * &mean + &self.observation_offset;
            output.log_likelihoods.push(gaussian_log_density(
                &y,
                &predicted_observation,
                &innovation_covariance,
            )?);

            // K = P Hᵀ S⁻¹ = (S⁻¹ H P)ᵀ for symmetric P and S
            let gain = robust_spd_solve(&innovation_covariance, &(h * &covariance))?.transpose();
            let filtered_mean = &mean + &gain * (&y - &predicted_observation);
            let i_kh = &identity - &gain * h;
            let filtered_covariance = symmetrize(
                &(&i_kh * &covariance * i_kh.transpose()
                    + &gain * &self.observation_covariance * gain.transpose()),
            );

            output.predicted_means.push(mean);
            output.predicted_covariances.push(covariance);
            mean = &self.transition_matrix * &filtered_mean + &self.transition_offset;
            covariance = symmetrize(
                &(&self.transition_matrix * &filtered_covariance * self.transition_matrix.transpose()
                    + &self.transition_covariance),
            );
            output.filtered_means.push(filtered_mean);
            output.filtered_covariances.push(filtered_covariance);
        }
        Ok(output)
    }

    /// The same model as particle filter callbacks over `[.., n]`-shaped particle arrays.
    pub fn to_state_space_model(&self) -> Result<StateSpaceModel> {
        let prior = MultivariateNormalTriL::new(
            to_array(&self.initial_mean),
            cholesky_factor(&self.initial_covariance)?,
        )?;

        let transition_matrix = self.transition_matrix.clone();
        let transition_offset = to_array(&self.transition_offset);
        let transition_scale = cholesky_factor(&self.transition_covariance)?;
        let transition_fn = ModelFn::new(move |_, state| {
            let loc = add(&matvec_last_axis(&transition_matrix, state.array()?)?, &transition_offset)?;
            Ok(MultivariateNormalTriL::new(loc, transition_scale.clone())?.boxed())
        });

        let observation_matrix = self.observation_matrix.clone();
        let observation_offset = to_array(&self.observation_offset);
        let observation_scale = cholesky_factor(&self.observation_covariance)?;
        let observation_fn = ModelFn::new(move |_, state| {
            let loc = add(&matvec_last_axis(&observation_matrix, state.array()?)?, &observation_offset)?;
            Ok(MultivariateNormalTriL::new(loc, observation_scale.clone())?.boxed())
        });

        Ok(StateSpaceModel::new(prior.boxed(), transition_fn, observation_fn))
    }
}
