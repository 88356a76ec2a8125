//! Probability distributions consumed by the filter.
//!
//! The filter only ever needs two capabilities from a distribution: draw values and score
//! values. [`Distribution`] captures exactly that, over [`State`] values, so that priors,
//! transitions, proposals and observation models can be any family a caller cares to write.
//! The families shipped here cover the reference models of this crate:
//!
//! - scalar-event families evaluated elementwise over broadcast parameter arrays:
//!   [`Normal`], [`Uniform`], [`Deterministic`], [`Poisson`], [`Bernoulli`]
//! - [`Shifted`], a base distribution translated by a fixed array
//! - [`MultivariateNormalTriL`], a vector-event Gaussian with a lower-triangular scale
//! - [`JointDistribution`], named components drawn in order, where a component may be built
//!   from the components drawn before it
//!
//! Shapes follow the particle layout of the rest of the crate: a distribution has a
//! `batch_shape` (the shape of its broadcast parameters, minus any event axes), `sample` returns
//! `batch_shape + event_shape`, and `sample_n(n)` returns `batch_shape + [n] + event_shape`.
use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, ArrayD, IxDyn};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution as _, Poisson as PoissonSampler, StandardNormal};
use statrs::function::gamma::ln_gamma;

use crate::error::{FilterError, Result};
use crate::state::{State, add, broadcast_shape, broadcast_to, sub};

/// ln(2π) / 2
const HALF_LN_TWO_PI: f64 = 0.918_938_533_204_672_7;

/// Sampling and scoring capability over [`State`] values.
pub trait Distribution {
    /// Shape of the independent batch of distributions, excluding event axes.
    fn batch_shape(&self) -> Vec<usize>;

    /// Draw one value of shape `batch_shape + event_shape`.
    fn sample(&self, rng: &mut StdRng) -> Result<State>;

    /// Draw `n` values, placing the sample axis directly after the batch axes.
    fn sample_n(&self, n: usize, rng: &mut StdRng) -> Result<State> {
        let draws = (0..n)
            .map(|_| self.sample(rng))
            .collect::<Result<Vec<_>>>()?;
        State::stack(&draws, self.batch_shape().len())
    }

    /// Log-density (or log-mass) of `value`, one entry per batch element after broadcasting
    /// `value` against the parameters.
    fn log_prob(&self, value: &State) -> Result<ArrayD<f64>>;

    fn boxed(self) -> BoxedDistribution
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
}

pub type BoxedDistribution = Box<dyn Distribution>;

/// Conversion of scalars, vectors and arrays into distribution parameters.
pub trait IntoParam {
    fn into_param(self) -> ArrayD<f64>;
}

impl IntoParam for f64 {
    fn into_param(self) -> ArrayD<f64> {
        ndarray::arr0(self).into_dyn()
    }
}

impl IntoParam for ArrayD<f64> {
    fn into_param(self) -> ArrayD<f64> {
        self
    }
}

impl IntoParam for &ArrayD<f64> {
    fn into_param(self) -> ArrayD<f64> {
        self.clone()
    }
}

impl IntoParam for Vec<f64> {
    fn into_param(self) -> ArrayD<f64> {
        Array1::from(self).into_dyn()
    }
}

fn check_param(param: &ArrayD<f64>, what: &str, valid: impl Fn(f64) -> bool) -> Result<()> {
    match param.iter().find(|&&x| !valid(x)) {
        Some(bad) => Err(FilterError::InvalidParameter(format!("{what} = {bad}"))),
        None => Ok(()),
    }
}

fn broadcast_pair(a: ArrayD<f64>, b: ArrayD<f64>) -> Result<(Vec<usize>, ArrayD<f64>, ArrayD<f64>)> {
    let shape = broadcast_shape(a.shape(), b.shape())?;
    let a = broadcast_to(&a, &shape)?;
    let b = broadcast_to(&b, &shape)?;
    Ok((shape, a, b))
}

/// Draw elementwise from parameters already broadcast to `shape`. With `n`, every batch element
/// is drawn `n` times and the draws are laid out on a trailing sample axis.
fn sample_elementwise(
    shape: &[usize],
    params: &[&ArrayD<f64>],
    n: Option<usize>,
    rng: &mut StdRng,
    mut draw: impl FnMut(&[f64], &mut StdRng) -> f64,
) -> Result<ArrayD<f64>> {
    let repeat = n.unwrap_or(1);
    let mut out_shape = shape.to_vec();
    if let Some(n) = n {
        out_shape.push(n);
    }
    let flat: Vec<Vec<f64>> = params.iter().map(|p| p.iter().copied().collect()).collect();
    let size: usize = shape.iter().product();
    let mut args = vec![0.0; params.len()];
    let mut values = Vec::with_capacity(size * repeat);
    for i in 0..size {
        for (arg, param) in args.iter_mut().zip(&flat) {
            *arg = param[i];
        }
        for _ in 0..repeat {
            values.push(draw(&args, rng));
        }
    }
    Ok(ArrayD::from_shape_vec(IxDyn(&out_shape), values)?)
}

/// Score `value` elementwise against parameters, broadcasting all of them together.
fn log_prob_elementwise(
    value: &ArrayD<f64>,
    params: &[&ArrayD<f64>],
    score: impl Fn(f64, &[f64]) -> f64,
) -> Result<ArrayD<f64>> {
    let mut shape = value.shape().to_vec();
    for param in params {
        shape = broadcast_shape(&shape, param.shape())?;
    }
    let value: Vec<f64> = broadcast_to(value, &shape)?.iter().copied().collect();
    let flat = params
        .iter()
        .map(|p| Ok(broadcast_to(*p, &shape)?.iter().copied().collect::<Vec<f64>>()))
        .collect::<Result<Vec<_>>>()?;
    let mut args = vec![0.0; params.len()];
    let mut scores = Vec::with_capacity(value.len());
    for (i, &x) in value.iter().enumerate() {
        for (arg, param) in args.iter_mut().zip(&flat) {
            *arg = param[i];
        }
        scores.push(score(x, &args));
    }
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), scores)?)
}

/// Univariate Gaussian.
#[derive(Clone, Debug)]
pub struct Normal {
    shape: Vec<usize>,
    loc: ArrayD<f64>,
    scale: ArrayD<f64>,
}

impl Normal {
    /// # Example
    /// ```rust
    /// use smc::distributions::{Distribution, Normal};
    /// use smc::state::State;
    ///
    /// let normal = Normal::new(0.0, 1.0).unwrap();
    /// let lp = normal.log_prob(&State::scalar(0.0)).unwrap();
    /// assert!((lp[[]] + 0.918_938_533).abs() < 1e-6);
    /// ```
    pub fn new(loc: impl IntoParam, scale: impl IntoParam) -> Result<Self> {
        let (shape, loc, scale) = broadcast_pair(loc.into_param(), scale.into_param())?;
        check_param(&loc, "normal loc", f64::is_finite)?;
        check_param(&scale, "normal scale", |s| s > 0.0 && s.is_finite())?;
        Ok(Normal { shape, loc, scale })
    }

    pub fn loc(&self) -> &ArrayD<f64> {
        &self.loc
    }

    pub fn scale(&self) -> &ArrayD<f64> {
        &self.scale
    }

    fn draw(&self, n: Option<usize>, rng: &mut StdRng) -> Result<State> {
        sample_elementwise(&self.shape, &[&self.loc, &self.scale], n, rng, |p, rng| {
            let z: f64 = rng.sample(StandardNormal);
            p[0] + p[1] * z
        })
        .map(State::Array)
    }
}

impl Distribution for Normal {
    fn batch_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn sample(&self, rng: &mut StdRng) -> Result<State> {
        self.draw(None, rng)
    }

    fn sample_n(&self, n: usize, rng: &mut StdRng) -> Result<State> {
        self.draw(Some(n), rng)
    }

    fn log_prob(&self, value: &State) -> Result<ArrayD<f64>> {
        log_prob_elementwise(value.array()?, &[&self.loc, &self.scale], |x, p| {
            let z = (x - p[0]) / p[1];
            -0.5 * z * z - p[1].ln() - HALF_LN_TWO_PI
        })
    }
}

/// Continuous uniform on `[low, high)`.
#[derive(Clone, Debug)]
pub struct Uniform {
    shape: Vec<usize>,
    low: ArrayD<f64>,
    high: ArrayD<f64>,
}

impl Uniform {
    pub fn new(low: impl IntoParam, high: impl IntoParam) -> Result<Self> {
        let (shape, low, high) = broadcast_pair(low.into_param(), high.into_param())?;
        for (l, h) in low.iter().zip(high.iter()) {
            if !(l.is_finite() && h.is_finite() && l < h) {
                return Err(FilterError::InvalidParameter(format!(
                    "uniform bounds [{l}, {h}) are empty or not finite"
                )));
            }
        }
        Ok(Uniform { shape, low, high })
    }

    fn draw(&self, n: Option<usize>, rng: &mut StdRng) -> Result<State> {
        sample_elementwise(&self.shape, &[&self.low, &self.high], n, rng, |p, rng| {
            p[0] + (p[1] - p[0]) * rng.random::<f64>()
        })
        .map(State::Array)
    }
}

impl Distribution for Uniform {
    fn batch_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn sample(&self, rng: &mut StdRng) -> Result<State> {
        self.draw(None, rng)
    }

    fn sample_n(&self, n: usize, rng: &mut StdRng) -> Result<State> {
        self.draw(Some(n), rng)
    }

    fn log_prob(&self, value: &State) -> Result<ArrayD<f64>> {
        log_prob_elementwise(value.array()?, &[&self.low, &self.high], |x, p| {
            if x >= p[0] && x < p[1] {
                -(p[1] - p[0]).ln()
            } else {
                f64::NEG_INFINITY
            }
        })
    }
}

/// Point mass at `loc`.
#[derive(Clone, Debug)]
pub struct Deterministic {
    loc: ArrayD<f64>,
}

impl Deterministic {
    pub fn new(loc: impl IntoParam) -> Self {
        Deterministic {
            loc: loc.into_param(),
        }
    }
}

impl Distribution for Deterministic {
    fn batch_shape(&self) -> Vec<usize> {
        self.loc.shape().to_vec()
    }

    fn sample(&self, _rng: &mut StdRng) -> Result<State> {
        Ok(State::Array(self.loc.clone()))
    }

    fn sample_n(&self, n: usize, rng: &mut StdRng) -> Result<State> {
        sample_elementwise(self.loc.shape(), &[&self.loc], Some(n), rng, |p, _| p[0])
            .map(State::Array)
    }

    fn log_prob(&self, value: &State) -> Result<ArrayD<f64>> {
        log_prob_elementwise(value.array()?, &[&self.loc], |x, p| {
            if x == p[0] { 0.0 } else { f64::NEG_INFINITY }
        })
    }
}

/// Poisson counts with non-negative `rate`. A zero rate is a point mass at zero.
#[derive(Clone, Debug)]
pub struct Poisson {
    rate: ArrayD<f64>,
}

impl Poisson {
    pub fn new(rate: impl IntoParam) -> Result<Self> {
        let rate = rate.into_param();
        check_param(&rate, "poisson rate", |r| r >= 0.0 && r.is_finite())?;
        Ok(Poisson { rate })
    }

    fn draw(&self, n: Option<usize>, rng: &mut StdRng) -> Result<State> {
        sample_elementwise(self.rate.shape(), &[&self.rate], n, rng, |p, rng| {
            if p[0] == 0.0 {
                return 0.0;
            }
            match PoissonSampler::new(p[0]) {
                Ok(sampler) => sampler.sample(rng),
                Err(_) => f64::NAN,
            }
        })
        .map(State::Array)
    }
}

impl Distribution for Poisson {
    fn batch_shape(&self) -> Vec<usize> {
        self.rate.shape().to_vec()
    }

    fn sample(&self, rng: &mut StdRng) -> Result<State> {
        self.draw(None, rng)
    }

    fn sample_n(&self, n: usize, rng: &mut StdRng) -> Result<State> {
        self.draw(Some(n), rng)
    }

    fn log_prob(&self, value: &State) -> Result<ArrayD<f64>> {
        log_prob_elementwise(value.array()?, &[&self.rate], |k, p| {
            let rate = p[0];
            if k < 0.0 || k.fract() != 0.0 {
                f64::NEG_INFINITY
            } else if rate == 0.0 {
                if k == 0.0 { 0.0 } else { f64::NEG_INFINITY }
            } else {
                k * rate.ln() - rate - ln_gamma(k + 1.0)
            }
        })
    }
}

/// Bernoulli trials valued in `{0, 1}`.
#[derive(Clone, Debug)]
pub struct Bernoulli {
    probs: ArrayD<f64>,
}

impl Bernoulli {
    pub fn new(probs: impl IntoParam) -> Result<Self> {
        let probs = probs.into_param();
        check_param(&probs, "bernoulli probability", |p| (0.0..=1.0).contains(&p))?;
        Ok(Bernoulli { probs })
    }

    fn draw(&self, n: Option<usize>, rng: &mut StdRng) -> Result<State> {
        sample_elementwise(self.probs.shape(), &[&self.probs], n, rng, |p, rng| {
            if rng.random::<f64>() < p[0] { 1.0 } else { 0.0 }
        })
        .map(State::Array)
    }
}

impl Distribution for Bernoulli {
    fn batch_shape(&self) -> Vec<usize> {
        self.probs.shape().to_vec()
    }

    fn sample(&self, rng: &mut StdRng) -> Result<State> {
        self.draw(None, rng)
    }

    fn sample_n(&self, n: usize, rng: &mut StdRng) -> Result<State> {
        self.draw(Some(n), rng)
    }

    fn log_prob(&self, value: &State) -> Result<ArrayD<f64>> {
        log_prob_elementwise(value.array()?, &[&self.probs], |x, p| {
            if x == 1.0 {
                p[0].ln()
            } else if x == 0.0 {
                (1.0 - p[0]).ln()
            } else {
                f64::NEG_INFINITY
            }
        })
    }
}

/// A base distribution translated by a fixed array: `value = base_draw + shift`.
pub struct Shifted {
    base: BoxedDistribution,
    shift: ArrayD<f64>,
    shape: Vec<usize>,
}

impl Shifted {
    pub fn new(base: impl Distribution + 'static, shift: impl IntoParam) -> Result<Self> {
        let shift = shift.into_param();
        let shape = broadcast_shape(&base.batch_shape(), shift.shape())?;
        Ok(Shifted {
            base: Box::new(base),
            shift,
            shape,
        })
    }
}

impl Distribution for Shifted {
    fn batch_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn sample(&self, rng: &mut StdRng) -> Result<State> {
        self.base
            .sample(rng)?
            .try_map_arrays(|draw| add(draw, &self.shift))
    }

    fn log_prob(&self, value: &State) -> Result<ArrayD<f64>> {
        let unshifted = value.try_map_arrays(|v| sub(v, &self.shift))?;
        self.base.log_prob(&unshifted)
    }
}

/// Multivariate Gaussian `loc + L z`, `z ~ N(0, I)`, with one lower-triangular scale `L` shared
/// by every batch element. The last axis of `loc` is the event axis.
#[derive(Clone, Debug)]
pub struct MultivariateNormalTriL {
    loc: ArrayD<f64>,
    scale_tril: DMatrix<f64>,
    log_det_scale: f64,
}

impl MultivariateNormalTriL {
    pub fn new(loc: impl IntoParam, scale_tril: DMatrix<f64>) -> Result<Self> {
        let loc = loc.into_param();
        let dim = match loc.shape().last() {
            Some(&d) => d,
            None => {
                return Err(FilterError::InvalidParameter(
                    "multivariate normal loc needs an event axis".to_string(),
                ));
            }
        };
        if scale_tril.nrows() != dim || scale_tril.ncols() != dim {
            return Err(FilterError::ShapeMismatch(format!(
                "scale_tril is {}x{} but the event size is {dim}",
                scale_tril.nrows(),
                scale_tril.ncols()
            )));
        }
        let scale_tril = scale_tril.lower_triangle();
        let diagonal = scale_tril.diagonal();
        if diagonal.iter().any(|d| *d == 0.0 || !d.is_finite()) {
            return Err(FilterError::InvalidParameter(
                "scale_tril must have a non-zero, finite diagonal".to_string(),
            ));
        }
        let log_det_scale = diagonal.iter().map(|d| d.abs().ln()).sum();
        Ok(MultivariateNormalTriL {
            loc,
            scale_tril,
            log_det_scale,
        })
    }

    pub fn event_size(&self) -> usize {
        self.scale_tril.nrows()
    }

    pub fn covariance(&self) -> DMatrix<f64> {
        &self.scale_tril * self.scale_tril.transpose()
    }

    fn draw(&self, n: Option<usize>, rng: &mut StdRng) -> Result<State> {
        let dim = self.event_size();
        let repeat = n.unwrap_or(1);
        let batch = self.batch_shape();
        let loc: Vec<f64> = self.loc.iter().copied().collect();
        let mut values = Vec::with_capacity(loc.len() * repeat);
        for mean in loc.chunks(dim) {
            for _ in 0..repeat {
                let z = DVector::from_fn(dim, |_, _| rng.sample::<f64, _>(StandardNormal));
                let x = DVector::from_column_slice(mean) + &self.scale_tril * z;
                values.extend(x.iter());
            }
        }
        let mut shape = batch;
        if let Some(n) = n {
            shape.push(n);
        }
        shape.push(dim);
        Ok(State::Array(ArrayD::from_shape_vec(IxDyn(&shape), values)?))
    }
}

impl Distribution for MultivariateNormalTriL {
    fn batch_shape(&self) -> Vec<usize> {
        let shape = self.loc.shape();
        shape[..shape.len() - 1].to_vec()
    }

    fn sample(&self, rng: &mut StdRng) -> Result<State> {
        self.draw(None, rng)
    }

    fn sample_n(&self, n: usize, rng: &mut StdRng) -> Result<State> {
        self.draw(Some(n), rng)
    }

    fn log_prob(&self, value: &State) -> Result<ArrayD<f64>> {
        let dim = self.event_size();
        let value = value.array()?;
        if value.shape().last() != Some(&dim) {
            return Err(FilterError::ShapeMismatch(format!(
                "value of shape {:?} does not end in the event size {dim}",
                value.shape()
            )));
        }
        let diff = sub(value, &self.loc)?;
        let out_shape = diff.shape()[..diff.ndim() - 1].to_vec();
        let flat: Vec<f64> = diff.iter().copied().collect();
        let mut scores = Vec::with_capacity(flat.len() / dim);
        for row in flat.chunks(dim) {
            let whitened = self
                .scale_tril
                .solve_lower_triangular(&DVector::from_column_slice(row))
                .ok_or_else(|| {
                    FilterError::InvalidParameter("scale_tril is singular".to_string())
                })?;
            scores.push(
                -0.5 * whitened.norm_squared()
                    - self.log_det_scale
                    - dim as f64 * HALF_LN_TWO_PI,
            );
        }
        Ok(ArrayD::from_shape_vec(IxDyn(&out_shape), scores)?)
    }
}

type DependentFn = dyn Fn(&BTreeMap<String, State>) -> Result<BoxedDistribution>;

enum Component {
    Independent(BoxedDistribution),
    Dependent(Box<DependentFn>),
}

/// Named components drawn in insertion order; values are [`State::Map`]s.
///
/// A dependent component is rebuilt from the values of the components before it, both when
/// sampling and when scoring.
///
/// ```rust
/// use smc::distributions::{Deterministic, Distribution, JointDistribution, Poisson};
/// use smc::state::State;
/// use rand::SeedableRng;
///
/// let joint = JointDistribution::new()
///     .with("count", Poisson::new(3.0).unwrap())
///     .with_dependent("double", |drawn| {
///         let count = drawn["count"].array()?;
///         Ok(Deterministic::new(count * 2.0).boxed())
///     });
/// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
/// let value = joint.sample(&mut rng).unwrap();
/// let count = value.field_array("count").unwrap()[[]];
/// assert_eq!(value.field_array("double").unwrap()[[]], 2.0 * count);
/// ```
#[derive(Default)]
pub struct JointDistribution {
    components: Vec<(String, Component)>,
}

impl JointDistribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: impl Into<String>, distribution: impl Distribution + 'static) -> Self {
        self.with_boxed(name, Box::new(distribution))
    }

    pub fn with_boxed(mut self, name: impl Into<String>, distribution: BoxedDistribution) -> Self {
        self.components
            .push((name.into(), Component::Independent(distribution)));
        self
    }

    pub fn with_dependent<F>(mut self, name: impl Into<String>, build: F) -> Self
    where
        F: Fn(&BTreeMap<String, State>) -> Result<BoxedDistribution> + 'static,
    {
        self.components
            .push((name.into(), Component::Dependent(Box::new(build))));
        self
    }

    fn draw(&self, n: Option<usize>, rng: &mut StdRng) -> Result<State> {
        let mut drawn = BTreeMap::new();
        for (name, component) in &self.components {
            let value = match (component, n) {
                (Component::Independent(d), Some(n)) => d.sample_n(n, rng)?,
                (Component::Independent(d), None) => d.sample(rng)?,
                // Built from values that already carry any sample axis.
                (Component::Dependent(build), _) => build(&drawn)?.sample(rng)?,
            };
            drawn.insert(name.clone(), value);
        }
        Ok(State::Map(drawn))
    }
}

impl Distribution for JointDistribution {
    fn batch_shape(&self) -> Vec<usize> {
        self.components
            .iter()
            .filter_map(|(_, c)| match c {
                Component::Independent(d) => Some(d.batch_shape()),
                Component::Dependent(_) => None,
            })
            .fold(Vec::new(), |acc, shape| {
                broadcast_shape(&acc, &shape).unwrap_or(acc)
            })
    }

    fn sample(&self, rng: &mut StdRng) -> Result<State> {
        self.draw(None, rng)
    }

    fn sample_n(&self, n: usize, rng: &mut StdRng) -> Result<State> {
        self.draw(Some(n), rng)
    }

    fn log_prob(&self, value: &State) -> Result<ArrayD<f64>> {
        let fields = match value {
            State::Map(fields) => fields,
            State::Array(_) => {
                return Err(FilterError::StructureMismatch(
                    "joint distribution scores named fields, found an array".to_string(),
                ));
            }
        };
        let mut total = ndarray::arr0(0.0).into_dyn();
        for (name, component) in &self.components {
            let field = fields.get(name).ok_or_else(|| {
                FilterError::StructureMismatch(format!("value is missing field `{name}`"))
            })?;
            let lp = match component {
                Component::Independent(d) => d.log_prob(field)?,
                Component::Dependent(build) => build(fields)?.log_prob(field)?,
            };
            total = add(&total, &lp)?;
        }
        Ok(total)
    }
}
