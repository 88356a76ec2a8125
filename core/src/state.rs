//! Structured particle state and the batched array operations the filter is built on.
//!
//! A [`State`] is a tree whose leaves are dynamically shaped `ndarray` arrays. A particle set
//! is laid out as `batch_shape + [num_particles] + event_shape`, so the particle axis of every
//! leaf sits at the same position (`batch_shape.len()`), which is resolved once when a filter
//! is configured. Everything the step loop does to particles (gathering ancestors, stacking
//! steps or history windows, slicing out one timestep) goes through the operations here, which
//! work for any number of leading batch axes.
use std::collections::BTreeMap;

use ndarray::{ArrayBase, ArrayD, ArrayViewD, Axis, Data, IxDyn};

use crate::error::{FilterError, Result};

/// Move axis `from` of `array` to position `to`. The result is in standard layout.
pub fn move_array_axis<T: Clone>(array: &ArrayD<T>, from: usize, to: usize) -> Result<ArrayD<T>> {
    let ndim = array.ndim();
    if from >= ndim || to >= ndim {
        return Err(FilterError::ShapeMismatch(format!(
            "cannot move axis {from} to {to} in shape {:?}",
            array.shape()
        )));
    }
    let mut order: Vec<usize> = (0..ndim).filter(|&axis| axis != from).collect();
    order.insert(to, from);
    Ok(array
        .view()
        .permuted_axes(order)
        .as_standard_layout()
        .into_owned())
}

/// Broadcast two shapes using the usual trailing-axis alignment rules.
///
/// # Example
/// ```rust
/// use smc::state::broadcast_shape;
///
/// assert_eq!(broadcast_shape(&[3, 1], &[4]).unwrap(), vec![3, 4]);
/// assert!(broadcast_shape(&[3], &[4]).is_err());
/// ```
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut shape = vec![1; ndim];
    for k in 0..ndim {
        let da = if k < a.len() { a[a.len() - 1 - k] } else { 1 };
        let db = if k < b.len() { b[b.len() - 1 - k] } else { 1 };
        shape[ndim - 1 - k] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(FilterError::ShapeMismatch(format!(
                    "shapes {a:?} and {b:?} cannot be broadcast together"
                )));
            }
        };
    }
    Ok(shape)
}

/// Broadcast `array` to `shape`, returning an owned copy.
pub fn broadcast_to<T: Clone>(array: &ArrayD<T>, shape: &[usize]) -> Result<ArrayD<T>> {
    array
        .broadcast(IxDyn(shape))
        .map(|view| view.to_owned())
        .ok_or_else(|| {
            FilterError::ShapeMismatch(format!(
                "cannot broadcast shape {:?} to {:?}",
                array.shape(),
                shape
            ))
        })
}

/// Elementwise `a + b` with broadcasting, failing instead of panicking on incompatible shapes.
pub fn add(a: &ArrayD<f64>, b: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    broadcast_shape(a.shape(), b.shape())?;
    Ok(a + b)
}

/// Elementwise `a - b` with broadcasting.
pub fn sub(a: &ArrayD<f64>, b: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    broadcast_shape(a.shape(), b.shape())?;
    Ok(a - b)
}

/// Identity ancestry for an index array of the given shape: every particle is its own parent.
/// The particle axis is the last axis of `shape`.
pub fn identity_indices(shape: &[usize]) -> ArrayD<usize> {
    let last = shape.len().saturating_sub(1);
    ArrayD::from_shape_fn(IxDyn(shape), |ix| if shape.is_empty() { 0 } else { ix[last] })
}

/// Batched gather along `axis`.
///
/// `indices` must have shape `array.shape()[..axis] + [m]`: every batch instance (the axes in
/// front of `axis`) carries its own index vector. The result has shape
/// `array.shape()[..axis] + [m] + array.shape()[axis + 1..]` with
/// `out[b, i, ...] = array[b, indices[b, i], ...]`.
///
/// # Example
/// ```rust
/// use ndarray::{array, ArrayD};
/// use smc::state::gather_along_axis;
///
/// let values = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]].into_dyn();
/// let indices: ArrayD<usize> = array![[2, 2, 0], [1, 0, 0]].into_dyn();
/// let gathered = gather_along_axis(&values, 1, &indices).unwrap();
/// assert_eq!(gathered, array![[3.0, 3.0, 1.0], [5.0, 4.0, 4.0]].into_dyn());
/// ```
pub fn gather_along_axis<S, T>(
    array: &ArrayBase<S, IxDyn>,
    axis: usize,
    indices: &ArrayD<usize>,
) -> Result<ArrayD<T>>
where
    S: Data<Elem = T>,
    T: Clone,
{
    let shape = array.shape();
    if axis >= shape.len()
        || indices.ndim() != axis + 1
        || indices.shape()[..axis] != shape[..axis]
    {
        return Err(FilterError::ShapeMismatch(format!(
            "cannot gather axis {axis} of an array with shape {shape:?} using indices of shape {:?}",
            indices.shape()
        )));
    }
    let outer: usize = shape[..axis].iter().product();
    let length = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();
    let selected = indices.shape()[axis];

    let source: Vec<T> = array.iter().cloned().collect();
    let flat_indices: Vec<usize> = indices.iter().copied().collect();
    let mut gathered = Vec::with_capacity(outer * selected * inner);
    for b in 0..outer {
        for &index in &flat_indices[b * selected..(b + 1) * selected] {
            if index >= length {
                return Err(FilterError::IndexOutOfRange {
                    index,
                    num_particles: length,
                });
            }
            let start = (b * length + index) * inner;
            gathered.extend_from_slice(&source[start..start + inner]);
        }
    }
    let mut out_shape = shape.to_vec();
    out_shape[axis] = selected;
    Ok(ArrayD::from_shape_vec(IxDyn(&out_shape), gathered)?)
}

/// Stack arrays of identical shape along a new axis.
pub fn stack_arrays<T: Clone>(arrays: &[ArrayD<T>], axis: usize) -> Result<ArrayD<T>> {
    if arrays.is_empty() {
        return Err(FilterError::ShapeMismatch(
            "cannot stack an empty list of arrays".to_string(),
        ));
    }
    let views: Vec<ArrayViewD<'_, T>> = arrays.iter().map(|a| a.view()).collect();
    Ok(ndarray::stack(Axis(axis), &views)?)
}

/// A latent-state value: a single array or a mapping of named sub-states.
#[derive(Clone, Debug, PartialEq)]
pub enum State {
    Array(ArrayD<f64>),
    Map(BTreeMap<String, State>),
}

impl From<ArrayD<f64>> for State {
    fn from(array: ArrayD<f64>) -> Self {
        State::Array(array)
    }
}

impl State {
    /// A zero-dimensional state.
    pub fn scalar(value: f64) -> Self {
        State::Array(ndarray::arr0(value).into_dyn())
    }

    /// A one-dimensional state.
    pub fn from_vec(values: Vec<f64>) -> Self {
        State::Array(ndarray::Array1::from(values).into_dyn())
    }

    /// Build a structured state from named fields.
    ///
    /// ```rust
    /// use smc::state::State;
    ///
    /// let state = State::named([("position", State::scalar(0.0)), ("velocity", State::scalar(1.0))]);
    /// assert_eq!(state.field_array("velocity").unwrap()[[]], 1.0);
    /// ```
    pub fn named<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, State)>,
        K: Into<String>,
    {
        State::Map(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_array(&self) -> Option<&ArrayD<f64>> {
        match self {
            State::Array(a) => Some(a),
            State::Map(_) => None,
        }
    }

    /// The leaf array of an unstructured state.
    pub fn array(&self) -> Result<&ArrayD<f64>> {
        self.as_array().ok_or_else(|| {
            FilterError::StructureMismatch("expected an array, found named fields".to_string())
        })
    }

    pub fn field(&self, name: &str) -> Option<&State> {
        match self {
            State::Map(fields) => fields.get(name),
            State::Array(_) => None,
        }
    }

    /// The array stored under `name`.
    pub fn field_array(&self, name: &str) -> Result<&ArrayD<f64>> {
        self.field(name)
            .ok_or_else(|| FilterError::StructureMismatch(format!("no field named `{name}`")))?
            .array()
    }

    /// All leaf arrays in field-name order.
    pub fn leaves(&self) -> Vec<&ArrayD<f64>> {
        match self {
            State::Array(a) => vec![a],
            State::Map(fields) => fields.values().flat_map(|v| v.leaves()).collect(),
        }
    }

    /// Leaf arrays paired with their dotted field paths (`""` for an unstructured state).
    pub fn flatten(&self) -> Vec<(String, &ArrayD<f64>)> {
        match self {
            State::Array(a) => vec![(String::new(), a)],
            State::Map(fields) => fields
                .iter()
                .flat_map(|(name, value)| {
                    value.flatten().into_iter().map(move |(path, a)| {
                        if path.is_empty() {
                            (name.clone(), a)
                        } else {
                            (format!("{name}.{path}"), a)
                        }
                    })
                })
                .collect(),
        }
    }

    pub fn map_arrays<F>(&self, mut f: F) -> State
    where
        F: FnMut(&ArrayD<f64>) -> ArrayD<f64>,
    {
        self.map_arrays_dyn(&mut f)
    }

    fn map_arrays_dyn(&self, f: &mut dyn FnMut(&ArrayD<f64>) -> ArrayD<f64>) -> State {
        match self {
            State::Array(a) => State::Array(f(a)),
            State::Map(fields) => {
                let mut mapped = BTreeMap::new();
                for (name, value) in fields {
                    mapped.insert(name.clone(), value.map_arrays_dyn(f));
                }
                State::Map(mapped)
            }
        }
    }

    pub fn try_map_arrays<F>(&self, mut f: F) -> Result<State>
    where
        F: FnMut(&ArrayD<f64>) -> Result<ArrayD<f64>>,
    {
        self.try_map_arrays_dyn(&mut f)
    }

    fn try_map_arrays_dyn(
        &self,
        f: &mut dyn FnMut(&ArrayD<f64>) -> Result<ArrayD<f64>>,
    ) -> Result<State> {
        match self {
            State::Array(a) => Ok(State::Array(f(a)?)),
            State::Map(fields) => {
                let mut mapped = BTreeMap::new();
                for (name, value) in fields {
                    mapped.insert(name.clone(), value.try_map_arrays_dyn(f)?);
                }
                Ok(State::Map(mapped))
            }
        }
    }

    /// Combine two states with identical structure leaf by leaf.
    pub fn try_zip_arrays<F>(&self, other: &State, mut f: F) -> Result<State>
    where
        F: FnMut(&ArrayD<f64>, &ArrayD<f64>) -> Result<ArrayD<f64>>,
    {
        self.try_zip_arrays_dyn(other, &mut f)
    }

    fn try_zip_arrays_dyn(
        &self,
        other: &State,
        f: &mut dyn FnMut(&ArrayD<f64>, &ArrayD<f64>) -> Result<ArrayD<f64>>,
    ) -> Result<State> {
        match (self, other) {
            (State::Array(a), State::Array(b)) => Ok(State::Array(f(a, b)?)),
            (State::Map(left), State::Map(right)) => {
                if !left.keys().eq(right.keys()) {
                    return Err(FilterError::StructureMismatch(format!(
                        "fields {:?} do not match {:?}",
                        left.keys().collect::<Vec<_>>(),
                        right.keys().collect::<Vec<_>>()
                    )));
                }
                let mut zipped = BTreeMap::new();
                for ((name, l), r) in left.iter().zip(right.values()) {
                    zipped.insert(name.clone(), l.try_zip_arrays_dyn(r, f)?);
                }
                Ok(State::Map(zipped))
            }
            _ => Err(FilterError::StructureMismatch(
                "cannot combine an array with named fields".to_string(),
            )),
        }
    }

    /// Gather every leaf along `axis` with per-batch-instance indices (see [`gather_along_axis`]).
    pub fn gather(&self, axis: usize, indices: &ArrayD<usize>) -> Result<State> {
        self.try_map_arrays(|a| gather_along_axis(a, axis, indices))
    }

    /// Select entry `index` of `axis` in every leaf, dropping that axis.
    pub fn index_axis(&self, axis: usize, index: usize) -> Result<State> {
        self.try_map_arrays(|a| {
            if axis >= a.ndim() || index >= a.shape()[axis] {
                return Err(FilterError::ShapeMismatch(format!(
                    "index {index} along axis {axis} is out of bounds for shape {:?}",
                    a.shape()
                )));
            }
            Ok(a.index_axis(Axis(axis), index).to_owned())
        })
    }

    /// Insert a length-one axis at `axis` in every leaf.
    pub fn insert_axis(&self, axis: usize) -> Result<State> {
        self.try_map_arrays(|a| {
            if axis > a.ndim() {
                return Err(FilterError::ShapeMismatch(format!(
                    "cannot insert axis {axis} into shape {:?}",
                    a.shape()
                )));
            }
            Ok(a.clone().insert_axis(Axis(axis)))
        })
    }

    /// Move axis `from` of every leaf to position `to`, shifting the axes in between.
    pub fn move_axis(&self, from: usize, to: usize) -> Result<State> {
        self.try_map_arrays(|a| move_array_axis(a, from, to))
    }

    /// Stack states of identical structure and shape along a new axis.
    pub fn stack(states: &[State], axis: usize) -> Result<State> {
        let first = states.first().ok_or_else(|| {
            FilterError::ShapeMismatch("cannot stack an empty list of states".to_string())
        })?;
        match first {
            State::Array(_) => {
                let arrays = states
                    .iter()
                    .map(|s| s.array().cloned())
                    .collect::<Result<Vec<_>>>()?;
                Ok(State::Array(stack_arrays(&arrays, axis)?))
            }
            State::Map(fields) => {
                let mut stacked = BTreeMap::new();
                for name in fields.keys() {
                    let children = states
                        .iter()
                        .map(|s| {
                            s.field(name).cloned().ok_or_else(|| {
                                FilterError::StructureMismatch(format!(
                                    "field `{name}` missing from a stacked state"
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    stacked.insert(name.clone(), State::stack(&children, axis)?);
                }
                Ok(State::Map(stacked))
            }
        }
    }

    /// Verify that every leaf starts with `expected` (its trailing axes are free).
    pub fn check_leading_shape(&self, expected: &[usize], what: &str) -> Result<()> {
        for (path, leaf) in self.flatten() {
            let shape = leaf.shape();
            if shape.len() < expected.len() || shape[..expected.len()] != *expected {
                let name = if path.is_empty() { "value" } else { path.as_str() };
                return Err(FilterError::ShapeMismatch(format!(
                    "{what}: `{name}` has shape {shape:?}, expected leading shape {expected:?}"
                )));
            }
        }
        Ok(())
    }
}
