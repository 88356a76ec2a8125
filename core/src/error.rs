//! Error types shared by every stage of the filter.
//!
//! Configuration and shape problems are reported eagerly, before the step loop touches any
//! particles. Numerical degeneracy (every particle weight collapsing to zero) is deliberately
//! *not* represented here: it travels through the outputs as `-inf`/`NaN` log marginal
//! likelihoods and is left for the caller to inspect.
use thiserror::Error;

/// Failure modes of the particle filter and its collaborators.
#[derive(Debug, Error)]
pub enum FilterError {
    /// Array shapes do not line up (batch shapes, particle counts, event shapes).
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Two structured states were combined but their named fields differ.
    #[error("state structure mismatch: {0}")]
    StructureMismatch(String),

    /// A model callback asks for a history window the filter was not configured to keep.
    #[error(
        "{callback} consumes {history} history, but num_steps_{history}_history_to_pass is 0; \
         configure a non-zero window or build the callback without {history} history"
    )]
    CallbackArity {
        callback: &'static str,
        history: &'static str,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid distribution parameter: {0}")]
    InvalidParameter(String),

    #[error("ancestor index {index} is out of range for {num_particles} particles")]
    IndexOutOfRange { index: usize, num_particles: usize },

    #[error("the observation sequence is empty")]
    EmptyObservations,

    #[error("config format error: {0}")]
    ConfigFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl From<ndarray::ShapeError> for FilterError {
    fn from(err: ndarray::ShapeError) -> Self {
        FilterError::ShapeMismatch(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FilterError>;
