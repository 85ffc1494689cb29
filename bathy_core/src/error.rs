// bathy_core/src/error.rs

use crate::types::LandmarkId;
use thiserror::Error;

/// Invalid configuration. Detected when a component is constructed and never
/// recovered from at runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("particle filter needs at least one particle")]
    NoParticles,

    #[error("beam count must be positive")]
    NoBeams,

    #[error("`{name}` has {actual} entries, expected {expected}")]
    WrongDimension {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("`{name}[{index}]` = {value} is not a valid variance")]
    InvalidCovariance {
        name: &'static str,
        index: usize,
        value: f64,
    },

    #[error("noise model `{0}` is not positive definite")]
    NotPositiveDefinite(&'static str),

    #[error("`{name}` must be positive and finite, got {value}")]
    NotPositive { name: &'static str, value: f64 },
}

/// Errors raised by the factor graph.
///
/// Everything except `SolverFailed` is a programming error in the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("graph has no prior yet")]
    NotInitialized,

    #[error("graph already has a prior")]
    AlreadyInitialized,

    #[error("pose node x{0} does not exist")]
    UnknownPose(usize),

    #[error("odometry must extend the chain tip x{tip}, got x{step}")]
    NotChainTip { step: usize, tip: usize },

    #[error("landmark {0} has no estimate")]
    UnknownLandmark(LandmarkId),

    /// The solve was rolled back and the staged factors are still pending.
    #[error("solver failed: {0}")]
    SolverFailed(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SlamError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
