// bathy_core/src/prelude.rs

// --- Core Abstractions (The main contracts of the library) ---
pub use crate::estimation::{RaySimulator, StateEstimator};
pub use crate::mapping::DataAssociation;
pub use crate::messages::{MbesReading, ModuleInput, OdometryInput, Ping, PoseEstimate};
pub use crate::slam::IncrementalSolver;
pub use crate::types::{FrameHandle, TfProvider};

// --- Core Data Structures (The "nouns" of the library) ---
pub use crate::error::{ConfigError, GraphError, SlamError};
pub use crate::types::{Landmark, LandmarkId, LandmarkSet, ParticleId, Pose};

// --- Estimation and Mapping ---
pub use crate::estimation::particle_filter::{ParticleFilter, ParticleFilterConfig};
pub use crate::estimation::resampling::ResamplingStrategy;
pub use crate::estimation::FrameAnchors;
pub use crate::mapping::{LandmarkConfig, SubmapBuilder, SubmapConfig};

// --- SLAM ---
pub use crate::slam::{BathySlam, EstimateSnapshot, FactorGraph, GraphConfig, SlamConfig};
