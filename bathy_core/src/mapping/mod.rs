// bathy_core/src/mapping/mod.rs

// --- Declare the implementation sub-modules ---
pub mod landmarks;
pub mod submap;

// --- Re-export the public structs for a clean API ---
pub use landmarks::{
    DataAssociation, LandmarkCandidate, LandmarkConfig, LandmarkExtractor,
    NearestNeighborAssociation,
};
pub use submap::{
    CompletedSubmap, CompletionCriterion, RepresentativePose, Submap, SubmapBuilder,
    SubmapConfig,
};
