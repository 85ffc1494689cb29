// bathy_core/src/slam/mod.rs

// --- Declare the implementation sub-modules ---
pub mod factors;
pub mod graph;
pub mod solver;
pub mod system;
pub mod values;

// --- Re-export the public structs for a clean API ---
pub use factors::{BearingRange, Factor};
pub use graph::{CommitReport, FactorGraph, GraphConfig, GraphState, LoopClosure};
pub use solver::{IncrementalSolver, SchurSolver, SolverConfig, SolverReport};
pub use system::{BathySlam, EstimateSnapshot, PingReport, SlamConfig, SubmapReport};
pub use values::{Key, Values};
