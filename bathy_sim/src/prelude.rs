// bathy_sim/src/prelude.rs

// Re-export the entire bathy_core prelude so binaries can reach the pure
// types like `BathySlam`, `FrameHandle` and `RaySimulator`.
pub use bathy_core::prelude::*;

// Re-export common simulation-specific types for easy access.
pub use crate::simulation::config::ScenarioConfig;
pub use crate::simulation::runner::{ControlCommand, RunSummary, Simulation, SimulationNode};
pub use crate::simulation::seabed::Seabed;
pub use crate::simulation::sonar::{MultibeamSonar, SeabedRaycaster};
