// bathy_sim/src/simulation/mod.rs

pub mod config;
pub mod prng;
pub mod runner;
pub mod seabed;
pub mod sonar;
pub mod survey;
pub mod transforms;
pub mod utils;
