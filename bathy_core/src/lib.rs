// bathy_core/src/lib.rs

// This file defines the public modules of the library.
pub mod error;
pub mod estimation;
pub mod mapping;
pub mod messages;
pub mod noise;
pub mod prelude;
pub mod sampling;
pub mod slam;
pub mod types;
