//! Domain layer - Pure business logic.

pub mod errors;
pub mod hls;
pub mod jobs;
pub mod policy;
pub mod probe;
