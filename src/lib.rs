//! HLS packager - Probe media files and repackage them as HLS in the background.
//!
//! Hexagonal Architecture:
//! - domain/: Pure business logic (jobs, probe parsing, transcode policy, hls layout)
//! - ports/: Trait definitions (external process runner)
//! - adapters/: Concrete implementations (tokio subprocesses, event hub, HTTP API)
//! - application/: Job store, worker pool and the engine tying them together
//! - config: Environment configuration

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

// Re-exports for convenience
pub use adapters::process::TokioProcessRunner;
pub use application::engine::TranscodeEngine;
pub use application::error::EngineError;
pub use config::{Config, EngineConfig};
pub use domain::jobs::{JobFilter, JobId, JobState, JobView, SubmissionResult};
