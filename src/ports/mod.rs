//! Ports - Trait definitions for the outside world.

pub mod process;

pub use process::{CommandSpec, ProcessOutcome, ProcessOutput, ProcessRunner};
