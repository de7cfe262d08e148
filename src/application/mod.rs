//! Application layer - Job orchestration on top of the ports.

pub mod engine;
pub mod error;
pub mod probe;
pub mod queue;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
