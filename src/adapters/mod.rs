//! Adapters - Concrete implementations of ports and inbound interfaces.

pub mod events;
pub mod http;
pub mod process;
