//! Error types produced by the probe and encode steps.

use serde::{Deserialize, Serialize};

/// Failure to obtain usable metadata from the probing tool.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to start probe process: {0}")]
    ProcessStartFailed(#[source] std::io::Error),

    #[error("probe exited with {}: {stderr}", exit_code(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("probe output contained no stream information")]
    Unparseable,
}

/// Why a job ended up `Failed` (or, for `Cancelled`, why the worker stopped).
///
/// Recorded on the job and only ever observed through its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncodeError {
    #[error("failed to start encoder: {message}")]
    ProcessStartFailed { message: String },

    #[error("encoder exited with {}: {stderr}", exit_code(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("encoder timed out after {after_secs}s")]
    Timeout { after_secs: u64 },

    #[error("encode cancelled")]
    Cancelled,

    #[error("encoder reported success but {path} was not written")]
    MissingOutput { path: String },

    #[error("could not prepare output directory: {message}")]
    OutputDir { message: String },

    #[error("encode task panicked: {message}")]
    Panicked { message: String },

    #[error("interrupted by a restart while running")]
    Interrupted,
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => String::from("no status (killed by signal)"),
    }
}
