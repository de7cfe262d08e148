use crate::domain::errors::ProbeError;
use crate::domain::hls::probe_args;
use crate::domain::probe::{parse_probe_output, CodecMatching, ProbeResult};
use crate::ports::process::{CommandSpec, ProcessOutcome, ProcessRunner};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs the media inspector against a source file and reads its codecs.
pub struct ProbeAdapter<R> {
    runner: Arc<R>,
    program: String,
    matching: CodecMatching,
}

impl<R> ProbeAdapter<R>
where
    R: ProcessRunner,
{
    pub fn new(runner: Arc<R>, program: impl Into<String>, matching: CodecMatching) -> Self {
        Self {
            runner,
            program: program.into(),
            matching,
        }
    }

    pub async fn probe(&self, source: &Path) -> Result<ProbeResult, ProbeError> {
        let command = CommandSpec::new(self.program.clone(), probe_args(source));
        let outcome = self
            .runner
            .run(command, CancellationToken::new())
            .await
            .map_err(ProbeError::ProcessStartFailed)?;

        let output = match outcome {
            ProcessOutcome::Exited(output) => output,
            ProcessOutcome::Cancelled { stderr } => {
                return Err(ProbeError::NonZeroExit { code: None, stderr })
            }
        };

        debug!(source = %source.display(), stdout = %output.stdout, "probe output");
        if !output.stderr.trim().is_empty() {
            warn!(source = %source.display(), stderr = %output.stderr.trim(), "probe reported errors");
        }

        if !output.success() {
            return Err(ProbeError::NonZeroExit {
                code: output.code,
                stderr: output.stderr,
            });
        }

        parse_probe_output(&output.stdout, self.matching).ok_or(ProbeError::Unparseable)
    }
}
