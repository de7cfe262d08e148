//! In-crate fake runner and helpers shared by worker and engine tests.

use super::store::JobStore;
use crate::domain::jobs::{Job, JobId, JobState};
use crate::ports::process::{CommandSpec, ProcessOutcome, ProcessOutput, ProcessRunner};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub(crate) fn probe_output(video: &str, audio: &str) -> String {
    format!(
        "[STREAM]\nindex=0\ncodec_name={}\ncodec_type=video\n[/STREAM]\n\
         [STREAM]\nindex=1\ncodec_name={}\ncodec_type=audio\n[/STREAM]\n\
         [FORMAT]\nformat_name=matroska,webm\n[/FORMAT]\n",
        video, audio
    )
}

pub(crate) enum ProbeScript {
    Output(String),
    Fail { code: i32, stderr: String },
}

pub(crate) enum EncodeScript {
    /// Writes a manifest to the output path and exits 0.
    Succeed,
    SucceedWithoutOutput,
    Fail { code: i32, stderr: String },
    /// Runs until the cancellation token fires.
    BlockUntilCancelled,
    /// Succeeds once `release` is cancelled.
    WaitFor(CancellationToken),
    Panic,
    StartFailure,
}

/// Answers probe calls from a fixed script and encode calls from a queue of
/// scripts, falling back to `Succeed` once the queue is empty.
pub(crate) struct ScriptedRunner {
    probe: Mutex<ProbeScript>,
    encodes: Mutex<VecDeque<EncodeScript>>,
    commands: Mutex<Vec<CommandSpec>>,
    probe_calls: AtomicUsize,
    encode_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            probe: Mutex::new(ProbeScript::Output(probe_output("h264", "mp3"))),
            encodes: Mutex::new(VecDeque::new()),
            commands: Mutex::new(Vec::new()),
            probe_calls: AtomicUsize::new(0),
            encode_calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn probe_with(&self, script: ProbeScript) {
        *self.probe.lock().unwrap() = script;
    }

    pub fn script(&self, script: EncodeScript) {
        self.encodes.lock().unwrap().push_back(script);
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn encode_calls(&self) -> usize {
        self.encode_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_encodes(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Manifest paths handed to the encoder, in call order.
    pub fn manifests(&self) -> Vec<PathBuf> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|cmd| cmd.args.last().map(PathBuf::from))
            .collect()
    }

    pub async fn wait_for_encodes(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        while self.encode_calls() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} encode calls, saw {}",
                count,
                self.encode_calls()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn probe_outcome(&self) -> ProcessOutcome {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        match &*self.probe.lock().unwrap() {
            ProbeScript::Output(stdout) => ProcessOutcome::Exited(ProcessOutput {
                code: Some(0),
                stdout: stdout.clone(),
                stderr: String::new(),
            }),
            ProbeScript::Fail { code, stderr } => ProcessOutcome::Exited(ProcessOutput {
                code: Some(*code),
                stdout: String::new(),
                stderr: stderr.clone(),
            }),
        }
    }

    async fn encode(
        &self,
        command: CommandSpec,
        cancel: CancellationToken,
    ) -> io::Result<ProcessOutcome> {
        let manifest = command.args.last().map(PathBuf::from).unwrap_or_default();
        self.commands.lock().unwrap().push(command);
        let script = self
            .encodes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(EncodeScript::Succeed);

        let _active = ActiveEncode::enter(self);
        self.encode_calls.fetch_add(1, Ordering::SeqCst);

        match script {
            EncodeScript::Succeed => write_manifest(&manifest).await,
            EncodeScript::SucceedWithoutOutput => Ok(exited(0, "")),
            EncodeScript::Fail { code, stderr } => Ok(exited(code, &stderr)),
            EncodeScript::BlockUntilCancelled => {
                cancel.cancelled().await;
                Ok(ProcessOutcome::Cancelled {
                    stderr: String::from("Exiting normally, received signal 15."),
                })
            }
            EncodeScript::WaitFor(release) => {
                tokio::select! {
                    _ = release.cancelled() => write_manifest(&manifest).await,
                    _ = cancel.cancelled() => Ok(ProcessOutcome::Cancelled { stderr: String::new() }),
                }
            }
            EncodeScript::Panic => panic!("encoder crashed"),
            EncodeScript::StartFailure => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "No such file or directory (os error 2)",
            )),
        }
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        command: CommandSpec,
        cancel: CancellationToken,
    ) -> io::Result<ProcessOutcome> {
        if command.args.iter().any(|arg| arg == "-show_streams") {
            Ok(self.probe_outcome())
        } else {
            self.encode(command, cancel).await
        }
    }
}

struct ActiveEncode<'a>(&'a ScriptedRunner);

impl<'a> ActiveEncode<'a> {
    fn enter(runner: &'a ScriptedRunner) -> Self {
        let now = runner.active.fetch_add(1, Ordering::SeqCst) + 1;
        runner.max_active.fetch_max(now, Ordering::SeqCst);
        Self(runner)
    }
}

impl Drop for ActiveEncode<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn exited(code: i32, stderr: &str) -> ProcessOutcome {
    ProcessOutcome::Exited(ProcessOutput {
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

async fn write_manifest(manifest: &std::path::Path) -> io::Result<ProcessOutcome> {
    tokio::fs::write(manifest, "#EXTM3U\n#EXT-X-ENDLIST\n").await?;
    Ok(exited(0, ""))
}

/// Polls the store until the job reaches `state`.
pub(crate) async fn wait_for_state(store: &JobStore, id: &JobId, state: JobState) -> Job {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let job = store.get(id).unwrap();
        if job.state == state {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            id,
            job.state,
            state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
