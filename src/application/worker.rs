//! Bounded pool of workers running the HLS packaging step.

use super::error::QueueClosed;
use super::queue::WorkQueue;
use super::store::JobStore;
use crate::domain::errors::EncodeError;
use crate::domain::hls::{packaging_args, PackagingSettings};
use crate::domain::jobs::{Job, JobId, JobState, Transition};
use crate::ports::process::{CommandSpec, ProcessOutcome, ProcessRunner};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of concurrent encodes.
pub const DEFAULT_WORKERS: usize = 2;

/// Lines of encoder stderr kept on a failed job.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub encoder_program: String,
    pub packaging: PackagingSettings,
    pub encode_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            encoder_program: String::from("ffmpeg"),
            packaging: PackagingSettings::default(),
            encode_timeout: None,
        }
    }
}

type RunningJobs = Mutex<HashMap<JobId, CancellationToken>>;

/// Fixed set of worker tasks fed from one FIFO queue.
pub struct TranscodeWorkerPool {
    queue: Arc<WorkQueue>,
    running: Arc<RunningJobs>,
    store: Arc<JobStore>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TranscodeWorkerPool {
    /// Spawns `settings.workers` tasks (at least one). Must be called inside a
    /// tokio runtime.
    pub fn start<R>(settings: PoolSettings, store: Arc<JobStore>, runner: Arc<R>) -> Self
    where
        R: ProcessRunner + 'static,
    {
        let queue = Arc::new(WorkQueue::new());
        let running = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let workers = settings.workers.max(1);

        let worker = Arc::new(Worker {
            settings,
            store: store.clone(),
            runner,
            queue: queue.clone(),
            running: running.clone(),
            shutdown: shutdown.clone(),
        });

        let handles = (0..workers)
            .map(|id| {
                let worker = worker.clone();
                tokio::spawn(async move {
                    worker.run_worker_loop(id).await;
                })
            })
            .collect();
        info!(workers, "started transcoding workers");

        Self {
            queue,
            running,
            store,
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    pub fn enqueue(&self, id: JobId) -> Result<(), QueueClosed> {
        self.queue.push(id)?;
        debug!(job_id = %id, queued = self.queue.len(), "job enqueued");
        Ok(())
    }

    /// Takes a job out of the queue before any worker picked it up.
    pub fn remove_queued(&self, id: &JobId) -> bool {
        self.queue.remove(id)
    }

    /// Asks the worker running `id` to stop. Returns `false` when no worker
    /// holds the job.
    pub fn signal_cancel(&self, id: &JobId) -> bool {
        match lock(&self.running).get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn running(&self) -> usize {
        lock(&self.running).len()
    }

    /// Stops accepting work, cancels whatever is still queued or running and
    /// waits for every worker to exit.
    pub async fn shutdown(&self) {
        for id in self.queue.close() {
            if let Err(e) = self
                .store
                .transition_from(&id, JobState::Queued, Transition::Cancel)
            {
                debug!(job_id = %id, error = %e, "queued job not cancelled at shutdown");
            }
        }
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.handles));
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("transcoding workers stopped");
    }
}

struct Worker<R> {
    settings: PoolSettings,
    store: Arc<JobStore>,
    runner: Arc<R>,
    queue: Arc<WorkQueue>,
    running: Arc<RunningJobs>,
    shutdown: CancellationToken,
}

impl<R> Worker<R>
where
    R: ProcessRunner + 'static,
{
    async fn run_worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker = worker_id, "worker started");

        while let Some(job_id) = self.queue.pop().await {
            // Register before starting so a cancel racing the start finds it.
            let token = self.shutdown.child_token();
            lock(&self.running).insert(job_id, token.clone());

            let job = match self
                .store
                .transition_from(&job_id, JobState::Queued, Transition::Start)
            {
                Ok(job) => job,
                Err(e) => {
                    debug!(worker = worker_id, job_id = %job_id, error = %e, "skipping job");
                    lock(&self.running).remove(&job_id);
                    continue;
                }
            };
            info!(worker = worker_id, job_id = %job_id, source = %job.source_path.display(), "processing job");

            // Each job runs in its own task so a panic only fails that job.
            let task = tokio::spawn(self.clone().execute(job, token));
            let finish = match task.await {
                Ok(finish) => finish,
                Err(e) => {
                    let message = if e.is_panic() {
                        panic_message(e.into_panic())
                    } else {
                        e.to_string()
                    };
                    error!(worker = worker_id, job_id = %job_id, panic = %message, "encode task panicked");
                    Transition::Fail {
                        error: EncodeError::Panicked { message },
                    }
                }
            };

            lock(&self.running).remove(&job_id);
            if let Err(e) = self.store.transition(&job_id, finish) {
                warn!(worker = worker_id, job_id = %job_id, error = %e, "could not record job outcome");
            }
        }

        debug!(worker = worker_id, "worker stopped");
    }

    async fn execute(self: Arc<Self>, job: Job, token: CancellationToken) -> Transition {
        if token.is_cancelled() {
            return Transition::Cancel;
        }

        if let Err(e) = tokio::fs::create_dir_all(&job.output_dir).await {
            return Transition::Fail {
                error: EncodeError::OutputDir {
                    message: format!("{}: {}", job.output_dir.display(), e),
                },
            };
        }

        let manifest = job.manifest_path();
        let command = CommandSpec::new(
            self.settings.encoder_program.clone(),
            packaging_args(&job.source_path, &manifest, &self.settings.packaging),
        );

        let run = self.runner.run(command, token.clone());
        tokio::pin!(run);

        let mut timed_out = false;
        let outcome = match self.settings.encode_timeout {
            Some(limit) => {
                let limited = tokio::time::timeout(limit, &mut run).await;
                match limited {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(job_id = %job.id, ?limit, "encode timed out, stopping encoder");
                        timed_out = true;
                        token.cancel();
                        run.await
                    }
                }
            }
            None => run.await,
        };

        match outcome {
            Err(e) => Transition::Fail {
                error: EncodeError::ProcessStartFailed {
                    message: e.to_string(),
                },
            },
            Ok(ProcessOutcome::Cancelled { .. }) if timed_out => Transition::Fail {
                error: EncodeError::Timeout {
                    after_secs: self
                        .settings
                        .encode_timeout
                        .map_or(0, |t| t.as_secs() + u64::from(t.subsec_nanos() > 0)),
                },
            },
            Ok(ProcessOutcome::Cancelled { .. }) => {
                info!(job_id = %job.id, output = %job.output_dir.display(), "encode cancelled, partial output left in place");
                Transition::Cancel
            }
            Ok(ProcessOutcome::Exited(output)) if output.success() => {
                if tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
                    Transition::Succeed { manifest }
                } else {
                    Transition::Fail {
                        error: EncodeError::MissingOutput {
                            path: manifest.display().to_string(),
                        },
                    }
                }
            }
            Ok(ProcessOutcome::Exited(output)) => {
                warn!(job_id = %job.id, code = ?output.code, "encoder failed");
                Transition::Fail {
                    error: EncodeError::NonZeroExit {
                        code: output.code,
                        stderr: stderr_tail(&output.stderr),
                    },
                }
            }
        }
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        String::from("no error output")
    } else {
        tail
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => String::from("unknown panic"),
        },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
