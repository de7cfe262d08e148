//! Public entry point: submit files, query and cancel jobs.

use super::error::{EngineError, QueueClosed, StoreError};
use super::probe::ProbeAdapter;
use super::store::JobStore;
use super::worker::{PoolSettings, TranscodeWorkerPool};
use crate::config::EngineConfig;
use crate::domain::jobs::{JobEvent, JobFilter, JobId, JobState, JobView, SubmissionResult, Transition};
use crate::domain::policy::ProbeFailurePolicy;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ports::process::ProcessRunner;

/// Extra time a cancel waits beyond the encoder's kill grace.
const CANCEL_SLACK: Duration = Duration::from_secs(1);

pub struct TranscodeEngine<R> {
    config: EngineConfig,
    store: Arc<JobStore>,
    probe: ProbeAdapter<R>,
    pool: TranscodeWorkerPool,
    shutdown: CancellationToken,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl<R> TranscodeEngine<R>
where
    R: ProcessRunner + 'static,
{
    /// Opens the job store, starts the workers and the retention sweep.
    /// Must be called inside a tokio runtime.
    pub fn start(config: EngineConfig, runner: Arc<R>) -> Result<Self, EngineError> {
        let store = match &config.snapshot_path {
            Some(path) => JobStore::open(path).map_err(|source| EngineError::Snapshot {
                path: path.clone(),
                source,
            })?,
            None => JobStore::in_memory(),
        };
        let store = Arc::new(store);

        let probe = ProbeAdapter::new(
            runner.clone(),
            config.probe_program.clone(),
            config.codec_matching,
        );
        let pool = TranscodeWorkerPool::start(
            PoolSettings {
                workers: config.workers,
                encoder_program: config.encoder_program.clone(),
                packaging: config.packaging.clone(),
                encode_timeout: config.encode_timeout,
            },
            store.clone(),
            runner,
        );

        let restored = JobFilter {
            state: Some(JobState::Queued),
            ..Default::default()
        };
        for job in store.list(&restored) {
            pool.enqueue(job.id)?;
            info!(job_id = %job.id, "re-queued job from snapshot");
        }

        let shutdown = CancellationToken::new();
        let janitor = spawn_janitor(&config, store.clone(), shutdown.clone());

        Ok(Self {
            config,
            store,
            probe,
            pool,
            shutdown,
            janitor: Mutex::new(Some(janitor)),
        })
    }

    /// Probes `path` and queues it for packaging if its audio needs it.
    /// Returns as soon as the job is queued.
    pub async fn submit(&self, path: impl AsRef<Path>) -> Result<SubmissionResult, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueClosed.into());
        }
        let source = validate_source(path.as_ref()).await?;

        let needs_transcode = match self.probe.probe(&source).await {
            Ok(probe) => {
                debug!(
                    path = %source.display(),
                    video = ?probe.video_codec,
                    audio = ?probe.audio_codec,
                    "probed source"
                );
                self.config.decision.needs_transcode(&probe)
            }
            Err(e) => match self.config.probe_failure {
                ProbeFailurePolicy::Reject => {
                    warn!(path = %source.display(), error = %e, "probe failed, rejecting source");
                    return Err(e.into());
                }
                ProbeFailurePolicy::AssumeTranscode => {
                    warn!(path = %source.display(), error = %e, "probe failed, packaging anyway");
                    true
                }
            },
        };

        if !needs_transcode {
            info!(path = %source.display(), "audio already in target codec, nothing to do");
            return Ok(SubmissionResult::skipped());
        }

        let (job, created) = self.store.create_or_existing(&source);
        if !created {
            info!(job_id = %job.id, path = %source.display(), "source already has an active job");
            return Ok(SubmissionResult::queued(job.id));
        }

        if let Err(e) = self.pool.enqueue(job.id) {
            let _ = self
                .store
                .transition_from(&job.id, JobState::Queued, Transition::Cancel);
            return Err(e.into());
        }
        Ok(SubmissionResult::queued(job.id))
    }

    pub fn status(&self, id: &JobId) -> Result<JobView, EngineError> {
        Ok(self.store.get(id)?.view())
    }

    /// Cancels a queued or running job. Queued jobs never reach the encoder;
    /// running ones are stopped and this waits until the worker has recorded
    /// the outcome.
    pub async fn cancel(&self, id: &JobId) -> Result<JobView, EngineError> {
        let job = self.store.get(id)?;
        match job.state {
            JobState::Queued => {
                self.pool.remove_queued(id);
                match self
                    .store
                    .transition_from(id, JobState::Queued, Transition::Cancel)
                {
                    Ok(job) => {
                        info!(job_id = %id, "cancelled queued job");
                        Ok(job.view())
                    }
                    // A worker picked it up in the meantime.
                    Err(StoreError::InvalidTransition {
                        from: JobState::Running,
                        ..
                    }) => self.cancel_running(id).await,
                    Err(StoreError::InvalidTransition { from, .. }) => {
                        Err(EngineError::InvalidState { id: *id, state: from })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            JobState::Running => self.cancel_running(id).await,
            state => Err(EngineError::InvalidState { id: *id, state }),
        }
    }

    async fn cancel_running(&self, id: &JobId) -> Result<JobView, EngineError> {
        let mut events = self.store.subscribe();
        if !self.pool.signal_cancel(id) {
            debug!(job_id = %id, "no worker holds the job, waiting for it to settle");
        }

        let wait = self.config.kill_grace + CANCEL_SLACK;
        let settled = tokio::time::timeout(wait, async {
            loop {
                if self.store.get(id)?.state.is_terminal() {
                    return Ok::<_, StoreError>(());
                }
                match events.recv().await {
                    Ok(event) if event.job_id == *id && event.state.is_terminal() => return Ok(()),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        })
        .await;

        match settled {
            Ok(result) => result?,
            Err(_) => warn!(job_id = %id, ?wait, "job did not stop in time"),
        }
        let view = self.store.get(id)?.view();
        info!(job_id = %id, state = %view.state, "cancel finished");
        Ok(view)
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<JobView> {
        self.store.list(filter).map(|job| job.view()).collect()
    }

    /// Live feed of job state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.store.subscribe()
    }

    pub fn queued(&self) -> usize {
        self.pool.queued()
    }

    pub fn running(&self) -> usize {
        self.pool.running()
    }

    /// Rejects further submissions, cancels outstanding work and waits for
    /// the workers to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let janitor = self
            .janitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(janitor) = janitor {
            let _ = janitor.await;
        }
        self.pool.shutdown().await;
        self.store.flush().await;
    }
}

async fn validate_source(path: &Path) -> Result<PathBuf, EngineError> {
    let invalid = |reason: String| EngineError::InvalidSource {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    if !metadata.is_file() {
        return Err(invalid(String::from("not a regular file")));
    }
    tokio::fs::canonicalize(path)
        .await
        .map_err(|e| invalid(e.to_string()))
}

fn spawn_janitor(
    config: &EngineConfig,
    store: Arc<JobStore>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let ttl = config.job_ttl;
    let max_retained = config.max_retained_jobs;
    let interval = config.sweep_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = store.evict(Utc::now(), ttl, max_retained);
                    if removed > 0 {
                        info!(removed, "evicted finished jobs");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::testing::{
        probe_output, wait_for_state, EncodeScript, ProbeScript, ScriptedRunner,
    };
    use crate::domain::errors::{EncodeError, ProbeError};
    use std::collections::HashSet;
    use tempfile::{tempdir, TempDir};

    fn engine_with(
        runner: &Arc<ScriptedRunner>,
        config: EngineConfig,
    ) -> TranscodeEngine<ScriptedRunner> {
        TranscodeEngine::start(config, runner.clone()).unwrap()
    }

    fn source(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"not really a video").unwrap();
        path
    }

    fn job_id(result: SubmissionResult) -> JobId {
        assert!(result.transcoded);
        result.job_id.unwrap()
    }

    #[tokio::test]
    async fn test_mp3_movie_is_packaged() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let engine = engine_with(&runner, EngineConfig::default());

        let id = job_id(engine.submit(source(&dir, "movie.mkv")).await.unwrap());
        let job = wait_for_state(&engine.store, &id, JobState::Succeeded).await;

        let manifest = job.output_manifest_path.unwrap();
        assert!(manifest.ends_with("HLSOutput/movie.mkv/output.m3u8"));
        let contents = std::fs::read_to_string(&manifest).unwrap();
        assert!(contents.starts_with("#EXTM3U"));

        let view = engine.status(&id).unwrap();
        assert_eq!(view.state, JobState::Succeeded);
        assert!(view.error.is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_aac_clip_is_skipped() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.probe_with(ProbeScript::Output(probe_output("h264", "aac")));
        let engine = engine_with(&runner, EngineConfig::default());

        let result = engine.submit(source(&dir, "clip.mp4")).await.unwrap();

        assert!(!result.transcoded);
        assert!(result.job_id.is_none());
        assert!(engine.list(&JobFilter::default()).is_empty());
        assert_eq!(runner.encode_calls(), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_and_directory_sources_are_invalid() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let engine = engine_with(&runner, EngineConfig::default());

        let missing = engine.submit(dir.path().join("nope.mkv")).await;
        assert!(matches!(missing, Err(EngineError::InvalidSource { .. })));

        let directory = engine.submit(dir.path()).await;
        assert!(matches!(directory, Err(EngineError::InvalidSource { .. })));

        assert_eq!(runner.probe_calls(), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_failure_rejects_by_default() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.probe_with(ProbeScript::Fail {
            code: 1,
            stderr: String::from("Invalid data found when processing input"),
        });
        let engine = engine_with(&runner, EngineConfig::default());

        let err = engine.submit(source(&dir, "broken.mkv")).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::Probe(ProbeError::NonZeroExit { code: Some(1), .. })
        ));
        assert!(engine.list(&JobFilter::default()).is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_failure_can_assume_transcode() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.probe_with(ProbeScript::Output(String::from("nothing useful")));
        let config = EngineConfig {
            probe_failure: ProbeFailurePolicy::AssumeTranscode,
            ..Default::default()
        };
        let engine = engine_with(&runner, config);

        let id = job_id(engine.submit(source(&dir, "odd.mkv")).await.unwrap());
        wait_for_state(&engine.store, &id, JobState::Succeeded).await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_queued_job_never_encodes() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let release = CancellationToken::new();
        runner.script(EncodeScript::WaitFor(release.clone()));
        let config = EngineConfig {
            workers: 1,
            ..Default::default()
        };
        let engine = engine_with(&runner, config);

        let first = job_id(engine.submit(source(&dir, "first.mkv")).await.unwrap());
        runner.wait_for_encodes(1).await;
        let second = job_id(engine.submit(source(&dir, "second.mkv")).await.unwrap());
        assert_eq!(engine.status(&second).unwrap().state, JobState::Queued);

        let view = engine.cancel(&second).await.unwrap();
        assert_eq!(view.state, JobState::Cancelled);

        release.cancel();
        wait_for_state(&engine.store, &first, JobState::Succeeded).await;
        engine.shutdown().await;

        assert_eq!(runner.encode_calls(), 1);
        assert_eq!(engine.status(&second).unwrap().state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_running_job_waits_for_stop() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.script(EncodeScript::BlockUntilCancelled);
        let engine = engine_with(&runner, EngineConfig::default());

        let id = job_id(engine.submit(source(&dir, "long.mkv")).await.unwrap());
        runner.wait_for_encodes(1).await;

        let view = engine.cancel(&id).await.unwrap();

        assert_eq!(view.state, JobState::Cancelled);
        assert!(view.finished_at.is_some());
        assert!(view.output_manifest_path.is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_state_is_stable() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let engine = engine_with(&runner, EngineConfig::default());

        let id = job_id(engine.submit(source(&dir, "movie.mkv")).await.unwrap());
        wait_for_state(&engine.store, &id, JobState::Succeeded).await;

        let err = engine.cancel(&id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState {
                state: JobState::Succeeded,
                ..
            }
        ));
        for _ in 0..3 {
            assert_eq!(engine.status(&id).unwrap().state, JobState::Succeeded);
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_encode_then_pool_continues() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.script(EncodeScript::Fail {
            code: 1,
            stderr: String::from("Conversion failed!"),
        });
        let config = EngineConfig {
            workers: 1,
            ..Default::default()
        };
        let engine = engine_with(&runner, config);

        let bad = job_id(engine.submit(source(&dir, "bad.mkv")).await.unwrap());
        let good = job_id(engine.submit(source(&dir, "good.mkv")).await.unwrap());

        wait_for_state(&engine.store, &bad, JobState::Failed).await;
        let view = engine.status(&bad).unwrap();
        assert!(!view.error.unwrap().is_empty());
        wait_for_state(&engine.store, &good, JobState::Succeeded).await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_encode_timeout() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.script(EncodeScript::BlockUntilCancelled);
        let config = EngineConfig {
            encode_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let engine = engine_with(&runner, config);

        let id = job_id(engine.submit(source(&dir, "endless.mkv")).await.unwrap());
        let job = wait_for_state(&engine.store, &id, JobState::Failed).await;
        assert!(matches!(job.error, Some(EncodeError::Timeout { .. })));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_submits_get_distinct_jobs() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let engine = engine_with(&runner, EngineConfig::default());

        let names = ["episode1.mkv", "episode2.mkv", "movie.mkv", "movie_mkv", "a.b.mkv", "a_b.mkv"];
        let sources: Vec<PathBuf> = names.iter().map(|name| source(&dir, name)).collect();
        let results =
            futures::future::join_all(sources.iter().map(|path| engine.submit(path))).await;
        let ids: Vec<JobId> = results
            .into_iter()
            .map(|result| job_id(result.unwrap()))
            .collect();

        let unique: HashSet<JobId> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());

        let mut dirs = HashSet::new();
        for id in &ids {
            let job = wait_for_state(&engine.store, id, JobState::Succeeded).await;
            dirs.insert(job.output_dir);
        }
        assert_eq!(dirs.len(), ids.len());
        let manifests: HashSet<PathBuf> = runner.manifests().into_iter().collect();
        assert_eq!(manifests.len(), ids.len());
        assert!(runner.max_concurrent_encodes() <= 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_submit_returns_active_job() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let release = CancellationToken::new();
        runner.script(EncodeScript::WaitFor(release.clone()));
        let engine = engine_with(&runner, EngineConfig::default());
        let path = source(&dir, "movie.mkv");

        let first = job_id(engine.submit(&path).await.unwrap());
        let second = job_id(engine.submit(&path).await.unwrap());
        assert_eq!(first, second);

        release.cancel();
        wait_for_state(&engine.store, &first, JobState::Succeeded).await;

        let third = job_id(engine.submit(&path).await.unwrap());
        assert_ne!(first, third);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let engine = engine_with(&runner, EngineConfig::default());
        engine.shutdown().await;

        let err = engine.submit(source(&dir, "late.mkv")).await.unwrap_err();
        assert!(matches!(err, EngineError::QueueClosed(_)));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let runner = Arc::new(ScriptedRunner::new());
        let engine = engine_with(&runner, EngineConfig::default());
        let id = JobId::new();

        assert!(matches!(engine.status(&id), Err(EngineError::NotFound(_))));
        assert!(matches!(engine.cancel(&id).await, Err(EngineError::NotFound(_))));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_states_are_published_in_order() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let engine = engine_with(&runner, EngineConfig::default());
        let mut events = engine.subscribe();

        let id = job_id(engine.submit(source(&dir, "movie.mkv")).await.unwrap());

        let mut seen = Vec::new();
        while seen.last() != Some(&JobState::Succeeded) {
            let event = events.recv().await.unwrap();
            if event.job_id == id {
                seen.push(event.state);
            }
        }
        assert_eq!(
            seen,
            vec![JobState::Queued, JobState::Running, JobState::Succeeded]
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_finished_jobs_are_swept() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let config = EngineConfig {
            max_retained_jobs: 0,
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let engine = engine_with(&runner, config);

        let id = job_id(engine.submit(source(&dir, "movie.mkv")).await.unwrap());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while engine.status(&id).is_ok() {
            assert!(tokio::time::Instant::now() < deadline, "job was never evicted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_queued_jobs_resume_from_snapshot() {
        let dir = tempdir().unwrap();
        let snapshot = dir.path().join("state/jobs.json");
        let path = std::fs::canonicalize(source(&dir, "movie.mkv")).unwrap();

        let pending = {
            let store = JobStore::open(&snapshot).unwrap();
            let id = store.create(&path).id;
            store.flush().await;
            id
        };

        let runner = Arc::new(ScriptedRunner::new());
        let config = EngineConfig {
            snapshot_path: Some(snapshot),
            ..Default::default()
        };
        let engine = engine_with(&runner, config);

        wait_for_state(&engine.store, &pending, JobState::Succeeded).await;
        assert_eq!(runner.probe_calls(), 0);
        engine.shutdown().await;
    }
}
