//! In-memory job registry with optional JSON snapshot.
//!
//! Each job sits behind its own mutex, so transitions on different jobs never
//! contend; the outer map lock is only held to find, insert or evict entries.

use super::error::StoreError;
use crate::adapters::events::EventHub;
use crate::domain::errors::EncodeError;
use crate::domain::jobs::{Job, JobEvent, JobFilter, JobId, JobState, Transition};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

type JobMap = HashMap<JobId, Arc<Mutex<Job>>>;

pub struct JobStore {
    jobs: Arc<RwLock<JobMap>>,
    next_seq: AtomicU64,
    events: EventHub,
    snapshot: Option<Arc<SnapshotWriter>>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl JobStore {
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
            events: EventHub::default(),
            snapshot: None,
        }
    }

    /// Opens a store persisted at `path`, loading whatever was saved there.
    /// Jobs that were running when the snapshot was written can't be resumed
    /// and are marked failed; queued jobs stay queued.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut store = Self::in_memory();

        let saved: Vec<Job> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let mut max_seq = None;
        let mut jobs = HashMap::with_capacity(saved.len());
        for mut job in saved {
            if job.state == JobState::Running {
                let _ = job.apply(
                    Transition::Fail {
                        error: EncodeError::Interrupted,
                    },
                    now,
                );
                warn!(job_id = %job.id, "job was running at shutdown, marked failed");
            }
            max_seq = max_seq.max(Some(job.seq));
            jobs.insert(job.id, Arc::new(Mutex::new(job)));
        }

        info!(path = %path.display(), jobs = jobs.len(), "loaded job snapshot");
        store.jobs = Arc::new(RwLock::new(jobs));
        store.next_seq = AtomicU64::new(max_seq.map_or(0, |s| s + 1));
        store.snapshot = Some(Arc::new(SnapshotWriter::new(path)));
        store.persist();
        Ok(store)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Registers a new queued job for `source`.
    pub fn create(&self, source: &Path) -> Job {
        let job = {
            let mut jobs = write(&self.jobs);
            self.insert_locked(&mut jobs, source)
        };
        self.created(&job);
        job
    }

    /// Like [`create`](Self::create), but if a job for the same source is still
    /// queued or running that job is returned instead. The flag is `true` when
    /// a new job was created.
    pub fn create_or_existing(&self, source: &Path) -> (Job, bool) {
        let job = {
            let mut jobs = write(&self.jobs);
            let existing = jobs.values().find_map(|entry| {
                let job = lock(entry);
                (job.source_path.as_path() == source && !job.state.is_terminal()).then(|| job.clone())
            });
            if let Some(job) = existing {
                return (job, false);
            }
            self.insert_locked(&mut jobs, source)
        };
        self.created(&job);
        (job, true)
    }

    pub fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        let entry = self.entry(id)?;
        let job = lock(&entry).clone();
        Ok(job)
    }

    pub fn transition(&self, id: &JobId, transition: Transition) -> Result<Job, StoreError> {
        self.apply(id, None, transition)
    }

    /// Applies `transition` only if the job is currently in `expected`.
    pub fn transition_from(
        &self,
        id: &JobId,
        expected: JobState,
        transition: Transition,
    ) -> Result<Job, StoreError> {
        self.apply(id, Some(expected), transition)
    }

    /// Jobs matching `filter`, oldest first.
    pub fn list(&self, filter: &JobFilter) -> impl Iterator<Item = Job> {
        let mut jobs: Vec<Job> = read(&self.jobs)
            .values()
            .map(|entry| lock(entry).clone())
            .filter(|job| filter.matches(job))
            .collect();
        jobs.sort_by_key(|job| job.seq);
        jobs.into_iter()
    }

    pub fn len(&self) -> usize {
        read(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops finished jobs older than `ttl`, then the oldest finished jobs
    /// until at most `max_retained` remain. Queued and running jobs are never
    /// evicted. Returns how many jobs were removed.
    pub fn evict(&self, now: DateTime<Utc>, ttl: Option<Duration>, max_retained: usize) -> usize {
        let removed = {
            let mut jobs = write(&self.jobs);
            let mut finished: Vec<(JobId, DateTime<Utc>, u64)> = jobs
                .values()
                .filter_map(|entry| {
                    let job = lock(entry);
                    if job.state.is_terminal() {
                        Some((job.id, job.finished_at.unwrap_or(job.created_at), job.seq))
                    } else {
                        None
                    }
                })
                .collect();
            finished.sort_by_key(|&(_, finished_at, seq)| (finished_at, seq));

            let before = jobs.len();
            let cutoff = ttl
                .and_then(|ttl| TimeDelta::from_std(ttl).ok())
                .and_then(|ttl| now.checked_sub_signed(ttl));
            for (id, finished_at, _) in &finished {
                let expired = cutoff.is_some_and(|cutoff| *finished_at < cutoff);
                if expired || jobs.len() > max_retained {
                    jobs.remove(id);
                }
            }
            before - jobs.len()
        };

        if removed > 0 {
            debug!(removed, "evicted finished jobs");
            self.persist();
        }
        removed
    }

    fn insert_locked(&self, jobs: &mut HashMap<JobId, Arc<Mutex<Job>>>, source: &Path) -> Job {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let job = Job::new(seq, source, Utc::now());
        jobs.insert(job.id, Arc::new(Mutex::new(job.clone())));
        job
    }

    fn created(&self, job: &Job) {
        info!(job_id = %job.id, source = %job.source_path.display(), "job queued");
        self.events.publish(JobEvent {
            job_id: job.id,
            state: job.state,
            at: job.created_at,
        });
        self.persist();
    }

    fn apply(
        &self,
        id: &JobId,
        expected: Option<JobState>,
        transition: Transition,
    ) -> Result<Job, StoreError> {
        let entry = self.entry(id)?;
        let to = transition.target();
        let now = Utc::now();

        let job = {
            let mut job = lock(&entry);
            if expected.is_some_and(|expected| job.state != expected) {
                return Err(StoreError::InvalidTransition {
                    id: *id,
                    from: job.state,
                    to,
                });
            }
            job.apply(transition, now)
                .map_err(|from| StoreError::InvalidTransition { id: *id, from, to })?;
            job.clone()
        };

        info!(job_id = %id, state = %job.state, "job state changed");
        self.events.publish(JobEvent {
            job_id: *id,
            state: job.state,
            at: now,
        });
        self.persist();
        Ok(job)
    }

    fn entry(&self, id: &JobId) -> Result<Arc<Mutex<Job>>, StoreError> {
        read(&self.jobs)
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound(*id))
    }

    /// Waits until the snapshot on disk reflects every mutation made so far.
    pub async fn flush(&self) {
        if let Some(snapshot) = &self.snapshot {
            snapshot.idle().await;
        }
    }

    /// Inside a runtime the write happens on the blocking pool; without one
    /// it is done inline.
    fn persist(&self) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                if snapshot.mark_dirty() {
                    let snapshot = snapshot.clone();
                    let jobs = self.jobs.clone();
                    handle.spawn_blocking(move || snapshot.drain(&jobs));
                }
            }
            Err(_) => snapshot.write(&self.jobs),
        }
    }
}

#[derive(Default)]
struct WriterState {
    dirty: bool,
    writing: bool,
}

/// Coalesces snapshot writes: at most one writer runs at a time and it keeps
/// going until no mutation is left unwritten.
struct SnapshotWriter {
    path: PathBuf,
    state: Mutex<WriterState>,
    file: Mutex<()>,
    idle: Notify,
}

impl SnapshotWriter {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(WriterState::default()),
            file: Mutex::new(()),
            idle: Notify::new(),
        }
    }

    /// Records a pending write. Returns `true` when the caller has to start
    /// the writer.
    fn mark_dirty(&self) -> bool {
        let mut state = lock(&self.state);
        state.dirty = true;
        !std::mem::replace(&mut state.writing, true)
    }

    fn drain(&self, jobs: &RwLock<JobMap>) {
        loop {
            {
                let mut state = lock(&self.state);
                if !state.dirty {
                    state.writing = false;
                    self.idle.notify_waiters();
                    return;
                }
                state.dirty = false;
            }
            self.write(jobs);
        }
    }

    fn write(&self, jobs: &RwLock<JobMap>) {
        let _file = lock(&self.file);
        let mut saved: Vec<Job> = read(jobs).values().map(|entry| lock(entry).clone()).collect();
        saved.sort_by_key(|job| job.seq);
        if let Err(e) = write_snapshot(&self.path, &saved) {
            warn!(path = %self.path.display(), error = %e, "failed to write job snapshot");
        }
    }

    async fn idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !lock(&self.state).writing {
                return;
            }
            notified.await;
        }
    }
}

fn write_snapshot(path: &Path, jobs: &[Job]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(jobs)?)?;
    std::fs::rename(&tmp, path)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rw: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rw: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}
