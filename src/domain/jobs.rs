use super::errors::EncodeError;
use super::hls;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Opaque job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Queued, Cancelled)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// A requested state change together with the fields it carries.
#[derive(Debug, Clone)]
pub enum Transition {
    Start,
    Succeed { manifest: PathBuf },
    Fail { error: EncodeError },
    Cancel,
}

impl Transition {
    pub fn target(&self) -> JobState {
        match self {
            Transition::Start => JobState::Running,
            Transition::Succeed { .. } => JobState::Succeeded,
            Transition::Fail { .. } => JobState::Failed,
            Transition::Cancel => JobState::Cancelled,
        }
    }
}

/// One transcode request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub seq: u64,
    pub source_path: PathBuf,
    pub output_dir: PathBuf,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<EncodeError>,
    pub output_manifest_path: Option<PathBuf>,
}

impl Job {
    pub fn new(seq: u64, source_path: &Path, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            seq,
            source_path: source_path.to_path_buf(),
            output_dir: hls::output_dir_for(source_path),
            state: JobState::Queued,
            created_at: now,
            started_at: None,
            finished_at: None,
            error: None,
            output_manifest_path: None,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(hls::MANIFEST_FILE_NAME)
    }

    /// Applies `transition`, refusing anything the state machine forbids.
    /// Timestamps are only ever written once.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<(), JobState> {
        let next = transition.target();
        if !self.state.can_transition_to(next) {
            return Err(self.state);
        }

        match transition {
            Transition::Start => {
                self.started_at.get_or_insert(now);
            }
            Transition::Succeed { manifest } => {
                self.output_manifest_path = Some(manifest);
                self.finished_at.get_or_insert(now);
            }
            Transition::Fail { error } => {
                self.error = Some(error);
                self.finished_at.get_or_insert(now);
            }
            Transition::Cancel => {
                self.finished_at.get_or_insert(now);
            }
        }
        self.state = next;
        Ok(())
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            state: self.state,
            source_path: self.source_path.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            output_manifest_path: self.output_manifest_path.clone(),
            error: self.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// What callers of the engine get to see of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub state: JobState,
    pub source_path: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_manifest_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    pub transcoded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

impl SubmissionResult {
    pub fn skipped() -> Self {
        Self {
            transcoded: false,
            job_id: None,
        }
    }

    pub fn queued(job_id: JobId) -> Self {
        Self {
            transcoded: true,
            job_id: Some(job_id),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub source_path: Option<PathBuf>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.state.map_or(true, |s| job.state == s)
            && self
                .source_path
                .as_ref()
                .map_or(true, |p| &job.source_path == p)
    }
}

/// Broadcast whenever a job is created or changes state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: JobId,
    pub state: JobState,
    pub at: DateTime<Utc>,
}
