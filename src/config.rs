//! Configuration loaded from the environment (and an optional `.env` file).

use crate::domain::hls::PackagingSettings;
use crate::domain::policy::{ProbeFailurePolicy, TranscodeDecisionPolicy, DEFAULT_TARGET_AUDIO_CODEC};
use crate::domain::probe::CodecMatching;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Settings for the HTTP binary.
#[derive(Clone, Debug)]
pub struct Config {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    pub engine: EngineConfig,
}

/// Settings for the job engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub probe_program: String,
    pub encoder_program: String,
    pub workers: usize,
    pub decision: TranscodeDecisionPolicy,
    pub codec_matching: CodecMatching,
    pub probe_failure: ProbeFailurePolicy,
    pub packaging: PackagingSettings,
    /// Encodes running longer than this are stopped and marked failed.
    pub encode_timeout: Option<Duration>,
    /// Time a cancelled encoder gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Finished jobs older than this are evicted.
    pub job_ttl: Option<Duration>,
    pub max_retained_jobs: usize,
    pub sweep_interval: Duration,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            probe_program: String::from("ffprobe"),
            encoder_program: String::from("ffmpeg"),
            workers: 2,
            decision: TranscodeDecisionPolicy::default(),
            codec_matching: CodecMatching::default(),
            probe_failure: ProbeFailurePolicy::default(),
            packaging: PackagingSettings::default(),
            encode_timeout: None,
            kill_grace: Duration::from_secs(5),
            job_ttl: Some(Duration::from_secs(86_400)),
            max_retained_jobs: 1000,
            sweep_interval: Duration::from_secs(60),
            snapshot_path: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EngineConfig::default();
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| String::from(default));

        let port = var("PORT", "3000");
        parse::<u16>("PORT", Some(port.clone()))?;

        let secs = |key: &'static str| -> Result<Option<Duration>, ConfigError> {
            Ok(parse::<u64>(key, lookup(key))?.map(Duration::from_secs))
        };

        let engine = EngineConfig {
            probe_program: var("FFPROBE_BIN", "ffprobe"),
            encoder_program: var("FFMPEG_BIN", "ffmpeg"),
            workers: match parse::<usize>("TRANSCODE_WORKERS", lookup("TRANSCODE_WORKERS"))? {
                Some(0) => return Err(invalid("TRANSCODE_WORKERS", "0", "must be at least 1")),
                Some(n) => n,
                None => defaults.workers,
            },
            decision: TranscodeDecisionPolicy {
                target_audio_codec: var("TARGET_AUDIO_CODEC", DEFAULT_TARGET_AUDIO_CODEC),
                transcode_unknown: parse("TRANSCODE_UNKNOWN_AUDIO", lookup("TRANSCODE_UNKNOWN_AUDIO"))?
                    .unwrap_or(defaults.decision.transcode_unknown),
            },
            codec_matching: parse("CODEC_MATCHING", lookup("CODEC_MATCHING"))?
                .unwrap_or(defaults.codec_matching),
            probe_failure: parse("PROBE_FAILURE_POLICY", lookup("PROBE_FAILURE_POLICY"))?
                .unwrap_or(defaults.probe_failure),
            packaging: PackagingSettings {
                segment_seconds: parse("HLS_SEGMENT_SECONDS", lookup("HLS_SEGMENT_SECONDS"))?
                    .unwrap_or(defaults.packaging.segment_seconds),
            },
            encode_timeout: secs("ENCODE_TIMEOUT_SECS")?,
            kill_grace: secs("KILL_GRACE_SECS")?.unwrap_or(defaults.kill_grace),
            // A TTL of 0 disables age-based eviction.
            job_ttl: match secs("JOB_TTL_SECS")? {
                Some(ttl) if ttl.is_zero() => None,
                Some(ttl) => Some(ttl),
                None => defaults.job_ttl,
            },
            max_retained_jobs: parse("MAX_RETAINED_JOBS", lookup("MAX_RETAINED_JOBS"))?
                .unwrap_or(defaults.max_retained_jobs),
            sweep_interval: match secs("JOB_SWEEP_INTERVAL_SECS")? {
                Some(interval) if interval.is_zero() => {
                    return Err(invalid("JOB_SWEEP_INTERVAL_SECS", "0", "must be positive"))
                }
                Some(interval) => interval,
                None => defaults.sweep_interval,
            },
            snapshot_path: lookup("JOB_SNAPSHOT_PATH")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        };

        Ok(Self {
            addr: var("ADDR", "127.0.0.1"),
            port,
            engine,
        })
    }
}

fn parse<T>(key: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match value {
        None => Ok(None),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => Err(invalid(key, &value, e)),
        },
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
