use super::probe::ProbeResult;

pub const DEFAULT_TARGET_AUDIO_CODEC: &str = "aac";

/// Decides whether a probed file has to go through HLS packaging.
#[derive(Debug, Clone)]
pub struct TranscodeDecisionPolicy {
    pub target_audio_codec: String,
    /// Outcome when the probe found no audio codec at all.
    pub transcode_unknown: bool,
}

impl Default for TranscodeDecisionPolicy {
    fn default() -> Self {
        Self {
            target_audio_codec: DEFAULT_TARGET_AUDIO_CODEC.to_string(),
            transcode_unknown: false,
        }
    }
}

impl TranscodeDecisionPolicy {
    pub fn needs_transcode(&self, probe: &ProbeResult) -> bool {
        match probe.audio_codec.as_deref() {
            Some(codec) => !codec.eq_ignore_ascii_case(&self.target_audio_codec),
            None => self.transcode_unknown,
        }
    }
}

/// What `submit` does when the source could not be probed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProbeFailurePolicy {
    /// Report the probe error to the caller and create no job.
    #[default]
    Reject,
    /// Queue the file for packaging anyway.
    AssumeTranscode,
}

impl std::str::FromStr for ProbeFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(ProbeFailurePolicy::Reject),
            "transcode" => Ok(ProbeFailurePolicy::AssumeTranscode),
            other => Err(format!("unknown probe failure policy: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_failure_policy_from_str() {
        assert_eq!("reject".parse(), Ok(ProbeFailurePolicy::Reject));
        assert_eq!("transcode".parse(), Ok(ProbeFailurePolicy::AssumeTranscode));
        assert!("ignore".parse::<ProbeFailurePolicy>().is_err());
    }

    fn probed(audio: Option<&str>) -> ProbeResult {
        ProbeResult {
            video_codec: Some("h264".to_string()),
            audio_codec: audio.map(String::from),
            raw: String::new(),
        }
    }

    #[test]
    fn test_other_audio_codec_needs_transcode() {
        let policy = TranscodeDecisionPolicy::default();
        assert!(policy.needs_transcode(&probed(Some("mp3"))));
        assert!(policy.needs_transcode(&probed(Some("ac3"))));
    }

    #[test]
    fn test_target_codec_is_left_alone() {
        let policy = TranscodeDecisionPolicy::default();
        assert!(!policy.needs_transcode(&probed(Some("aac"))));
        assert!(!policy.needs_transcode(&probed(Some("AAC"))));
    }

    #[test]
    fn test_unknown_audio_follows_configuration() {
        let lenient = TranscodeDecisionPolicy::default();
        assert!(!lenient.needs_transcode(&probed(None)));

        let strict = TranscodeDecisionPolicy {
            transcode_unknown: true,
            ..Default::default()
        };
        assert!(strict.needs_transcode(&probed(None)));
    }

    #[test]
    fn test_configured_target_codec() {
        let policy = TranscodeDecisionPolicy {
            target_audio_codec: "opus".to_string(),
            transcode_unknown: false,
        };
        assert!(!policy.needs_transcode(&probed(Some("opus"))));
        assert!(policy.needs_transcode(&probed(Some("aac"))));
    }
}
