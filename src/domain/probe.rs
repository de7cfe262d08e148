use regex::Regex;
use std::sync::LazyLock;

static STREAM_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[STREAM\](.*?)\[/STREAM\]").expect("valid regex"));
static CODEC_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^codec_name=(\w+)").expect("valid regex"));
static CODEC_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^codec_type=(\w+)").expect("valid regex"));

/// Codec information read from one probe run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub raw: String,
}

/// How codec names are picked out of the probe text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CodecMatching {
    /// Read each `[STREAM]` section and take the first video and first audio
    /// stream by `codec_type`.
    #[default]
    PerStream,
    /// Take the first `codec_name=` in the whole output for both video and
    /// audio. Kept for compatibility with the old upload service.
    FirstMatch,
}

impl std::str::FromStr for CodecMatching {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-stream" => Ok(CodecMatching::PerStream),
            "first-match" => Ok(CodecMatching::FirstMatch),
            other => Err(format!("unknown codec matching mode: {}", other)),
        }
    }
}

/// Parses probe text. Returns `None` when the text has neither stream sections
/// nor any `codec_name=` field.
pub fn parse_probe_output(raw: &str, matching: CodecMatching) -> Option<ProbeResult> {
    let has_streams = STREAM_SECTION.is_match(raw);
    let first_codec = CODEC_NAME
        .captures(raw)
        .map(|caps| caps[1].to_string());

    if !has_streams && first_codec.is_none() {
        return None;
    }

    let (video_codec, audio_codec) = match matching {
        CodecMatching::FirstMatch => (first_codec.clone(), first_codec),
        CodecMatching::PerStream => per_stream_codecs(raw),
    };

    Some(ProbeResult {
        video_codec,
        audio_codec,
        raw: raw.to_string(),
    })
}

fn per_stream_codecs(raw: &str) -> (Option<String>, Option<String>) {
    let mut video = None;
    let mut audio = None;

    for section in STREAM_SECTION.captures_iter(raw) {
        let body = &section[1];
        let codec_type = CODEC_TYPE.captures(body).map(|c| c[1].to_string());
        let codec_name = CODEC_NAME.captures(body).map(|c| c[1].to_string());

        match codec_type.as_deref() {
            Some("video") if video.is_none() => video = codec_name,
            Some("audio") if audio.is_none() => audio = codec_name,
            _ => {}
        }
        if video.is_some() && audio.is_some() {
            break;
        }
    }

    (video, audio)
}
