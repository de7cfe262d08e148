//! HLS output layout and the encoder command contract.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Directory, next to the source, under which every job gets its own folder.
pub const OUTPUT_ROOT_DIR: &str = "HLSOutput";
pub const MANIFEST_FILE_NAME: &str = "output.m3u8";

/// Output directory for a source file: `<parent>/HLSOutput/<file name>`.
///
/// The file name is kept verbatim, so two sources map to the same directory
/// only if they are the same path.
pub fn output_dir_for(source: &Path) -> PathBuf {
    let parent = source.parent().unwrap_or(Path::new("."));
    let name = source
        .file_name()
        .map(OsStr::to_os_string)
        .unwrap_or_else(|| OsString::from("source"));
    parent.join(OUTPUT_ROOT_DIR).join(name)
}

/// Settings for the stream-copy HLS packaging run.
#[derive(Debug, Clone)]
pub struct PackagingSettings {
    pub segment_seconds: u32,
}

impl Default for PackagingSettings {
    fn default() -> Self {
        Self {
            segment_seconds: 10,
        }
    }
}

/// Arguments for the encoder: stream copy, fixed segment length, unbounded
/// VOD playlist written to `manifest`.
pub fn packaging_args(source: &Path, manifest: &Path, settings: &PackagingSettings) -> Vec<String> {
    vec![
        "-i".to_string(),
        source.to_string_lossy().to_string(),
        "-codec:".to_string(),
        "copy".to_string(),
        "-start_number".to_string(),
        "0".to_string(),
        "-hls_time".to_string(),
        settings.segment_seconds.to_string(),
        "-hls_list_size".to_string(),
        "0".to_string(),
        "-hls_playlist_type".to_string(),
        "vod".to_string(),
        "-f".to_string(),
        "hls".to_string(),
        manifest.to_string_lossy().to_string(),
    ]
}

/// Arguments for the probing tool.
pub fn probe_args(source: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        "error".to_string(),
        "-show_format".to_string(),
        "-show_streams".to_string(),
        source.to_string_lossy().to_string(),
    ]
}
