//! External transcode invocation.
//!
//! One ffmpeg subprocess per job, targeting MPEG-DASH. The trait seam
//! exists so the handler can be tested without a real ffmpeg binary.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::process::Output;
use tokio::process::Command;

/// Manifest file name ffmpeg writes into the output directory.
pub const MANIFEST_NAME: &str = "output.mpd";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranscodeExecutor: Send + Sync {
    /// Convert `input` into a DASH manifest plus segments under
    /// `output_dir`, returning the process outcome with captured
    /// output.
    async fn run_ffmpeg_dash(&self, input: &Path, output_dir: &Path) -> std::io::Result<Output>;
}

pub struct FfmpegTranscoder;

#[async_trait]
impl TranscodeExecutor for FfmpegTranscoder {
    async fn run_ffmpeg_dash(&self, input: &Path, output_dir: &Path) -> std::io::Result<Output> {
        Command::new("ffmpeg")
            .args(dash_args(input, output_dir))
            .output()
            .await
    }
}

/// Fixed argument list for the streamable-format conversion.
pub fn dash_args(input: &Path, output_dir: &Path) -> Vec<OsString> {
    vec![
        OsString::from("-i"),
        input.as_os_str().to_owned(),
        OsString::from("-f"),
        OsString::from("dash"),
        output_dir.join(MANIFEST_NAME).into_os_string(),
    ]
}

/// Captured stdout and stderr of a finished process, concatenated for
/// diagnostics.
pub fn combined_output(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}
