//! Failure taxonomy for the conversion pipeline.

use crate::domain::chunks::MergeError;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Everything that can abort one job's pipeline. Each variant maps to
/// the stage label recorded in the error log.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to parse job payload: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("failed to create output directory {dir}: {source}")]
    OutputDir {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to run ffmpeg: {0}")]
    TranscoderSpawn(#[source] std::io::Error),

    #[error("ffmpeg exited with {status}: {output}")]
    Transcode { status: ExitStatus, output: String },

    #[error("failed to claim video {video_id}: {source}")]
    Claim {
        video_id: i64,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to mark video {video_id} as processed: {source}")]
    MarkProcessed {
        video_id: i64,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ConvertError {
    /// Stage label persisted with the failure report.
    pub fn stage(&self) -> &'static str {
        match self {
            ConvertError::Deserialize(_) => "deserialize",
            ConvertError::Merge(_) => "merge",
            ConvertError::OutputDir { .. }
            | ConvertError::TranscoderSpawn(_)
            | ConvertError::Transcode { .. } => "transcode",
            ConvertError::Claim { .. } | ConvertError::MarkProcessed { .. } => "persistence",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_labels() {
        let err = serde_json::from_str::<i64>("not json").unwrap_err();
        assert_eq!(ConvertError::Deserialize(err).stage(), "deserialize");

        let merge = MergeError::ListDir {
            dir: PathBuf::from("uploads/1"),
            source: std::io::Error::other("boom"),
        };
        assert_eq!(ConvertError::Merge(merge).stage(), "merge");

        let claim = ConvertError::Claim {
            video_id: 1,
            source: "down".into(),
        };
        assert_eq!(claim.stage(), "persistence");
    }
}
