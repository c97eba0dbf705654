use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One unit of work describing a video to convert.
///
/// Wire format: `{"video_id": 1, "path": "media/uploads/1"}`. The same
/// shape is published downstream as the completion confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionJob {
    pub video_id: i64,
    /// Directory holding the uploaded chunks for this video
    pub path: PathBuf,
}
