//! Best-effort failure reporting.

use crate::domain::errors::ConvertError;
use crate::ports::repository::ErrorLog;
use chrono::Utc;
use serde_json::json;
use tracing::error;

/// Serializes failure context and appends it to the error log. Every
/// failure to do so is logged and swallowed: reporting must never
/// cascade into the handler.
pub struct ErrorReporter<L> {
    log: L,
}

impl<L: ErrorLog> ErrorReporter<L> {
    pub fn new(log: L) -> Self {
        Self { log }
    }

    /// Persist one failure event. `video_id` is absent when the payload
    /// never parsed.
    pub async fn report(&self, video_id: Option<i64>, err: &ConvertError) {
        let context = json!({
            "video_id": video_id,
            "stage": err.stage(),
            "details": err.to_string(),
            "time": Utc::now(),
        });
        let serialized = context.to_string();

        error!(error_details = %serialized, "processing error");

        if let Err(log_err) = self.log.record(&serialized).await {
            error!(error = %log_err, "failed to store error log");
        }
    }
}
