use async_trait::async_trait;
use std::error::Error;

/// Persistence seam for the idempotency gate.
///
/// A `success` row for a video id is the single source of truth for
/// "already converted". Short-lived `in_progress` claim rows serialize
/// concurrent deliveries of the same id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessedVideoStore: Send + Sync {
    /// Whether a success row exists for this video.
    async fn is_processed(&self, video_id: i64) -> Result<bool, Box<dyn Error + Send + Sync>>;

    /// Conflict-safe insert of the in-progress claim. `false` when
    /// another delivery holds the claim or the video already completed.
    async fn try_claim(&self, video_id: i64) -> Result<bool, Box<dyn Error + Send + Sync>>;

    /// Upgrade the claim to `success` with the completion timestamp.
    async fn mark_processed(&self, video_id: i64) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Drop the claim after a failed run so redelivery can retry.
    async fn release_claim(&self, video_id: i64) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Append-only sink for failure reports. Never read back by the worker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ErrorLog: Send + Sync {
    /// Append one serialized failure context row.
    async fn record(&self, details: &str) -> Result<(), Box<dyn Error + Send + Sync>>;
}
