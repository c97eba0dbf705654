use async_trait::async_trait;
use std::error::Error;

/// One raw delivery handed to the worker pool. The payload is opaque
/// until the handler parses it; the tag is what acknowledgment and the
/// attempt count is what the retry policy operate on.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    /// Times this job was already republished for retry (0 on first
    /// delivery)
    pub attempts: u32,
}

/// Transport-side operations the conversion handler needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Positively acknowledge one delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Publish a JSON body to `queue` via `routing_key`, declaring and
    /// binding the destination first.
    async fn publish(
        &self,
        routing_key: &str,
        queue: &str,
        body: &[u8],
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Republish a failed job with its attempt counter so the next
    /// delivery knows how often it was tried.
    async fn publish_retry(
        &self,
        routing_key: &str,
        queue: &str,
        body: &[u8],
        attempts: u32,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}
