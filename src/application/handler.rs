//! Job handling: the pipeline from raw delivery to confirmed
//! conversion.
//!
//! `handle` never propagates an error to the consume loop. Failures
//! are reported, the in-progress claim is released and the delivery is
//! disposed of according to the retry policy; acknowledgment only
//! happens for duplicates and for fully marked completions.

use crate::application::reporter::ErrorReporter;
use crate::application::retry::{FailureAction, RetryPolicy};
use crate::application::transcoder::{combined_output, TranscodeExecutor};
use crate::config::Config;
use crate::domain::chunks::merge_chunks;
use crate::domain::errors::ConvertError;
use crate::domain::jobs::ConversionJob;
use crate::ports::queue::{InboundMessage, JobTransport};
use crate::ports::repository::{ErrorLog, ProcessedVideoStore};
use tracing::{error, info, warn};

/// Name of the transient concatenation artifact inside the upload
/// directory.
pub const MERGED_FILE_NAME: &str = "merged.mp4";

/// Output directory for the DASH manifest and segments, inside the
/// upload directory.
pub const DASH_DIR_NAME: &str = "mpeg-dash";

/// Queue routing used for confirmations, retries and dead letters.
#[derive(Clone, Debug)]
pub struct Routing {
    pub conversion_key: String,
    pub conversion_queue: String,
    pub confirmation_key: String,
    pub confirmation_queue: String,
    pub dead_letter_key: String,
    pub dead_letter_queue: String,
}

impl Routing {
    pub fn from_config(config: &Config) -> Self {
        Self {
            conversion_key: config.conversion_key.clone(),
            conversion_queue: config.conversion_queue.clone(),
            confirmation_key: config.confirmation_key.clone(),
            confirmation_queue: config.confirmation_queue.clone(),
            dead_letter_key: config.dead_letter_key.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
        }
    }
}

pub struct ConversionHandler<T, S, L, X> {
    transport: T,
    store: S,
    reporter: ErrorReporter<L>,
    transcoder: X,
    routing: Routing,
    retry: RetryPolicy,
}

impl<T, S, L, X> ConversionHandler<T, S, L, X>
where
    T: JobTransport,
    S: ProcessedVideoStore,
    L: ErrorLog,
    X: TranscodeExecutor,
{
    pub fn new(
        transport: T,
        store: S,
        reporter: ErrorReporter<L>,
        transcoder: X,
        routing: Routing,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            store,
            reporter,
            transcoder,
            routing,
            retry,
        }
    }

    /// Process one delivery end to end.
    pub async fn handle(&self, message: InboundMessage) {
        let job: ConversionJob = match serde_json::from_slice(&message.body) {
            Ok(job) => job,
            Err(err) => {
                self.reporter
                    .report(None, &ConvertError::Deserialize(err))
                    .await;
                self.dispose_failure(&message, self.retry.on_poison()).await;
                return;
            }
        };

        let video_id = job.video_id;

        // A storage error here counts as "not processed" so the job is
        // attempted rather than silently skipped.
        let already_processed = match self.store.is_processed(video_id).await {
            Ok(processed) => processed,
            Err(err) => {
                error!(video_id, error = %err, "idempotency check failed, assuming unprocessed");
                false
            }
        };
        if already_processed {
            warn!(video_id, "video already processed");
            self.ack(message.delivery_tag).await;
            return;
        }

        match self.store.try_claim(video_id).await {
            Ok(true) => {}
            Ok(false) => {
                // Another delivery is converting this video right now.
                // Redelivery will retry once it finished, and the
                // idempotency gate answers then.
                info!(video_id, "conversion already in flight");
                return;
            }
            Err(source) => {
                let err = ConvertError::Claim { video_id, source };
                self.reporter.report(Some(video_id), &err).await;
                self.dispose_failure(&message, self.retry.on_failure(message.attempts))
                    .await;
                return;
            }
        }

        if let Err(err) = self.process_video(&job).await {
            self.reporter.report(Some(video_id), &err).await;
            self.release_claim(video_id).await;
            self.dispose_failure(&message, self.retry.on_failure(message.attempts))
                .await;
            return;
        }

        if let Err(source) = self.store.mark_processed(video_id).await {
            // The completion row does not exist yet, so the job must
            // come back: no ack, no confirmation.
            let err = ConvertError::MarkProcessed { video_id, source };
            self.reporter.report(Some(video_id), &err).await;
            self.release_claim(video_id).await;
            self.dispose_failure(&message, self.retry.on_failure(message.attempts))
                .await;
            return;
        }
        info!(video_id, "video marked as processed");

        self.ack(message.delivery_tag).await;
        self.publish_confirmation(&job).await;
    }

    /// merge -> transcode -> cleanup
    async fn process_video(&self, job: &ConversionJob) -> Result<(), ConvertError> {
        let merged_file = job.path.join(MERGED_FILE_NAME);
        let dash_dir = job.path.join(DASH_DIR_NAME);

        info!(video_id = job.video_id, path = %job.path.display(), "merging chunks");
        let chunk_count = merge_chunks(&job.path, &merged_file).await?;
        info!(video_id = job.video_id, chunk_count, "merged chunks");

        tokio::fs::create_dir_all(&dash_dir)
            .await
            .map_err(|source| ConvertError::OutputDir {
                dir: dash_dir.clone(),
                source,
            })?;

        let output = self
            .transcoder
            .run_ffmpeg_dash(&merged_file, &dash_dir)
            .await
            .map_err(ConvertError::TranscoderSpawn)?;
        if !output.status.success() {
            return Err(ConvertError::Transcode {
                status: output.status,
                output: combined_output(&output),
            });
        }
        info!(video_id = job.video_id, path = %dash_dir.display(), "converted to MPEG-DASH");

        if let Err(err) = tokio::fs::remove_file(&merged_file).await {
            warn!(file = %merged_file.display(), error = %err, "failed to remove merged file");
        }

        Ok(())
    }

    async fn dispose_failure(&self, message: &InboundMessage, action: FailureAction) {
        match action {
            FailureAction::Leave => {}
            FailureAction::Retry { next_attempt } => {
                let requeued = self
                    .transport
                    .publish_retry(
                        &self.routing.conversion_key,
                        &self.routing.conversion_queue,
                        &message.body,
                        next_attempt,
                    )
                    .await;
                match requeued {
                    Ok(()) => {
                        info!(next_attempt, "requeued failed job");
                        self.ack(message.delivery_tag).await;
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to requeue job, leaving unacknowledged");
                    }
                }
            }
            FailureAction::DeadLetter => {
                let parked = self
                    .transport
                    .publish(
                        &self.routing.dead_letter_key,
                        &self.routing.dead_letter_queue,
                        &message.body,
                    )
                    .await;
                match parked {
                    Ok(()) => {
                        warn!(attempts = message.attempts, "dead-lettered job");
                        self.ack(message.delivery_tag).await;
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to dead-letter job, leaving unacknowledged");
                    }
                }
            }
        }
    }

    async fn publish_confirmation(&self, job: &ConversionJob) {
        let body = match serde_json::to_vec(job) {
            Ok(body) => body,
            Err(err) => {
                warn!(video_id = job.video_id, error = %err, "failed to serialize confirmation");
                return;
            }
        };

        // Fire and forget: the video is marked processed, a publish
        // failure must not fail the pipeline.
        let published = self
            .transport
            .publish(
                &self.routing.confirmation_key,
                &self.routing.confirmation_queue,
                &body,
            )
            .await;
        if let Err(err) = published {
            warn!(video_id = job.video_id, error = %err, "failed to publish confirmation");
        }
    }

    async fn ack(&self, delivery_tag: u64) {
        if let Err(err) = self.transport.ack(delivery_tag).await {
            error!(delivery_tag, error = %err, "failed to ack delivery");
        }
    }

    async fn release_claim(&self, video_id: i64) {
        if let Err(err) = self.store.release_claim(video_id).await {
            error!(video_id, error = %err, "failed to release in-progress claim");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::transcoder::MockTranscodeExecutor;
    use crate::ports::queue::MockJobTransport;
    use crate::ports::repository::{MockErrorLog, MockProcessedVideoStore};
    use mockall::predicate::eq;
    use std::fs;
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::process::{ExitStatus, Output};
    use tempfile::tempdir;

    const TAG: u64 = 81;

    fn routing() -> Routing {
        Routing {
            conversion_key: String::from("convertion"),
            conversion_queue: String::from("video_conversion_queue"),
            confirmation_key: String::from("finish-conversion"),
            confirmation_queue: String::from("video-confirmation_queue"),
            dead_letter_key: String::from("dead-letter"),
            dead_letter_queue: String::from("video_conversion_dead_letter"),
        }
    }

    fn handler(
        transport: MockJobTransport,
        store: MockProcessedVideoStore,
        log: MockErrorLog,
        transcoder: MockTranscodeExecutor,
        retry: RetryPolicy,
    ) -> ConversionHandler<
        MockJobTransport,
        MockProcessedVideoStore,
        MockErrorLog,
        MockTranscodeExecutor,
    > {
        ConversionHandler::new(
            transport,
            store,
            ErrorReporter::new(log),
            transcoder,
            routing(),
            retry,
        )
    }

    fn message(body: &[u8]) -> InboundMessage {
        message_after(body, 0)
    }

    fn message_after(body: &[u8], attempts: u32) -> InboundMessage {
        InboundMessage {
            delivery_tag: TAG,
            body: body.to_vec(),
            attempts,
        }
    }

    fn job_body(video_id: i64, path: &Path) -> Vec<u8> {
        serde_json::to_vec(&ConversionJob {
            video_id,
            path: path.to_path_buf(),
        })
        .unwrap()
    }

    fn success_output() -> Output {
        Output {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    fn failure_output(stderr: &str) -> Output {
        Output {
            // Raw wait status 256 is exit code 1.
            status: ExitStatus::from_raw(256),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    fn write_chunks(dir: &Path) {
        fs::write(dir.join("1.chunk"), b"AB").unwrap();
        fs::write(dir.join("2.chunk"), b"CD").unwrap();
    }

    #[tokio::test]
    async fn test_success_runs_pipeline_and_confirms() {
        let dir = tempdir().unwrap();
        write_chunks(dir.path());
        let body = job_body(7, dir.path());

        let mut store = MockProcessedVideoStore::new();
        store
            .expect_is_processed()
            .with(eq(7))
            .times(1)
            .returning(|_| Ok(false));
        store
            .expect_try_claim()
            .with(eq(7))
            .times(1)
            .returning(|_| Ok(true));
        store
            .expect_mark_processed()
            .with(eq(7))
            .times(1)
            .returning(|_| Ok(()));

        let merged = dir.path().join(MERGED_FILE_NAME);
        let dash_dir = dir.path().join(DASH_DIR_NAME);
        let mut transcoder = MockTranscodeExecutor::new();
        let (expect_in, expect_out) = (merged.clone(), dash_dir.clone());
        transcoder
            .expect_run_ffmpeg_dash()
            .withf(move |input, output_dir| {
                input == expect_in.as_path() && output_dir == expect_out.as_path()
            })
            .times(1)
            .returning(|_, _| Ok(success_output()));

        let mut transport = MockJobTransport::new();
        transport
            .expect_ack()
            .with(eq(TAG))
            .times(1)
            .returning(|_| Ok(()));
        let confirmation = body.clone();
        transport
            .expect_publish()
            .withf(move |key, queue, published| {
                key == "finish-conversion"
                    && queue == "video-confirmation_queue"
                    && published == confirmation.as_slice()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let handler = handler(
            transport,
            store,
            MockErrorLog::new(),
            transcoder,
            RetryPolicy::disabled(),
        );
        handler.handle(message(&body)).await;

        assert!(!merged.exists(), "merged artifact must be cleaned up");
        assert!(dash_dir.is_dir());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_acks_without_processing() {
        let dir = tempdir().unwrap();
        let body = job_body(7, dir.path());

        let mut store = MockProcessedVideoStore::new();
        store
            .expect_is_processed()
            .with(eq(7))
            .times(1)
            .returning(|_| Ok(true));

        let mut transport = MockJobTransport::new();
        transport
            .expect_ack()
            .with(eq(TAG))
            .times(1)
            .returning(|_| Ok(()));

        // No transcoder, claim or publish expectations: any such call
        // panics the test.
        let handler = handler(
            transport,
            store,
            MockErrorLog::new(),
            MockTranscodeExecutor::new(),
            RetryPolicy::disabled(),
        );
        handler.handle(message(&body)).await;
    }

    #[tokio::test]
    async fn test_malformed_payload_reports_and_leaves_unacked() {
        let mut log = MockErrorLog::new();
        log.expect_record()
            .withf(|details| details.contains(r#""stage":"deserialize""#))
            .times(1)
            .returning(|_| Ok(()));

        let handler = handler(
            MockJobTransport::new(),
            MockProcessedVideoStore::new(),
            log,
            MockTranscodeExecutor::new(),
            RetryPolicy::disabled(),
        );
        handler.handle(message(b"not a job")).await;
    }

    #[tokio::test]
    async fn test_malformed_payload_dead_letters_under_policy() {
        let mut log = MockErrorLog::new();
        log.expect_record().times(1).returning(|_| Ok(()));

        let mut transport = MockJobTransport::new();
        transport
            .expect_publish()
            .withf(|key, queue, body| {
                key == "dead-letter"
                    && queue == "video_conversion_dead_letter"
                    && body == b"not a job".as_slice()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        transport
            .expect_ack()
            .with(eq(TAG))
            .times(1)
            .returning(|_| Ok(()));

        let handler = handler(
            transport,
            MockProcessedVideoStore::new(),
            log,
            MockTranscodeExecutor::new(),
            RetryPolicy::new(3),
        );
        handler.handle(message(b"not a job")).await;
    }

    #[tokio::test]
    async fn test_transcode_failure_reports_output_and_releases_claim() {
        let dir = tempdir().unwrap();
        write_chunks(dir.path());
        let body = job_body(9, dir.path());

        let mut store = MockProcessedVideoStore::new();
        store.expect_is_processed().times(1).returning(|_| Ok(false));
        store.expect_try_claim().times(1).returning(|_| Ok(true));
        store
            .expect_release_claim()
            .with(eq(9))
            .times(1)
            .returning(|_| Ok(()));

        let mut transcoder = MockTranscodeExecutor::new();
        transcoder
            .expect_run_ffmpeg_dash()
            .times(1)
            .returning(|_, _| Ok(failure_output("Invalid data found when processing input")));

        let mut log = MockErrorLog::new();
        log.expect_record()
            .withf(|details| {
                details.contains(r#""stage":"transcode""#)
                    && details.contains("Invalid data found when processing input")
            })
            .times(1)
            .returning(|_| Ok(()));

        // No ack, no mark_processed, no confirmation.
        let handler = handler(
            MockJobTransport::new(),
            store,
            log,
            transcoder,
            RetryPolicy::disabled(),
        );
        handler.handle(message(&body)).await;
    }

    #[tokio::test]
    async fn test_merge_failure_reports_merge_stage() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");
        let body = job_body(4, &missing);

        let mut store = MockProcessedVideoStore::new();
        store.expect_is_processed().times(1).returning(|_| Ok(false));
        store.expect_try_claim().times(1).returning(|_| Ok(true));
        store.expect_release_claim().times(1).returning(|_| Ok(()));

        let mut log = MockErrorLog::new();
        log.expect_record()
            .withf(|details| details.contains(r#""stage":"merge""#))
            .times(1)
            .returning(|_| Ok(()));

        let handler = handler(
            MockJobTransport::new(),
            store,
            log,
            MockTranscodeExecutor::new(),
            RetryPolicy::disabled(),
        );
        handler.handle(message(&body)).await;
    }

    #[tokio::test]
    async fn test_mark_failure_leaves_unacked_without_confirmation() {
        let dir = tempdir().unwrap();
        write_chunks(dir.path());
        let body = job_body(5, dir.path());

        let mut store = MockProcessedVideoStore::new();
        store.expect_is_processed().times(1).returning(|_| Ok(false));
        store.expect_try_claim().times(1).returning(|_| Ok(true));
        store
            .expect_mark_processed()
            .with(eq(5))
            .times(1)
            .returning(|_| Err("insert failed".into()));
        store.expect_release_claim().times(1).returning(|_| Ok(()));

        let mut transcoder = MockTranscodeExecutor::new();
        transcoder
            .expect_run_ffmpeg_dash()
            .times(1)
            .returning(|_, _| Ok(success_output()));

        let mut log = MockErrorLog::new();
        log.expect_record()
            .withf(|details| details.contains(r#""stage":"persistence""#))
            .times(1)
            .returning(|_| Ok(()));

        // No ack and no publish: the job must come back via redelivery.
        let handler = handler(
            MockJobTransport::new(),
            store,
            log,
            transcoder,
            RetryPolicy::disabled(),
        );
        handler.handle(message(&body)).await;
    }

    #[tokio::test]
    async fn test_claim_conflict_skips_pipeline_without_ack() {
        let dir = tempdir().unwrap();
        let body = job_body(7, dir.path());

        let mut store = MockProcessedVideoStore::new();
        store.expect_is_processed().times(1).returning(|_| Ok(false));
        store.expect_try_claim().times(1).returning(|_| Ok(false));

        let handler = handler(
            MockJobTransport::new(),
            store,
            MockErrorLog::new(),
            MockTranscodeExecutor::new(),
            RetryPolicy::disabled(),
        );
        handler.handle(message(&body)).await;
    }

    #[tokio::test]
    async fn test_idempotency_check_error_still_attempts_the_job() {
        let dir = tempdir().unwrap();
        write_chunks(dir.path());
        let body = job_body(7, dir.path());

        let mut store = MockProcessedVideoStore::new();
        store
            .expect_is_processed()
            .times(1)
            .returning(|_| Err("connection refused".into()));
        store.expect_try_claim().times(1).returning(|_| Ok(true));
        store.expect_mark_processed().times(1).returning(|_| Ok(()));

        let mut transcoder = MockTranscodeExecutor::new();
        transcoder
            .expect_run_ffmpeg_dash()
            .times(1)
            .returning(|_, _| Ok(success_output()));

        let mut transport = MockJobTransport::new();
        transport.expect_ack().times(1).returning(|_| Ok(()));
        transport
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let handler = handler(
            transport,
            store,
            MockErrorLog::new(),
            transcoder,
            RetryPolicy::disabled(),
        );
        handler.handle(message(&body)).await;
    }

    #[tokio::test]
    async fn test_failure_below_attempt_limit_requeues_and_acks() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");
        let body = job_body(4, &missing);

        let mut store = MockProcessedVideoStore::new();
        store.expect_is_processed().times(1).returning(|_| Ok(false));
        store.expect_try_claim().times(1).returning(|_| Ok(true));
        store.expect_release_claim().times(1).returning(|_| Ok(()));

        let mut log = MockErrorLog::new();
        log.expect_record().times(1).returning(|_| Ok(()));

        let mut transport = MockJobTransport::new();
        let requeued = body.clone();
        transport
            .expect_publish_retry()
            .withf(move |key, queue, published, attempts| {
                key == "convertion"
                    && queue == "video_conversion_queue"
                    && published == requeued.as_slice()
                    && *attempts == 1
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        transport
            .expect_ack()
            .with(eq(TAG))
            .times(1)
            .returning(|_| Ok(()));

        let handler = handler(
            transport,
            store,
            log,
            MockTranscodeExecutor::new(),
            RetryPolicy::new(3),
        );
        handler.handle(message(&body)).await;
    }

    #[tokio::test]
    async fn test_failure_at_attempt_limit_dead_letters() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");
        let body = job_body(4, &missing);

        let mut store = MockProcessedVideoStore::new();
        store.expect_is_processed().times(1).returning(|_| Ok(false));
        store.expect_try_claim().times(1).returning(|_| Ok(true));
        store.expect_release_claim().times(1).returning(|_| Ok(()));

        let mut log = MockErrorLog::new();
        log.expect_record().times(1).returning(|_| Ok(()));

        let mut transport = MockJobTransport::new();
        transport
            .expect_publish()
            .withf(|key, queue, _| key == "dead-letter" && queue == "video_conversion_dead_letter")
            .times(1)
            .returning(|_, _, _| Ok(()));
        transport
            .expect_ack()
            .with(eq(TAG))
            .times(1)
            .returning(|_| Ok(()));

        let handler = handler(
            transport,
            store,
            log,
            MockTranscodeExecutor::new(),
            RetryPolicy::new(3),
        );
        handler.handle(message_after(&body, 2)).await;
    }

    #[tokio::test]
    async fn test_confirmation_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        write_chunks(dir.path());
        let body = job_body(7, dir.path());

        let mut store = MockProcessedVideoStore::new();
        store.expect_is_processed().times(1).returning(|_| Ok(false));
        store.expect_try_claim().times(1).returning(|_| Ok(true));
        store.expect_mark_processed().times(1).returning(|_| Ok(()));

        let mut transcoder = MockTranscodeExecutor::new();
        transcoder
            .expect_run_ffmpeg_dash()
            .times(1)
            .returning(|_, _| Ok(success_output()));

        let mut transport = MockJobTransport::new();
        transport.expect_ack().times(1).returning(|_| Ok(()));
        transport
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Err("channel closed".into()));

        // No error log entry: a confirmation failure is logged only.
        let handler = handler(
            transport,
            store,
            MockErrorLog::new(),
            transcoder,
            RetryPolicy::disabled(),
        );
        handler.handle(message(&body)).await;
    }
}
