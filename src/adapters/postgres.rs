//! Postgres-backed idempotency store and error log.

use crate::ports::repository::{ErrorLog, ProcessedVideoStore};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::error::Error;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, verify the connection and apply pending migrations.
    pub async fn connect(url: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ProcessedVideoStore for PgStore {
    async fn is_processed(&self, video_id: i64) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let processed: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM processed_videos WHERE video_id = $1 AND status = 'success')",
        )
        .bind(video_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(processed)
    }

    async fn try_claim(&self, video_id: i64) -> Result<bool, Box<dyn Error + Send + Sync>> {
        // Conflict means another delivery holds the claim or the video
        // already completed; either way this delivery must not run.
        let result = sqlx::query(
            "INSERT INTO processed_videos (video_id, status) VALUES ($1, 'in_progress')
             ON CONFLICT (video_id) DO NOTHING",
        )
        .bind(video_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(&self, video_id: i64) -> Result<(), Box<dyn Error + Send + Sync>> {
        let result = sqlx::query(
            "UPDATE processed_videos SET status = 'success', processed_at = $2
             WHERE video_id = $1 AND status = 'in_progress'",
        )
        .bind(video_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(format!("no in-progress claim to upgrade for video {video_id}").into());
        }
        Ok(())
    }

    async fn release_claim(&self, video_id: i64) -> Result<(), Box<dyn Error + Send + Sync>> {
        sqlx::query("DELETE FROM processed_videos WHERE video_id = $1 AND status = 'in_progress'")
            .bind(video_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl ErrorLog for PgStore {
    async fn record(&self, details: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        sqlx::query("INSERT INTO process_errors_log (error_details, created_at) VALUES ($1, $2)")
            .bind(details)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
