use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// Per-address upload throttle backed by the `upload_attempts` table.
///
/// Attempts are counted on receipt: a request that passes the limit check consumes
/// a slot even if it later fails validation.
#[derive(Clone)]
pub struct RateLimiter {
    pool: SqlitePool,
    limit: i64,
    window_secs: i64,
}

impl RateLimiter {
    pub async fn new(pool: SqlitePool, limit: i64, window_secs: i64) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upload_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip_address TEXT NOT NULL,
                attempt_timestamp INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create upload_attempts table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_upload_attempts_ip
            ON upload_attempts(ip_address, attempt_timestamp)
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create index")?;

        Ok(Self {
            pool,
            limit,
            window_secs,
        })
    }

    /// Returns `false` when the address has used up its window; nothing is recorded then.
    pub async fn check_and_record(&self, client_address: &str) -> bool {
        self.check_and_record_at(client_address, chrono::Utc::now().timestamp())
            .await
    }

    pub(crate) async fn check_and_record_at(&self, client_address: &str, now: i64) -> bool {
        let cutoff = now - self.window_secs;

        if let Err(e) = self.purge_before(cutoff).await {
            tracing::warn!("Rate limit cleanup failed: {:#}", e);
        }

        let attempts = match self.count_since(client_address, cutoff).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("Rate limit check failed for {}: {:#}", client_address, e);
                0
            }
        };

        if attempts >= self.limit {
            tracing::warn!(
                "Upload rate limit reached for {} ({} attempts in {}s)",
                client_address,
                attempts,
                self.window_secs
            );
            return false;
        }

        if let Err(e) = self.record(client_address, now).await {
            tracing::error!("Failed to record upload attempt for {}: {:#}", client_address, e);
        }

        true
    }

    async fn purge_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM upload_attempts WHERE attempt_timestamp <= ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to purge expired upload attempts")?;

        Ok(result.rows_affected())
    }

    async fn count_since(&self, client_address: &str, cutoff: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM upload_attempts WHERE ip_address = ? AND attempt_timestamp > ?",
        )
        .bind(client_address)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count upload attempts")
    }

    async fn record(&self, client_address: &str, now: i64) -> Result<()> {
        sqlx::query("INSERT INTO upload_attempts (ip_address, attempt_timestamp) VALUES (?, ?)")
            .bind(client_address)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("Failed to insert upload attempt")?;

        Ok(())
    }

    /// Number of stored attempts for an address, expired or not.
    pub async fn recorded_attempts(&self, client_address: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM upload_attempts WHERE ip_address = ?")
            .bind(client_address)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count upload attempts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn limiter(dir: &tempfile::TempDir, limit: i64) -> RateLimiter {
        let pool = crate::db::connect(dir.path().join("test.db")).await.unwrap();
        RateLimiter::new(pool, limit, 3600).await.unwrap()
    }

    #[tokio::test]
    async fn eleventh_attempt_is_rejected_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = limiter(&dir, 10).await;
        let now = 1_700_000_000;

        for i in 0..10 {
            assert!(limiter.check_and_record_at("10.0.0.1", now + i).await);
        }
        assert_eq!(limiter.recorded_attempts("10.0.0.1").await.unwrap(), 10);

        assert!(!limiter.check_and_record_at("10.0.0.1", now + 20).await);
        assert_eq!(limiter.recorded_attempts("10.0.0.1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn addresses_are_counted_separately() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = limiter(&dir, 1).await;
        let now = 1_700_000_000;

        assert!(limiter.check_and_record_at("10.0.0.1", now).await);
        assert!(!limiter.check_and_record_at("10.0.0.1", now).await);
        assert!(limiter.check_and_record_at("10.0.0.2", now).await);
    }

    #[tokio::test]
    async fn expired_attempts_are_purged() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = limiter(&dir, 2).await;
        let now = 1_700_000_000;

        assert!(limiter.check_and_record_at("10.0.0.1", now).await);
        assert!(limiter.check_and_record_at("10.0.0.1", now + 1).await);
        assert!(!limiter.check_and_record_at("10.0.0.1", now + 2).await);

        // Both earlier attempts fall out of the window an hour later.
        assert!(limiter.check_and_record_at("10.0.0.1", now + 3601).await);
        assert_eq!(limiter.recorded_attempts("10.0.0.1").await.unwrap(), 1);
    }
}
