// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::{anyhow, Result};
use chrono::Utc;
use relcull_domain::{FingerprintPayload, TrackFingerprint};
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::debug;

use crate::repositories::{CacheKey, FingerprintCache};

/// SQLx-backed fingerprint cache
pub struct SqliteFingerprintCache {
    pool: SqlitePool,
}

impl SqliteFingerprintCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl FingerprintCache for SqliteFingerprintCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<TrackFingerprint>> {
        // Paths that are not valid UTF-8 are never cached.
        let Some(path) = key.file_path.to_str() else {
            return Ok(None);
        };
        let row = sqlx::query(
            r#"
            SELECT duration_seconds, payload_kind, payload FROM fingerprint_cache
            WHERE file_path = ? AND tool_signature = ? AND file_size = ? AND modified_ns = ?
            LIMIT 1
            "#,
        )
        .bind(path)
        .bind(&key.tool_signature)
        .bind(size_to_db(key.file_size)?)
        .bind(key.modified_ns)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                debug!(target: "cache", file = %path, "fingerprint cache hit");
                Ok(Some(row_to_track(key, &r)?))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &CacheKey, track: &TrackFingerprint) -> Result<()> {
        let (Some(path), Some(payload)) = (key.file_path.to_str(), track.payload.as_ref()) else {
            return Ok(());
        };
        if track.extraction_error.is_some() {
            return Ok(());
        }

        let kind = match payload {
            FingerprintPayload::Raw(_) => "raw",
            FingerprintPayload::Encoded(_) => "encoded",
        };

        debug!(target: "cache", file = %path, "storing fingerprint");
        sqlx::query(
            r#"
            INSERT INTO fingerprint_cache (
                file_path, tool_signature, file_size, modified_ns,
                duration_seconds, payload_kind, payload, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_path, tool_signature) DO UPDATE SET
                file_size = excluded.file_size,
                modified_ns = excluded.modified_ns,
                duration_seconds = excluded.duration_seconds,
                payload_kind = excluded.payload_kind,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(path)
        .bind(&key.tool_signature)
        .bind(size_to_db(key.file_size)?)
        .bind(key.modified_ns)
        .bind(track.duration_seconds)
        .bind(kind)
        .bind(payload.to_token_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn entry_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM fingerprint_cache")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n)?)
    }

    async fn purge_other_signatures(&self, keep_signature: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM fingerprint_cache WHERE tool_signature != ?")
            .bind(keep_signature)
            .execute(&self.pool)
            .await?;
        debug!(target: "cache", removed = result.rows_affected(), "purged stale cache entries");
        Ok(result.rows_affected())
    }
}

fn size_to_db(size: u64) -> Result<i64> {
    i64::try_from(size).map_err(|_| anyhow!("file size {} does not fit the cache schema", size))
}

fn row_to_track(key: &CacheKey, row: &sqlx::sqlite::SqliteRow) -> Result<TrackFingerprint> {
    let duration_seconds: f64 = row.try_get("duration_seconds")?;
    let kind: String = row.try_get("payload_kind")?;
    let payload: String = row.try_get("payload")?;

    let payload = match kind.as_str() {
        "raw" => match FingerprintPayload::parse(&payload)? {
            raw @ FingerprintPayload::Raw(_) => raw,
            FingerprintPayload::Encoded(_) => {
                return Err(anyhow!("cached raw payload for {} is not numeric", key.file_path.display()))
            }
        },
        "encoded" => FingerprintPayload::Encoded(payload),
        other => return Err(anyhow!("unknown payload kind '{}'", other)),
    };

    Ok(TrackFingerprint::new(
        key.file_path.clone(),
        duration_seconds,
        payload,
    ))
}
