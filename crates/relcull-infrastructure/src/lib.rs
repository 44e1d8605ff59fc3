// SPDX-License-Identifier: GPL-3.0-or-later
pub mod repositories;
pub mod sqlite_adapters;

use anyhow::Result;
use relcull_config::CacheConfig;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use tracing::info;

pub use repositories::{CacheKey, FingerprintCache};
pub use sqlite_adapters::SqliteFingerprintCache;

/// Build the SQLite connection URL for a cache file, creating its directory.
fn cache_url(path: &Path) -> Result<String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let absolute_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    // SQLite accepts forward slashes on every platform
    let path_str = absolute_path.to_string_lossy().replace('\\', "/");
    Ok(format!("sqlite://{}?mode=rwc", path_str))
}

/// Open the fingerprint cache described by `config` and run migrations.
pub async fn open_cache(config: &CacheConfig) -> Result<SqliteFingerprintCache> {
    let db_url = cache_url(&config.path)?;
    info!(target: "infrastructure", db_url = %db_url, "opening fingerprint cache");
    connect(&db_url).await
}

/// Cache that lives only as long as the returned value.
pub async fn open_memory_cache() -> Result<SqliteFingerprintCache> {
    connect("sqlite::memory:").await
}

async fn connect(db_url: &str) -> Result<SqliteFingerprintCache> {
    // A single connection keeps in-memory databases shared and writes serialized.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(db_url)
        .await?;

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!(target: "infrastructure", "fingerprint cache ready");
    Ok(SqliteFingerprintCache::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_url_is_absolute_and_creatable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("fingerprints.db");
        let url = cache_url(&path).expect("url");
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with("?mode=rwc"));
        assert!(dir.path().join("nested").is_dir());
    }

    #[tokio::test]
    async fn open_cache_creates_database_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CacheConfig {
            enabled: true,
            path: dir.path().join("cache").join("fingerprints.db"),
        };
        let cache = open_cache(&config).await.expect("open cache");
        assert_eq!(cache.entry_count().await.expect("count"), 0);
        assert!(config.path.exists());
    }
}
