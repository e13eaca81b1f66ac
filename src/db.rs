use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create all tables. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corpus (
            path TEXT NOT NULL,
            ext TEXT NOT NULL,
            ok INTEGER NOT NULL,
            text TEXT NOT NULL,
            text_original TEXT,
            meta TEXT NOT NULL,
            size INTEGER NOT NULL,
            mtime INTEGER NOT NULL,
            ctime INTEGER NOT NULL,
            owner TEXT NOT NULL,
            doc_hash TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            PRIMARY KEY (path, doc_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_corpus_path ON corpus(path)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_cache (
            path TEXT PRIMARY KEY,
            doc_hash TEXT NOT NULL,
            chunk_count INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DbConfig, IndexConfig};
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> Config {
        Config {
            db: DbConfig {
                path: tmp.path().join("corpus.sqlite"),
            },
            index: IndexConfig {
                dir: tmp.path().join("index"),
            },
            chunking: Default::default(),
            retrieval: Default::default(),
            rerank: Default::default(),
            embedding: Default::default(),
            watch: Default::default(),
            cache: Default::default(),
            policy: Default::default(),
        }
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = connect(&test_config(&tmp)).await.unwrap();
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();
        pool.close().await;
    }
}
