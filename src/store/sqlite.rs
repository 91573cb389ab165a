//! SQLite-backed document store.
//!
//! Every document lives in one `documents` table keyed by
//! `(collection, id)` with a JSON body. A batch runs inside a single
//! transaction; documents that did not exist when the batch was staged are
//! written with a plain `INSERT`, so a concurrent creator makes the whole
//! transaction fail instead of silently overwriting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tracing::{debug, info};

use crate::models::StoreError;
use crate::store::{
    apply_batch, Collection, DocKey, DocumentStore, MonotonicClock, StoreResult, WriteBatch,
};

const MIGRATION_V1: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (collection, id)
);
"#;

#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    clock: MonotonicClock,
}

impl SqliteStore {
    /// Open or create the database at `url`, e.g. `sqlite://rewards.db`.
    pub async fn open(url: &str, max_connections: u32) -> StoreResult<Self> {
        info!("Opening SQLite document store at {}", url);

        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool, clock: MonotonicClock::new() })
    }

    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // A second connection would see a different empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool, clock: MonotonicClock::new() })
    }

    async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
        debug!("Running SQLite migrations");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn already_exists(collection: Collection, id: &str) -> StoreError {
        StoreError::AlreadyExists {
            collection: collection.as_str().to_string(),
            id: id.to_string(),
        }
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
            .bind(collection.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.try_get("body")?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, collection: Collection) -> StoreResult<Vec<(String, Value)>> {
        let rows = sqlx::query("SELECT id, body FROM documents WHERE collection = ? ORDER BY id")
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> StoreResult<(String, Value)> {
                let id: String = row.try_get("id")?;
                let body: String = row.try_get("body")?;
                Ok((id, serde_json::from_str(&body)?))
            })
            .collect()
    }

    async fn set(&self, collection: Collection, id: &str, doc: Value) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, body, updated_at)
            VALUES (?, ?, ?, strftime('%s', 'now'))
            ON CONFLICT(collection, id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(serde_json::to_string(&doc)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create(&self, collection: Collection, id: &str, doc: Value) -> StoreResult<()> {
        let insert = "INSERT OR IGNORE INTO documents (collection, id, body) VALUES (?, ?, ?)";
        let result = sqlx::query(insert)
            .bind(collection.as_str())
            .bind(id)
            .bind(serde_json::to_string(&doc)?)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Self::already_exists(collection, id));
        }
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let mut staged: HashMap<DocKey, Option<Value>> = HashMap::new();
        let mut absent: HashSet<DocKey> = HashSet::new();
        for key in batch.keys() {
            let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
                .bind(key.0.as_str())
                .bind(&key.1)
                .fetch_optional(&mut *tx)
                .await?;

            let current = match row {
                Some(row) => {
                    let body: String = row.try_get("body")?;
                    Some(serde_json::from_str::<Value>(&body)?)
                }
                None => {
                    absent.insert(key.clone());
                    None
                }
            };
            staged.insert(key, current);
        }

        apply_batch(&batch, &mut staged)?;

        for ((collection, id), doc) in staged {
            let existed = !absent.contains(&(collection, id.clone()));
            match (doc, existed) {
                (Some(doc), false) => {
                    sqlx::query("INSERT INTO documents (collection, id, body) VALUES (?, ?, ?)")
                        .bind(collection.as_str())
                        .bind(&id)
                        .bind(serde_json::to_string(&doc)?)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| {
                            if is_unique_violation(&e) {
                                Self::already_exists(collection, &id)
                            } else {
                                StoreError::Database(e)
                            }
                        })?;
                }
                (Some(doc), true) => {
                    sqlx::query(
                        "UPDATE documents SET body = ?, updated_at = strftime('%s', 'now') \
                         WHERE collection = ? AND id = ?",
                    )
                    .bind(serde_json::to_string(&doc)?)
                    .bind(collection.as_str())
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                }
                (None, true) => {
                    sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                        .bind(collection.as_str())
                        .bind(&id)
                        .execute(&mut *tx)
                        .await?;
                }
                (None, false) => {}
            }
        }

        tx.commit().await?;
        debug!("Committed batch of {} operations", batch.len());
        Ok(())
    }

    async fn server_time(&self) -> StoreResult<DateTime<Utc>> {
        self.clock.now()
    }
}
