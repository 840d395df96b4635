use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{info, warn};

use super::{RunKind, RunRecord, RunStore};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed run history
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// In-memory database; a single connection so every query sees the
    /// same schema.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            }
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }
}

#[async_trait]
impl RunStore for SqliteStorage {
    async fn record_run(&self, record: &RunRecord) -> StorageResult<()> {
        let summary = serde_json::to_string(&record.summary).map_err(|e| StorageError::Query {
            message: format!("Failed to serialize run summary: {}", e),
        })?;

        sqlx::query(
            r#"
            INSERT INTO runs (id, kind, session_id, status, summary, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.kind.as_str())
        .bind(&record.session_id)
        .bind(&record.status)
        .bind(&summary)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!(
            id = %record.id,
            kind = %record.kind,
            session_id = %record.session_id,
            status = %record.status,
            "Run recorded"
        );
        Ok(())
    }

    async fn get_run(&self, id: &str) -> StorageResult<Option<RunRecord>> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT id, kind, session_id, status, summary, created_at
            FROM runs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn list_runs(&self, kind: Option<RunKind>, limit: u32) -> StorageResult<Vec<RunRecord>> {
        let rows: Vec<RunRow> = match kind {
            Some(kind) => {
                sqlx::query_as(
                    r#"
                    SELECT id, kind, session_id, status, summary, created_at
                    FROM runs
                    WHERE kind = ?
                    ORDER BY created_at DESC
                    LIMIT ?
                    "#,
                )
                .bind(kind.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, kind, session_id, status, summary, created_at
                    FROM runs
                    ORDER BY created_at DESC
                    LIMIT ?
                    "#,
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(RunRecord::try_from).collect()
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    kind: String,
    session_id: String,
    status: String,
    summary: String,
    created_at: String,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = StorageError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        use chrono::DateTime;

        let kind = RunKind::from_str(&row.kind).map_err(|message| StorageError::Query { message })?;
        let summary = serde_json::from_str(&row.summary).unwrap_or_else(|e| {
            warn!(id = %row.id, error = %e, "Unreadable run summary");
            serde_json::Value::Null
        });

        Ok(Self {
            id: row.id,
            kind,
            session_id: row.session_id,
            status: row.status,
            summary,
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now()),
        })
    }
}
