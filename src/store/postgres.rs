//! PostgreSQL (and CockroachDB) implementation of [`Store`].

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Executor, Postgres, Row};

use super::{duration_column, AppliedRecord, AppliedSet, RecordStatus, Store};
use crate::config::DEFAULT_TABLE;
use crate::error::{MigrateError, Result};

/// Advisory lock key shared by every migrator run ("dbmigrat").
pub const LOCK_KEY: i64 = 0x6462_6d69_6772_6174;

/// Ledger and executor backed by a connection pool.
pub struct PgStore {
    pool: PgPool,
    table: String,
    lock: Option<MigrationLock>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
            lock: None,
        }
    }

    /// Use a different ledger table. The name must already be a valid identifier.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn schema_ddl(&self) -> String {
        let t = &self.table;
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMP NOT NULL DEFAULT now(),
                checksum VARCHAR(64) NOT NULL,
                execution_time_ms INTEGER,
                status VARCHAR(20) DEFAULT 'success',
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_{t}_applied_at ON {t} (applied_at DESC);

            CREATE INDEX IF NOT EXISTS idx_{t}_status ON {t} (status);
            "#
        )
    }

    fn select_sql(&self, filter: &str) -> String {
        format!(
            "SELECT version, name, applied_at, checksum, execution_time_ms, status, error_message \
             FROM {} {} ORDER BY version",
            self.table, filter
        )
    }

    fn delete_sql(&self) -> String {
        format!("DELETE FROM {} WHERE version = $1", self.table)
    }

    /// Delete a version's ledger rows through `executor`, which may be a
    /// transaction.
    async fn delete_version<'e, E>(
        &self,
        executor: E,
        version: i64,
    ) -> std::result::Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = self.delete_sql();
        sqlx::query(&sql).bind(version).execute(executor).await?;
        Ok(())
    }

    /// Insert one ledger row, replacing an earlier failed attempt of the same version.
    async fn insert_record(
        &self,
        version: i64,
        name: &str,
        checksum: &str,
        duration_ms: i64,
        status: RecordStatus,
        error: Option<&str>,
    ) -> std::result::Result<(), sqlx::Error> {
        let clear_failed = format!(
            "DELETE FROM {} WHERE version = $1 AND status = 'failed'",
            self.table
        );
        let insert = format!(
            "INSERT INTO {} (version, name, applied_at, checksum, execution_time_ms, status, error_message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.table
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&clear_failed)
            .bind(version)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&insert)
            .bind(version)
            .bind(name)
            .bind(chrono::Utc::now().naive_utc())
            .bind(checksum)
            .bind(duration_column(duration_ms))
            .bind(status.as_str())
            .bind(error)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }
}

fn record_from_row(row: &PgRow) -> Result<AppliedRecord> {
    let status: Option<String> = row.try_get("status")?;
    let status = match status {
        Some(s) => s
            .parse()
            .map_err(|e: String| MigrateError::Database(sqlx::Error::Decode(e.into())))?,
        None => RecordStatus::Success,
    };

    Ok(AppliedRecord {
        version: row.try_get("version")?,
        name: row.try_get("name")?,
        applied_at: row.try_get("applied_at")?,
        checksum: row.try_get("checksum")?,
        execution_time_ms: row.try_get("execution_time_ms")?,
        status,
        error_message: row.try_get("error_message")?,
    })
}

impl Store for PgStore {
    async fn ensure_schema(&mut self) -> Result<()> {
        self.pool.execute(self.schema_ddl().as_str()).await?;
        tracing::debug!(table = %self.table, "ledger table ready");
        Ok(())
    }

    async fn records(&mut self) -> Result<Vec<AppliedRecord>> {
        let sql = self.select_sql("");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn applied_set(&mut self) -> Result<AppliedSet> {
        let sql = self.select_sql("WHERE status = 'success'");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| record_from_row(row).map(|r| (r.version, r)))
            .collect()
    }

    async fn execute(&mut self, sql: &str) -> std::result::Result<(), sqlx::Error> {
        // No bind parameters: sent as a simple query, so multi-statement bodies work.
        self.pool.execute(sql).await?;
        Ok(())
    }

    async fn record_success(
        &mut self,
        version: i64,
        name: &str,
        checksum: &str,
        duration_ms: i64,
    ) -> std::result::Result<(), sqlx::Error> {
        self.insert_record(version, name, checksum, duration_ms, RecordStatus::Success, None)
            .await
    }

    async fn record_failure(
        &mut self,
        version: i64,
        name: &str,
        checksum: &str,
        duration_ms: i64,
        error: &str,
    ) -> std::result::Result<(), sqlx::Error> {
        self.insert_record(
            version,
            name,
            checksum,
            duration_ms,
            RecordStatus::Failed,
            Some(error),
        )
        .await
    }

    async fn forget(&mut self, version: i64) -> std::result::Result<(), sqlx::Error> {
        self.delete_version(&self.pool, version).await
    }

    async fn rollback(
        &mut self,
        version: i64,
        down_sql: &str,
    ) -> std::result::Result<(), sqlx::Error> {
        // Dropping `tx` on an early return rolls the transaction back.
        let mut tx = self.pool.begin().await?;
        (&mut *tx).execute(down_sql).await?;
        self.delete_version(&mut *tx, version).await?;
        tx.commit().await
    }

    async fn lock(&mut self) -> Result<()> {
        if self.lock.is_none() {
            self.lock = Some(MigrationLock::acquire(&self.pool, LOCK_KEY).await?);
        }
        Ok(())
    }

    async fn unlock(&mut self) -> Result<()> {
        match self.lock.take() {
            Some(lock) => lock.release().await,
            None => Ok(()),
        }
    }
}

/// Session-level advisory lock pinned to one pooled connection.
///
/// If the guard is dropped without [`MigrationLock::release`], the connection
/// is detached from the pool and closed, which ends the session and frees the
/// lock on the server.
pub struct MigrationLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl MigrationLock {
    pub async fn acquire(pool: &PgPool, key: i64) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if !locked {
            return Err(MigrateError::LockHeld);
        }
        tracing::debug!(key, "acquired migration lock");
        Ok(Self {
            conn: Some(conn),
            key,
        })
    }

    pub async fn release(mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await;

        match unlocked {
            Ok(true) => {
                tracing::debug!(key = self.key, "released migration lock");
                Ok(())
            }
            Ok(false) => {
                tracing::warn!(key = self.key, "migration lock was not held at release");
                Ok(())
            }
            Err(e) => {
                drop(conn.detach());
                Err(e.into())
            }
        }
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!(key = self.key, "migration lock dropped without release; closing its connection");
            drop(conn.detach());
        }
    }
}
