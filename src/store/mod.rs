//! The target database as seen by the engine.
//!
//! A [`Store`] executes migration SQL and keeps the applied-state ledger. The
//! engine only talks to this trait, so tests can swap in an in-memory fake.

pub mod postgres;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::Result;

pub use postgres::{MigrationLock, PgStore};

/// Outcome recorded for a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Success,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Success => "success",
            RecordStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "success" => Ok(RecordStatus::Success),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(format!("unknown migration status {:?}", other)),
        }
    }
}

/// One row of the ledger table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedRecord {
    pub version: i64,
    pub name: String,
    pub applied_at: NaiveDateTime,
    pub checksum: String,
    pub execution_time_ms: Option<i32>,
    pub status: RecordStatus,
    pub error_message: Option<String>,
}

/// Versions recorded with `status = success`.
pub type AppliedSet = BTreeMap<i64, AppliedRecord>;

/// Target database plus applied-state ledger.
///
/// Ledger writes and SQL execution return the raw [`sqlx::Error`] so the
/// engine can attach the failing version.
#[allow(async_fn_in_trait)]
pub trait Store {
    /// Create the ledger table and its indexes if absent.
    async fn ensure_schema(&mut self) -> Result<()>;

    /// Every ledger row, successful or failed, ordered by version.
    async fn records(&mut self) -> Result<Vec<AppliedRecord>>;

    /// Successful rows keyed by version.
    async fn applied_set(&mut self) -> Result<AppliedSet>;

    /// Run a migration body as one batch, outside any explicit transaction.
    async fn execute(&mut self, sql: &str) -> std::result::Result<(), sqlx::Error>;

    async fn record_success(
        &mut self,
        version: i64,
        name: &str,
        checksum: &str,
        duration_ms: i64,
    ) -> std::result::Result<(), sqlx::Error>;

    async fn record_failure(
        &mut self,
        version: i64,
        name: &str,
        checksum: &str,
        duration_ms: i64,
        error: &str,
    ) -> std::result::Result<(), sqlx::Error>;

    /// Delete the ledger rows of a version.
    async fn forget(&mut self, version: i64) -> std::result::Result<(), sqlx::Error>;

    /// Run `down_sql` and [`Store::forget`] the version in one transaction.
    async fn rollback(&mut self, version: i64, down_sql: &str)
    -> std::result::Result<(), sqlx::Error>;

    /// Take the migration lock. Fails with `LockHeld` if another run owns it.
    async fn lock(&mut self) -> Result<()>;

    async fn unlock(&mut self) -> Result<()>;
}

/// Clamp a duration to the ledger's `INTEGER` column.
pub(crate) fn duration_column(duration_ms: i64) -> i32 {
    i32::try_from(duration_ms.max(0)).unwrap_or(i32::MAX)
}
