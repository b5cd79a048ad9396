//! Shared fixtures: an in-memory ledger and migration directory helpers.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use dbmigrate::{
    AppliedRecord, AppliedSet, MigrateError, Migrator, MigratorOptions, RecordStatus, Repository,
    Store,
};

/// Every interaction the engine had with the store, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    EnsureSchema,
    Execute(String),
    RecordSuccess(i64),
    RecordFailure(i64),
    Forget(i64),
    Rollback(i64),
    Lock,
    Unlock,
}

/// Ledger kept in a map. SQL containing any `failing` fragment errors.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub records: BTreeMap<i64, AppliedRecord>,
    pub calls: Vec<Call>,
    pub failing: Vec<String>,
    /// Another process owns the lock.
    pub contended: bool,
    pub locked: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(fragment: &str) -> Self {
        Self {
            failing: vec![fragment.to_string()],
            ..Self::default()
        }
    }

    pub fn success_versions(&self) -> Vec<i64> {
        self.records
            .values()
            .filter(|r| r.status == RecordStatus::Success)
            .map(|r| r.version)
            .collect()
    }

    /// SQL bodies passed to `execute` or `rollback`, in order.
    pub fn executed(&self) -> Vec<Call> {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Execute(_) | Call::Rollback(_)))
            .cloned()
            .collect()
    }

    pub fn mutations(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::Execute(_)
                        | Call::RecordSuccess(_)
                        | Call::RecordFailure(_)
                        | Call::Forget(_)
                        | Call::Rollback(_)
                )
            })
            .count()
    }

    fn check(&self, sql: &str) -> Result<(), sqlx::Error> {
        match self.failing.iter().find(|f| sql.contains(f.as_str())) {
            Some(f) => Err(sqlx::Error::Protocol(format!("syntax error at or near \"{}\"", f))),
            None => Ok(()),
        }
    }

    fn insert(
        &mut self,
        version: i64,
        name: &str,
        checksum: &str,
        duration_ms: i64,
        status: RecordStatus,
        error: Option<&str>,
    ) {
        self.records.insert(
            version,
            AppliedRecord {
                version,
                name: name.to_string(),
                applied_at: chrono::Utc::now().naive_utc(),
                checksum: checksum.to_string(),
                execution_time_ms: Some(duration_ms as i32),
                status,
                error_message: error.map(str::to_string),
            },
        );
    }
}

impl Store for MemoryStore {
    async fn ensure_schema(&mut self) -> dbmigrate::Result<()> {
        self.calls.push(Call::EnsureSchema);
        Ok(())
    }

    async fn records(&mut self) -> dbmigrate::Result<Vec<AppliedRecord>> {
        Ok(self.records.values().cloned().collect())
    }

    async fn applied_set(&mut self) -> dbmigrate::Result<AppliedSet> {
        Ok(self
            .records
            .iter()
            .filter(|(_, r)| r.status == RecordStatus::Success)
            .map(|(v, r)| (*v, r.clone()))
            .collect())
    }

    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        self.calls.push(Call::Execute(sql.to_string()));
        self.check(sql)
    }

    async fn record_success(
        &mut self,
        version: i64,
        name: &str,
        checksum: &str,
        duration_ms: i64,
    ) -> Result<(), sqlx::Error> {
        self.calls.push(Call::RecordSuccess(version));
        self.insert(version, name, checksum, duration_ms, RecordStatus::Success, None);
        Ok(())
    }

    async fn record_failure(
        &mut self,
        version: i64,
        name: &str,
        checksum: &str,
        duration_ms: i64,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        self.calls.push(Call::RecordFailure(version));
        self.insert(version, name, checksum, duration_ms, RecordStatus::Failed, Some(error));
        Ok(())
    }

    async fn forget(&mut self, version: i64) -> Result<(), sqlx::Error> {
        self.calls.push(Call::Forget(version));
        self.records.remove(&version);
        Ok(())
    }

    async fn rollback(&mut self, version: i64, down_sql: &str) -> Result<(), sqlx::Error> {
        self.calls.push(Call::Rollback(version));
        self.check(down_sql)?;
        self.records.remove(&version);
        Ok(())
    }

    async fn lock(&mut self) -> dbmigrate::Result<()> {
        self.calls.push(Call::Lock);
        if self.contended || self.locked {
            return Err(MigrateError::LockHeld);
        }
        self.locked = true;
        Ok(())
    }

    async fn unlock(&mut self) -> dbmigrate::Result<()> {
        self.calls.push(Call::Unlock);
        self.locked = false;
        Ok(())
    }
}

pub fn write_migration(dir: &Path, file_name: &str, content: &str) {
    std::fs::write(dir.join(file_name), content).unwrap();
}

/// Three migrations, each with a down section.
pub fn write_users_set(dir: &Path) {
    write_migration(
        dir,
        "00001_create_users.sql",
        "CREATE TABLE users (id BIGSERIAL PRIMARY KEY);\n-- DOWN\nDROP TABLE users;\n",
    );
    write_migration(
        dir,
        "00002_add_email.sql",
        "ALTER TABLE users ADD COLUMN email TEXT;\n-- DOWN\nALTER TABLE users DROP COLUMN email;\n",
    );
    write_migration(
        dir,
        "00003_index_email.sql",
        "CREATE INDEX idx_users_email ON users (email);\n-- DOWN\nDROP INDEX idx_users_email;\n",
    );
}

pub async fn migrator(dir: &Path, store: MemoryStore) -> Migrator<MemoryStore> {
    migrator_with(dir, store, MigratorOptions::default()).await
}

pub async fn migrator_with(
    dir: &Path,
    store: MemoryStore,
    options: MigratorOptions,
) -> Migrator<MemoryStore> {
    let repository = Repository::load(dir).unwrap();
    Migrator::new(store, repository, options).await.unwrap()
}
