//! Migration engine.
//!
//! Per version the ledger moves through
//! `Pending -> Applied(success) -> absent` (rolled back), with
//! `Pending -> Applied(failed)` when the up-body errors. A failed version is
//! not part of the applied set, so the next `up` attempts it again.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::{MigrateError, Result};
use crate::migration::{is_blank_sql, Migration, Repository};
use crate::store::{AppliedRecord, AppliedSet, RecordStatus, Store};

/// Keywords at least one of which an up section is expected to contain.
pub const SQL_KEYWORDS: &[&str] = &["CREATE", "ALTER", "INSERT", "UPDATE", "DELETE", "DROP"];

#[derive(Debug, Clone, Copy)]
pub struct MigratorOptions {
    /// Hold the store lock while `up`, `down` or `reset` mutate the database.
    pub lock: bool,
    /// Fail `up` when an applied file no longer matches its recorded checksum.
    pub verify_checksums: bool,
}

impl Default for MigratorOptions {
    fn default() -> Self {
        Self {
            lock: true,
            verify_checksums: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Pending,
    Applied,
    Failed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MigrationState::Pending => "pending",
            MigrationState::Applied => "applied",
            MigrationState::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub version: i64,
    pub name: String,
    pub state: MigrationState,
    pub applied_at: Option<NaiveDateTime>,
    pub execution_time_ms: Option<i32>,
    pub error_message: Option<String>,
    /// Applied, but the file's checksum differs from the recorded one.
    pub drifted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    /// One entry per migration file, ascending by version.
    pub entries: Vec<StatusEntry>,
    /// Ledger rows with no matching file.
    pub missing: Vec<AppliedRecord>,
}

impl StatusReport {
    fn count(&self, state: MigrationState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn applied(&self) -> usize {
        self.count(MigrationState::Applied)
    }

    pub fn failed(&self) -> usize {
        self.count(MigrationState::Failed)
    }

    pub fn pending(&self) -> usize {
        self.count(MigrationState::Pending)
    }

    pub fn entry(&self, version: i64) -> Option<&StatusEntry> {
        self.entries.iter().find(|e| e.version == version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// A migration processed (or, in a dry run, planned) by `up` or `down`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub version: i64,
    pub name: String,
    pub sql: String,
    /// `None` for dry runs.
    pub elapsed_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub direction: Direction,
    pub dry_run: bool,
    pub steps: Vec<Step>,
}

impl RunReport {
    fn new(direction: Direction, dry_run: bool) -> Self {
        Self {
            direction,
            dry_run,
            steps: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn versions(&self) -> Vec<i64> {
        self.steps.iter().map(|s| s.version).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationWarning {
    /// The up section contains none of [`SQL_KEYWORDS`].
    NoSqlKeyword { version: i64, name: String },
    NoDownSection { version: i64, name: String },
    /// Applied, but the file changed since.
    ChecksumDrift { version: i64, name: String },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationWarning::NoSqlKeyword { version, name } => {
                write!(f, "migration {} ({}) may not contain valid SQL", version, name)
            }
            ValidationWarning::NoDownSection { version, name } => {
                write!(f, "migration {} ({}) has no down section and cannot be rolled back", version, name)
            }
            ValidationWarning::ChecksumDrift { version, name } => {
                write!(f, "migration {} ({}) changed after it was applied", version, name)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub checked: usize,
    pub warnings: Vec<ValidationWarning>,
}

/// Check migration content without touching a database.
///
/// An empty up section is an error; everything else is advisory.
pub fn validate(migrations: &[Migration]) -> Result<ValidationReport> {
    let mut report = ValidationReport {
        checked: migrations.len(),
        warnings: Vec::new(),
    };

    for m in migrations {
        if is_blank_sql(&m.up) {
            return Err(MigrateError::Validation {
                version: m.version,
                name: m.name.clone(),
                reason: "up section is empty".to_string(),
            });
        }
        if !contains_sql_keyword(&m.up) {
            report.warnings.push(ValidationWarning::NoSqlKeyword {
                version: m.version,
                name: m.name.clone(),
            });
        }
        if !m.has_down() {
            report.warnings.push(ValidationWarning::NoDownSection {
                version: m.version,
                name: m.name.clone(),
            });
        }
    }

    for warning in &report.warnings {
        tracing::warn!("{}", warning);
    }
    Ok(report)
}

fn contains_sql_keyword(sql: &str) -> bool {
    sql.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("--"))
        .map(str::to_uppercase)
        .any(|line| SQL_KEYWORDS.iter().any(|kw| line.contains(kw)))
}

/// Orchestrates status, up, down, reset, create and validate.
pub struct Migrator<S> {
    store: S,
    repository: Repository,
    options: MigratorOptions,
}

impl<S: Store> Migrator<S> {
    /// Wrap a store and a loaded repository, making sure the ledger table exists.
    pub async fn new(mut store: S, repository: Repository, options: MigratorOptions) -> Result<Self> {
        store.ensure_schema().await?;
        Ok(Self {
            store,
            repository,
            options,
        })
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Report the state of every migration file and of orphaned ledger rows.
    pub async fn status(&mut self) -> Result<StatusReport> {
        let records = self.store.records().await?;
        let mut report = StatusReport::default();

        for m in self.repository.migrations() {
            let record = records.iter().find(|r| r.version == m.version);
            let entry = match record {
                Some(r) => StatusEntry {
                    version: m.version,
                    name: m.name.clone(),
                    state: match r.status {
                        RecordStatus::Success => MigrationState::Applied,
                        RecordStatus::Failed => MigrationState::Failed,
                    },
                    applied_at: Some(r.applied_at),
                    execution_time_ms: r.execution_time_ms,
                    error_message: r.error_message.clone(),
                    drifted: r.status == RecordStatus::Success && r.checksum != m.checksum,
                },
                None => StatusEntry {
                    version: m.version,
                    name: m.name.clone(),
                    state: MigrationState::Pending,
                    applied_at: None,
                    execution_time_ms: None,
                    error_message: None,
                    drifted: false,
                },
            };
            if entry.drifted {
                tracing::warn!(version = m.version, name = %m.name, "applied migration file changed");
            }
            report.entries.push(entry);
        }

        report.missing = records
            .into_iter()
            .filter(|r| self.repository.get(r.version).is_none())
            .collect();

        Ok(report)
    }

    /// Apply pending migrations in ascending order, up to `target` (0 = all).
    ///
    /// The first failure is recorded in the ledger and aborts the run; earlier
    /// versions of this run stay applied and are listed in the error.
    pub async fn up(&mut self, target: i64, dry_run: bool) -> Result<RunReport> {
        self.acquire_lock(dry_run).await?;
        let result = self.run_up(target, dry_run).await;
        self.release_lock(dry_run, result).await
    }

    /// Roll back applied migrations above `target` in descending order.
    ///
    /// Each step runs its down-body and the ledger delete in one transaction.
    pub async fn down(&mut self, target: i64, dry_run: bool) -> Result<RunReport> {
        self.acquire_lock(dry_run).await?;
        let result = self.run_down(target, dry_run).await;
        self.release_lock(dry_run, result).await
    }

    /// Roll back only the most recently applied migration.
    pub async fn down_last(&mut self, dry_run: bool) -> Result<RunReport> {
        let applied = self.store.applied_set().await?;
        let mut versions = self
            .repository
            .migrations()
            .iter()
            .map(|m| m.version)
            .filter(|v| applied.contains_key(v))
            .rev();

        if versions.next().is_none() {
            tracing::info!("no migrations to roll back");
            return Ok(RunReport::new(Direction::Down, dry_run));
        }
        let target = versions.next().unwrap_or(0);
        self.down(target, dry_run).await
    }

    /// Roll back everything. Equivalent to `down(0, dry_run)`.
    pub async fn reset(&mut self, dry_run: bool) -> Result<RunReport> {
        tracing::warn!(dry_run, "resetting database: rolling back every applied migration");
        self.down(0, dry_run).await
    }

    /// Write a new migration file numbered after the highest existing version.
    pub fn create(&mut self, name: &str) -> Result<Migration> {
        let migration = self.repository.create(name)?;
        tracing::info!(version = migration.version, path = %migration.path.display(), "created migration");
        Ok(migration)
    }

    /// [`validate`] plus checksum drift of applied migrations.
    pub async fn validate(&mut self) -> Result<ValidationReport> {
        let mut report = validate(self.repository.migrations())?;
        let applied = self.store.applied_set().await?;
        for m in self.drifted(&applied) {
            tracing::warn!(version = m.version, name = %m.name, "applied migration file changed");
            report.warnings.push(ValidationWarning::ChecksumDrift {
                version: m.version,
                name: m.name.clone(),
            });
        }
        Ok(report)
    }

    fn drifted<'a>(&'a self, applied: &'a AppliedSet) -> impl Iterator<Item = &'a Migration> + 'a {
        self.repository.migrations().iter().filter(move |m| {
            applied
                .get(&m.version)
                .is_some_and(|r| r.checksum != m.checksum)
        })
    }

    async fn run_up(&mut self, target: i64, dry_run: bool) -> Result<RunReport> {
        let applied = self.store.applied_set().await?;
        tracing::debug!(
            applied = applied.len(),
            loaded = self.repository.migrations().len(),
            "computing pending migrations"
        );

        if self.options.verify_checksums {
            if let Some(m) = self.drifted(&applied).next() {
                return Err(MigrateError::ChecksumMismatch {
                    version: m.version,
                    name: m.name.clone(),
                    recorded: applied[&m.version].checksum.clone(),
                    current: m.checksum.clone(),
                });
            }
        }

        let pending: Vec<Migration> = self
            .repository
            .migrations()
            .iter()
            .filter(|m| !applied.contains_key(&m.version))
            .filter(|m| target == 0 || m.version <= target)
            .cloned()
            .collect();

        let mut report = RunReport::new(Direction::Up, dry_run);
        if pending.is_empty() {
            tracing::info!("no pending migrations");
            return Ok(report);
        }
        tracing::info!(count = pending.len(), dry_run, "applying migrations");

        for m in pending {
            if dry_run {
                tracing::info!(version = m.version, name = %m.name, "would apply migration");
                report.steps.push(Step {
                    version: m.version,
                    name: m.name,
                    sql: m.up,
                    elapsed_ms: None,
                });
                continue;
            }

            tracing::info!(version = m.version, name = %m.name, "applying migration");
            let started = Instant::now();
            let outcome = self.store.execute(&m.up).await;
            let elapsed_ms = started.elapsed().as_millis() as i64;

            if let Err(source) = outcome {
                if let Err(record_err) = self
                    .store
                    .record_failure(m.version, &m.name, &m.checksum, elapsed_ms, &source.to_string())
                    .await
                {
                    tracing::warn!(
                        version = m.version,
                        error = %record_err,
                        "could not record failed migration"
                    );
                }
                tracing::error!(version = m.version, name = %m.name, error = %source, "migration failed");
                return Err(MigrateError::Execution {
                    version: m.version,
                    name: m.name,
                    source,
                    applied: report.versions(),
                });
            }

            self.store
                .record_success(m.version, &m.name, &m.checksum, elapsed_ms)
                .await
                .map_err(|source| MigrateError::Ledger {
                    version: m.version,
                    source,
                })?;

            tracing::info!(version = m.version, elapsed_ms, "applied migration");
            report.steps.push(Step {
                version: m.version,
                name: m.name,
                sql: m.up,
                elapsed_ms: Some(elapsed_ms),
            });
        }

        Ok(report)
    }

    async fn run_down(&mut self, target: i64, dry_run: bool) -> Result<RunReport> {
        let applied = self.store.applied_set().await?;

        let known: BTreeSet<i64> = self.repository.migrations().iter().map(|m| m.version).collect();
        for version in applied.keys().filter(|v| **v > target && !known.contains(*v)) {
            tracing::warn!(version, "applied migration has no file; it will not be rolled back");
        }

        let rollback: Vec<Migration> = self
            .repository
            .migrations()
            .iter()
            .rev()
            .filter(|m| applied.contains_key(&m.version) && m.version > target)
            .cloned()
            .collect();

        let mut report = RunReport::new(Direction::Down, dry_run);
        if rollback.is_empty() {
            tracing::info!("no migrations to roll back");
            return Ok(report);
        }
        tracing::info!(count = rollback.len(), target, dry_run, "rolling back migrations");

        // Checked for the whole queue up front so a blocked run changes nothing.
        if let Some(m) = rollback.iter().find(|m| !m.has_down()) {
            return Err(MigrateError::NoRollbackAvailable {
                version: m.version,
                name: m.name.clone(),
            });
        }

        for m in rollback {
            if dry_run {
                tracing::info!(version = m.version, name = %m.name, "would roll back migration");
                report.steps.push(Step {
                    version: m.version,
                    name: m.name,
                    sql: m.down,
                    elapsed_ms: None,
                });
                continue;
            }

            tracing::info!(version = m.version, name = %m.name, "rolling back migration");
            let started = Instant::now();
            self.store
                .rollback(m.version, &m.down)
                .await
                .map_err(|source| MigrateError::RollbackExecution {
                    version: m.version,
                    name: m.name.clone(),
                    source,
                })?;
            let elapsed_ms = started.elapsed().as_millis() as i64;

            tracing::info!(version = m.version, elapsed_ms, "rolled back migration");
            report.steps.push(Step {
                version: m.version,
                name: m.name,
                sql: m.down,
                elapsed_ms: Some(elapsed_ms),
            });
        }

        Ok(report)
    }

    async fn acquire_lock(&mut self, dry_run: bool) -> Result<()> {
        if self.options.lock && !dry_run {
            self.store.lock().await?;
        }
        Ok(())
    }

    /// Release the lock on every exit path. The run's own error wins over an
    /// unlock error.
    async fn release_lock<T>(&mut self, dry_run: bool, result: Result<T>) -> Result<T> {
        if !self.options.lock || dry_run {
            return result;
        }
        match (self.store.unlock().await, result) {
            (Ok(()), result) => result,
            (Err(unlock_err), Ok(_)) => Err(unlock_err),
            (Err(unlock_err), Err(err)) => {
                tracing::warn!(error = %unlock_err, "failed to release migration lock");
                Err(err)
            }
        }
    }
}
