//! # dbmigrate
//!
//! Versioned SQL migrations for PostgreSQL-compatible databases.
//!
//! Migration files live in one directory as `<version>_<name>.sql`, with an
//! optional `-- DOWN` section for rollback. Applied versions are tracked in a
//! `schema_migrations` ledger table inside the target database.
//!
//! ```no_run
//! use dbmigrate::{Config, Migrator, MigratorOptions, PgStore, Repository};
//!
//! # async fn run() -> dbmigrate::Result<()> {
//! let config = Config::load(None)?;
//! let pool = config.connect().await?;
//! let repository = Repository::load(&config.migrations.dir)?;
//! let mut migrator = Migrator::new(PgStore::new(pool), repository, MigratorOptions::default()).await?;
//! let report = migrator.up(0, false).await?;
//! println!("applied {} migration(s)", report.steps.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod migration;
pub mod report;
pub mod store;

pub use config::Config;
pub use engine::{
    Direction, MigrationState, Migrator, MigratorOptions, RunReport, StatusEntry, StatusReport,
    Step, ValidationReport, ValidationWarning,
};
pub use error::{MigrateError, Result};
pub use migration::{Migration, Repository};
pub use store::{AppliedRecord, AppliedSet, PgStore, RecordStatus, Store};
