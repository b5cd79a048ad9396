//! dbmigrate - apply, roll back and inspect versioned SQL migrations.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

use dbmigrate::config::{Config, LoggingConfig};
use dbmigrate::{engine, report, MigrateError, Migrator, MigratorOptions, PgStore, Repository};

#[derive(Parser)]
#[command(name = "dbmigrate")]
#[command(about = "Database migration tool - versioned SQL migrations with rollback and audit")]
#[command(disable_version_flag = true)]
#[command(after_help = "Examples:
  dbmigrate status
  dbmigrate up
  dbmigrate up --version 5
  dbmigrate down 3
  dbmigrate down --last
  dbmigrate create add_users_table
  dbmigrate reset --dry-run
  dbmigrate validate

Environment:
  DSN        Database connection string
  CA         CA certificate (PEM text or path), enables sslmode=verify-full
  DB_DRIVER  Database driver (postgres, cockroachdb)")]
struct Cli {
    /// Path to configuration file (default: ./dbmigrate.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to migrations directory
    #[arg(long, global = true)]
    migrations: Option<PathBuf>,

    /// Target version for up/down migrations
    #[arg(long = "version", global = true, value_name = "VERSION")]
    target_version: Option<i64>,

    /// Show what would be executed without running
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the status report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Show current migration status
    Status,
    /// Apply migrations up to a version (or all pending)
    Up {
        /// Target version
        version: Option<i64>,
    },
    /// Roll back migrations above a version (default 0: all of them)
    Down {
        /// Target version
        version: Option<i64>,
        /// Roll back only the most recently applied migration
        #[arg(long, conflicts_with = "version")]
        last: bool,
    },
    /// Create a new migration file
    Create {
        /// Migration name, e.g. add_users_table
        name: String,
    },
    /// Roll back every applied migration
    Reset,
    /// Validate migration files without executing them
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let command = cli.command.unwrap_or(Command::Status);
    let needs_database = !matches!(command, Command::Create { .. } | Command::Validate);

    let mut config = if needs_database {
        Config::load(cli.config.as_deref())?
    } else {
        Config::resolve(cli.config.as_deref())?
    };
    init_logging(&config.logging, cli.verbose);

    if let Some(dir) = cli.migrations {
        config.migrations.dir = dir;
    }
    let dir = config.migrations.dir.clone();

    match command {
        Command::Create { name } => {
            let migration = Repository::load_or_empty(&dir)?.create(&name)?;
            report::print_created(&migration);
        }
        Command::Validate => {
            // With a database at hand, also report drift of applied files.
            let validation = if config.has_dsn() {
                config.validate()?;
                open_migrator(&mut config).await?.validate().await?
            } else {
                engine::validate(Repository::load(&dir)?.migrations())?
            };
            report::print_validation(&validation);
        }
        Command::Status => {
            let mut migrator = open_migrator(&mut config).await?;
            let status = migrator.status().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                report::print_status(&status, &config.redacted_dsn());
            }
        }
        Command::Up { version } => {
            let mut migrator = open_migrator(&mut config).await?;
            let target = version.or(cli.target_version).unwrap_or(0);
            let run = match migrator.up(target, cli.dry_run).await {
                Ok(run) => run,
                Err(err) => {
                    if let MigrateError::Execution { applied, .. } = &err {
                        report::print_applied_before_failure(applied);
                    }
                    return Err(err.into());
                }
            };
            report::print_run(&run);
        }
        Command::Down { version, last } => {
            let mut migrator = open_migrator(&mut config).await?;
            let run = match DownPlan::new(version, cli.target_version, last) {
                DownPlan::Last => migrator.down_last(cli.dry_run).await?,
                DownPlan::To(target) => migrator.down(target, cli.dry_run).await?,
            };
            report::print_run(&run);
        }
        Command::Reset => {
            let mut migrator = open_migrator(&mut config).await?;
            println!("{}", "⚠️  WARNING: This will roll back every applied migration!".yellow().bold());
            println!("   This action cannot be undone.\n");
            let run = migrator.reset(cli.dry_run).await?;
            report::print_run(&run);
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum DownPlan {
    /// Roll back every applied version above this one.
    To(i64),
    Last,
}

impl DownPlan {
    /// A positional version wins over `--version`; neither means 0.
    fn new(version: Option<i64>, target_version: Option<i64>, last: bool) -> Self {
        if last {
            DownPlan::Last
        } else {
            DownPlan::To(version.or(target_version).unwrap_or(0))
        }
    }
}

/// Connect, load the migrations directory and ensure the ledger table.
async fn open_migrator(config: &mut Config) -> Result<Migrator<PgStore>> {
    if config.migrations.lock && config.database.max_conns < 2 {
        tracing::warn!("max_conns raised to 2: the migration lock pins one connection");
        config.database.max_conns = 2;
    }

    let pool = config.connect().await?;
    let repository = Repository::load(&config.migrations.dir)?;
    let store = PgStore::new(pool).with_table(config.migrations.table.clone());
    let options = MigratorOptions {
        lock: config.migrations.lock,
        verify_checksums: config.migrations.verify_checksums,
    };
    Ok(Migrator::new(store, repository, options).await?)
}

/// Logs go to stderr. `RUST_LOG` wins, then `--verbose`, then `logging.level`.
fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,dbmigrate={}", level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}
