//! Migration files on disk.
//!
//! A migration is a single `.sql` file named `<version>_<name>.sql`:
//!
//! ```sql
//! CREATE TABLE users (id BIGINT PRIMARY KEY);
//!
//! -- DOWN
//! DROP TABLE users;
//! ```
//!
//! Everything above the first rollback marker line is the up section, everything
//! below it the down section. Without a marker the file has no down section and
//! cannot be rolled back.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nom::{
    character::complete::{char, digit1},
    combinator::rest,
    sequence::separated_pair,
    IResult,
};
use sha2::{Digest, Sha256};

use crate::error::{MigrateError, Result};

/// File extension of migration files.
pub const MIGRATION_EXTENSION: &str = ".sql";

/// Lines (trimmed, case-sensitive) that start the down section.
pub const ROLLBACK_MARKERS: &[&str] = &[
    "-- DOWN",
    "-- DOWN MIGRATION",
    "-- ROLLBACK",
    "--- DOWN",
    "--- ROLLBACK",
];

/// A versioned schema change loaded from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub up: String,
    pub down: String,
    pub checksum: String,
    pub path: PathBuf,
}

impl Migration {
    /// Build a migration from a file name and its content.
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| parse_error(path, "file name is not valid UTF-8"))?;
        let (version, name) = parse_file_name(file_name).map_err(|reason| parse_error(path, reason))?;
        let (up, down) = split_sections(content);

        Ok(Self {
            version,
            name,
            checksum: checksum(&up),
            up,
            down,
            path: path.to_path_buf(),
        })
    }

    /// Whether the down section holds anything executable.
    pub fn has_down(&self) -> bool {
        !is_blank_sql(&self.down)
    }

    /// Canonical file name, e.g. `00002_add_col.sql`.
    pub fn file_name(&self) -> String {
        canonical_file_name(self.version, &self.name)
    }
}

fn parse_error(path: &Path, reason: impl Into<String>) -> MigrateError {
    MigrateError::Parse {
        file: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn version_and_name(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(digit1, char('_'), rest)(input)
}

/// Split `00001_add_users.sql` into `(1, "add_users")`.
pub fn parse_file_name(file_name: &str) -> std::result::Result<(i64, String), String> {
    let stem = file_name
        .strip_suffix(MIGRATION_EXTENSION)
        .ok_or_else(|| format!("expected a {} file", MIGRATION_EXTENSION))?;

    let (_, (digits, name)) = version_and_name(stem)
        .map_err(|_| "expected <version>_<name>.sql with a numeric version prefix".to_string())?;

    let version = digits
        .parse::<i64>()
        .map_err(|e| format!("invalid version number {}: {}", digits, e))?;

    if name.is_empty() {
        return Err("migration name is empty".to_string());
    }

    Ok((version, name.to_string()))
}

pub fn canonical_file_name(version: i64, name: &str) -> String {
    format!("{:05}_{}{}", version, name, MIGRATION_EXTENSION)
}

/// Split file content at the first rollback marker line.
pub fn split_sections(content: &str) -> (String, String) {
    let mut up = String::new();
    let mut down = String::new();
    let mut in_down = false;

    for line in content.lines() {
        if !in_down && ROLLBACK_MARKERS.contains(&line.trim()) {
            in_down = true;
            continue;
        }
        let section = if in_down { &mut down } else { &mut up };
        section.push_str(line);
        section.push('\n');
    }

    (up.trim().to_string(), down.trim().to_string())
}

/// True when the SQL is empty or consists only of `--` comments.
pub fn is_blank_sql(sql: &str) -> bool {
    sql.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}

/// SHA-256 of the up section, hex encoded (64 chars).
pub fn checksum(up: &str) -> String {
    format!("{:x}", Sha256::digest(up.as_bytes()))
}

/// The ordered set of migrations found in one directory.
#[derive(Debug, Clone)]
pub struct Repository {
    dir: PathBuf,
    migrations: Vec<Migration>,
}

impl Repository {
    /// Read every `*.sql` file directly inside `dir`.
    ///
    /// Sub-directories and other files are skipped. Duplicate versions are
    /// rejected.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let entries = fs::read_dir(&dir).map_err(|e| MigrateError::io(&dir, e))?;

        let mut migrations = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MigrateError::io(&dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| MigrateError::io(&path, e))?;
            if file_type.is_dir() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
                tracing::warn!(path = %path.display(), "skipping file with non UTF-8 name");
                continue;
            };
            if !file_name.ends_with(MIGRATION_EXTENSION) {
                continue;
            }

            let content = fs::read_to_string(&path).map_err(|e| MigrateError::io(&path, e))?;
            let migration = Migration::parse(&path, &content)?;
            tracing::debug!(version = migration.version, name = %migration.name, "loaded migration");
            migrations.push(migration);
        }

        Self::from_migrations(dir, migrations)
    }

    /// Like [`Repository::load`], but a missing directory yields an empty set.
    pub fn load_or_empty(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if dir.exists() {
            Self::load(dir)
        } else {
            Ok(Self {
                dir,
                migrations: Vec::new(),
            })
        }
    }

    /// Build a repository from already parsed migrations.
    pub fn from_migrations(dir: impl Into<PathBuf>, mut migrations: Vec<Migration>) -> Result<Self> {
        migrations.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.path.cmp(&b.path)));

        if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(MigrateError::Parse {
                file: pair[1].path.clone(),
                reason: format!(
                    "duplicate version {} (also used by {})",
                    pair[1].version,
                    pair[0].path.display()
                ),
            });
        }

        Ok(Self {
            dir: dir.into(),
            migrations,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Migrations sorted ascending by version.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn get(&self, version: i64) -> Option<&Migration> {
        self.migrations
            .binary_search_by_key(&version, |m| m.version)
            .ok()
            .map(|idx| &self.migrations[idx])
    }

    /// One past the highest version, or 1 for an empty directory.
    pub fn next_version(&self) -> Result<i64> {
        let Some(last) = self.migrations.last() else {
            return Ok(1);
        };
        last.version.checked_add(1).ok_or_else(|| {
            parse_error(&last.path, "version is the largest possible; no version can follow it")
        })
    }

    /// Write a new templated migration file with the next version.
    pub fn create(&mut self, name: &str) -> Result<Migration> {
        validate_name(name)?;

        let version = self.next_version()?;
        let file_name = canonical_file_name(version, name);
        let path = self.dir.join(&file_name);

        fs::create_dir_all(&self.dir).map_err(|e| MigrateError::io(&self.dir, e))?;

        let content = template(&file_name, name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| MigrateError::io(&path, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| MigrateError::io(&path, e))?;

        let migration = Migration::parse(&path, &content)?;
        self.migrations.push(migration.clone());
        Ok(migration)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(MigrateError::InvalidName(name.to_string()))
    }
}

fn template(file_name: &str, name: &str) -> String {
    format!(
        "-- Migration: {file_name}\n\
         -- Description: {name}\n\
         -- Date: {date}\n\
         \n\
         -- UP MIGRATION\n\
         -- Add your migration SQL here, e.g.\n\
         -- CREATE TABLE example (id BIGINT PRIMARY KEY, name VARCHAR(255) NOT NULL);\n\
         \n\
         -- DOWN MIGRATION\n\
         -- Add your rollback SQL here, e.g.\n\
         -- DROP TABLE IF EXISTS example;\n",
        date = chrono::Local::now().format("%Y-%m-%d"),
    )
}
