//! Terminal rendering of engine reports.

use colored::*;

use crate::engine::{
    Direction, MigrationState, RunReport, StatusReport, ValidationReport,
};
use crate::migration::Migration;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Print the migration status table.
pub fn print_status(report: &StatusReport, database: &str) {
    println!();
    println!("{}", "📊 Migration Status".cyan().bold());
    println!("{}", "==================".cyan());
    println!("Database: {}", database.yellow());
    println!("Total migrations:   {}", report.total());
    println!("Applied migrations: {}", report.applied().to_string().green());
    if report.failed() > 0 {
        println!("Failed migrations:  {}", report.failed().to_string().red());
    }
    println!("Pending migrations: {}", report.pending().to_string().yellow());
    println!();

    if report.entries.is_empty() && report.missing.is_empty() {
        println!("No migration files found.");
        return;
    }

    println!("Migration History:");
    println!("{:<8} {:<30} {:<20} {:<10} {:>8}", "Version", "Name", "Applied At", "Status", "Time");
    println!("{:<8} {:<30} {:<20} {:<10} {:>8}", "-------", "----", "----------", "------", "----");

    for entry in &report.entries {
        let applied_at = entry
            .applied_at
            .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_else(|| "Pending".to_string());
        let status = format!("{:<10}", entry.state.to_string());
        let status = match entry.state {
            MigrationState::Applied if entry.drifted => status.yellow(),
            MigrationState::Applied => status.green(),
            MigrationState::Failed => status.red(),
            MigrationState::Pending => status.dimmed(),
        };
        let time = entry
            .execution_time_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_default();

        println!(
            "{:<8} {:<30} {:<20} {} {:>8}",
            entry.version,
            truncate(&entry.name, 28),
            applied_at,
            status,
            time
        );
        if let Some(error) = &entry.error_message {
            println!("         {} {}", "└─".red(), truncate(error, 100).red());
        }
        if entry.drifted {
            println!("         {} {}", "└─".yellow(), "file changed after it was applied".yellow());
        }
    }

    if !report.missing.is_empty() {
        println!();
        println!("{}", "Recorded in the database but missing on disk:".yellow());
        for record in &report.missing {
            println!(
                "{:<8} {:<30} {:<20} {}",
                record.version,
                truncate(&record.name, 28),
                record.applied_at.format(TIMESTAMP_FORMAT),
                record.status.to_string().yellow()
            );
        }
    }
    println!();
}

/// Print the outcome of `up`, `down` or `reset`.
pub fn print_run(report: &RunReport) {
    let (verb, icon) = match report.direction {
        Direction::Up => ("Applying", "📝"),
        Direction::Down => ("Rolling back", "🔄"),
    };

    if report.is_empty() {
        match report.direction {
            Direction::Up => println!("{}", "✅ No pending migrations to apply.".green()),
            Direction::Down => println!("{}", "✅ No migrations to roll back.".green()),
        }
        return;
    }

    println!(
        "{} {} {} migration(s)...",
        if report.direction == Direction::Up { "🚀" } else { "🔄" },
        verb,
        report.steps.len()
    );
    if report.dry_run {
        println!("{}", "🔍 DRY RUN - No changes will be made".yellow());
    }

    for step in &report.steps {
        println!("{} {} {}: {}", icon, verb, step.version.to_string().cyan(), step.name);
        match step.elapsed_ms {
            Some(ms) => println!("   {} in {}ms", "✅ Done".green(), ms),
            None => {
                for line in step.sql.lines() {
                    println!("   {}", line.dimmed());
                }
            }
        }
    }

    if !report.dry_run {
        match report.direction {
            Direction::Up => println!("{}", "✅ All migrations applied successfully!".green().bold()),
            Direction::Down => {
                println!("{}", "✅ All migrations rolled back successfully!".green().bold())
            }
        }
    }
}

/// List what a failed `up` managed to apply before stopping.
pub fn print_applied_before_failure(applied: &[i64]) {
    if applied.is_empty() {
        println!("{}", "❌ No migrations were applied before the failure.".red());
        return;
    }
    let versions: Vec<String> = applied.iter().map(|v| v.to_string()).collect();
    println!(
        "{} {}",
        "⚠️  Applied before the failure:".yellow(),
        versions.join(", ").cyan()
    );
}

pub fn print_validation(report: &ValidationReport) {
    println!("{}", "🔍 Validating migration files...".cyan());
    for warning in &report.warnings {
        println!("{} {}", "⚠️  Warning:".yellow(), warning);
    }
    println!(
        "{}",
        format!("✅ {} migration file(s) are valid.", report.checked).green()
    );
}

pub fn print_created(migration: &Migration) {
    println!("{} {}", "✅ Created migration file:".green(), migration.path.display());
    println!("   Version: {}", migration.version.to_string().cyan());
    println!("   Name:    {}", migration.name.cyan());
}

/// Shorten to at most `max` characters, marking the cut with `...`.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}
