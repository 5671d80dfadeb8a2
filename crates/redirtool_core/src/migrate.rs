use std::fs;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::runtime::ResolvedPaths;
use crate::storage::open_connection;

/// A schema change. The database records the last applied version in
/// `PRAGMA user_version`.
struct SchemaStep {
    version: u32,
    name: &'static str,
    change: SchemaChange,
}

enum SchemaChange {
    Script(&'static str),
    /// Skipped when the column exists already, as on a `sys_redirect` export
    /// taken from a site that carries the flag.
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
}

const SCHEMA_STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "baseline",
        change: SchemaChange::Script(include_str!("migrations/v001_baseline.sql")),
    },
    SchemaStep {
        version: 2,
        name: "redirect_protected",
        change: SchemaChange::AddColumn {
            table: "sys_redirect",
            column: "protected",
            definition: "INTEGER NOT NULL DEFAULT 0",
        },
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaUpgrade {
    pub version: u32,
    pub name: &'static str,
    /// False when the database already had the change.
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<SchemaUpgrade>,
    pub schema_version: u32,
}

pub fn latest_version() -> u32 {
    SCHEMA_STEPS.last().map_or(0, |step| step.version)
}

/// Brings the redirect database at `paths.db_path` to the latest schema,
/// creating the file and its directory when missing.
pub fn run_migrations(paths: &ResolvedPaths) -> Result<MigrateReport> {
    if let Some(parent) = paths.db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    migrate_connection(&open_connection(&paths.db_path)?)
}

pub(crate) fn migrate_connection(connection: &Connection) -> Result<MigrateReport> {
    let mut version = schema_version(connection)?;
    let mut applied = Vec::new();
    for step in SCHEMA_STEPS.iter().filter(move |step| step.version > version) {
        let changed = apply_step(connection, step)
            .with_context(|| format!("schema step v{:03}_{} failed", step.version, step.name))?;
        info!(version = step.version, name = step.name, changed, "upgraded redirect schema");
        applied.push(SchemaUpgrade {
            version: step.version,
            name: step.name,
            changed,
        });
        version = step.version;
    }
    Ok(MigrateReport {
        applied,
        schema_version: version,
    })
}

pub fn pending_migration_count(paths: &ResolvedPaths) -> Result<usize> {
    if !paths.db_path.exists() {
        return Ok(SCHEMA_STEPS.len());
    }
    let version = schema_version(&open_connection(&paths.db_path)?)?;
    Ok(SCHEMA_STEPS
        .iter()
        .filter(|step| step.version > version)
        .count())
}

fn schema_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read schema version")?;
    u32::try_from(version).context("schema version out of range")
}

/// Runs the change and bumps `user_version` in one transaction.
fn apply_step(connection: &Connection, step: &SchemaStep) -> Result<bool> {
    let transaction = connection
        .unchecked_transaction()
        .context("failed to begin schema transaction")?;
    let changed = match step.change {
        SchemaChange::Script(sql) => {
            transaction.execute_batch(sql)?;
            true
        }
        SchemaChange::AddColumn {
            table,
            column,
            definition,
        } => {
            if has_column(&transaction, table, column)? {
                debug!(table, column, "column already present");
                false
            } else {
                transaction
                    .execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))?;
                true
            }
        }
    };
    transaction.pragma_update(None, "user_version", step.version)?;
    transaction
        .commit()
        .context("failed to commit schema step")?;
    Ok(changed)
}

fn has_column(connection: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut statement = connection
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table {table}"))?;
    let names = statement.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}
