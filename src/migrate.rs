use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{Connection, TransactionBehavior};
use rust_embed::RustEmbed;

use crate::error::ScanRelayError;

const CREATE_MIGRATION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migration \
     (component TEXT NOT NULL, version INTEGER NOT NULL, \
     PRIMARY KEY (component, version))";

/// Migration filenames look like `3_time_to_unix_timestamp.sql`: an integer
/// version, an optional single separator letter, an optional name.
static FILENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<version>\d+)\w?(?P<name>.+)?\.sql$").unwrap());

struct Migration {
    version: i64,
    filename: String,
    sql: String,
}

/// Applies all pending migrations for `component` from the embedded folder
/// `E`. Each migration runs in its own IMMEDIATE transaction together with
/// its `schema_migration` row, so a migration is applied at most once and
/// never half-way.
pub fn migrate<E: RustEmbed>(
    conn: &mut Connection,
    component: &str,
) -> Result<(), ScanRelayError> {
    conn.execute(CREATE_MIGRATION_TABLE, [])?;

    let mut migrations = parse_embedded::<E>()?;
    if migrations.is_empty() {
        return Ok(());
    }
    migrations.sort_by_key(|m| m.version);

    let applied = applied_versions(conn, component)?;

    for migration in &migrations {
        if applied.contains(&migration.version) {
            continue;
        }

        log::info!(
            "Applying migration {} for component {}",
            migration.filename,
            component
        );

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(&migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migration (component, version) VALUES (?, ?)",
            rusqlite::params![component, migration.version],
        )?;
        tx.commit()?;
    }

    Ok(())
}

fn parse_embedded<E: RustEmbed>() -> Result<Vec<Migration>, ScanRelayError> {
    let mut migrations = Vec::new();

    for filename in E::iter() {
        let captures = FILENAME_RE.captures(&filename).ok_or_else(|| {
            ScanRelayError::Fatal(format!("unrecognised migration filename: {filename}"))
        })?;

        let version: i64 = captures["version"].parse().map_err(|_| {
            ScanRelayError::Fatal(format!("migration version out of range: {filename}"))
        })?;

        let file = E::get(&filename).ok_or_else(|| {
            ScanRelayError::Fatal(format!("embedded migration missing: {filename}"))
        })?;
        let sql = String::from_utf8(file.data.into_owned()).map_err(|_| {
            ScanRelayError::Fatal(format!("migration is not valid UTF-8: {filename}"))
        })?;

        migrations.push(Migration {
            version,
            filename: filename.to_string(),
            sql,
        });
    }

    Ok(migrations)
}

fn applied_versions(
    conn: &Connection,
    component: &str,
) -> Result<std::collections::HashSet<i64>, ScanRelayError> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migration WHERE component = ?")?;
    let rows = stmt.query_map([component], |row| row.get::<_, i64>(0))?;

    let mut versions = std::collections::HashSet::new();
    for row in rows {
        versions.insert(row?);
    }

    Ok(versions)
}
