use std::sync::Arc;
use std::time::Duration;

use rusqlite::OptionalExtension;
use rust_embed::RustEmbed;

use crate::database::Database;
use crate::error::ScanRelayError;
use crate::migrate;
use crate::scan::Scan;

#[derive(RustEmbed)]
#[folder = "migrations/processor/"]
struct Migrations;

const SQL_UPSERT: &str = "\
INSERT INTO scan (folder, relative_path, priority, time)
VALUES (?, ?, ?, ?)
ON CONFLICT (folder) DO UPDATE SET
    priority = MAX(excluded.priority, scan.priority),
    relative_path = excluded.relative_path,
    time = excluded.time";

const SQL_NEXT_ELIGIBLE: &str = "\
SELECT folder, relative_path, priority, time FROM scan
WHERE time < ?
ORDER BY priority DESC, time ASC
LIMIT 1";

const SQL_DELETE: &str = "DELETE FROM scan WHERE folder = ?";

const SQL_REMAINING: &str = "SELECT COUNT(folder) FROM scan";

const SQL_ALL: &str = "SELECT folder, relative_path, priority, time FROM scan";

/// The durable deduplicating scan queue.
///
/// One row per folder. Upserts merge (`priority` monotonic-max, the rest
/// last-writer-wins); a row leaves the table only after every target has
/// accepted it.
pub struct ScanStore {
    db: Arc<Database>,
}

impl ScanStore {
    pub fn new(db: Arc<Database>) -> Result<Self, ScanRelayError> {
        {
            let mut conn = db.writer();
            migrate::migrate::<Migrations>(&mut conn, "processor")?;
        }

        Ok(Self { db })
    }

    /// Inserts or merges all scans atomically: either the whole slice is
    /// applied or none of it.
    pub fn upsert(&self, scans: &[Scan]) -> Result<(), ScanRelayError> {
        if scans.is_empty() {
            return Ok(());
        }

        self.db.immediate_transaction(|tx| {
            let mut stmt = tx.prepare_cached(SQL_UPSERT)?;
            for scan in scans {
                stmt.execute(rusqlite::params![
                    scan.folder,
                    scan.relative_path,
                    scan.priority,
                    scan.time,
                ])?;
            }
            Ok(())
        })
    }

    /// Returns the highest-priority scan older than `minimum_age`, breaking
    /// priority ties by earliest time. The row is not consumed; callers
    /// delete it after successful dispatch.
    pub fn next_eligible(&self, minimum_age: Duration) -> Result<Scan, ScanRelayError> {
        let cutoff = chrono::Utc::now().timestamp() - minimum_age.as_secs() as i64;

        let conn = self.db.reader()?;
        let scan = conn
            .query_row(SQL_NEXT_ELIGIBLE, [cutoff], |row| {
                Ok(Scan {
                    folder: row.get(0)?,
                    relative_path: row.get(1)?,
                    priority: row.get(2)?,
                    time: row.get(3)?,
                })
            })
            .optional()?;

        scan.ok_or(ScanRelayError::NoScans)
    }

    /// Removes the row for `folder`. Deleting an absent row is not an error.
    pub fn delete(&self, folder: &str) -> Result<(), ScanRelayError> {
        self.db.writer().execute(SQL_DELETE, [folder])?;
        Ok(())
    }

    pub fn remaining(&self) -> Result<i64, ScanRelayError> {
        let conn = self.db.reader()?;
        let count = conn.query_row(SQL_REMAINING, [], |row| row.get(0))?;
        Ok(count)
    }

    /// Unordered enumeration of every pending scan.
    pub fn all(&self) -> Result<Vec<Scan>, ScanRelayError> {
        let conn = self.db.reader()?;
        let mut stmt = conn.prepare(SQL_ALL)?;
        let rows = stmt.query_map([], |row| {
            Ok(Scan {
                folder: row.get(0)?,
                relative_path: row.get(1)?,
                priority: row.get(2)?,
                time: row.get(3)?,
            })
        })?;

        let mut scans = Vec::new();
        for row in rows {
            scans.push(row?);
        }

        Ok(scans)
    }
}
