use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;

use log::info;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};

use crate::error::ScanRelayError;

/// Page cache: 128 MiB, expressed as negative KiB per SQLite convention.
const CACHE_SIZE_KIB: i64 = -131_072;

/// Memory-mapped region: 8 GiB.
const MMAP_SIZE: i64 = 8_589_934_592;

const BUSY_TIMEOUT_MS: i64 = 1_000;

/// Dual-handle SQLite database.
///
/// SQLite allows exactly one writer, so the read-write connection is
/// serialised behind a mutex. Reads go through a fixed-size read-only pool:
/// max-open equals min-idle so connections are opened once and never
/// churned.
pub struct Database {
    writer: Mutex<Connection>,
    readers: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self, ScanRelayError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        info!("Opening database: {}", db_path.display());

        // The writer must come first: it creates the file and initialises
        // the WAL, which a read-only open cannot do.
        let writer = Connection::open(db_path)?;
        configure_writer(&writer)?;

        let pool_size = suggest_connection_count();
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI,
            )
            .with_init(configure_reader);

        let readers = Pool::builder()
            .max_size(pool_size)
            .min_idle(Some(pool_size))
            .build(manager)?;

        let db = Self {
            writer: Mutex::new(writer),
            readers,
            path: db_path.to_path_buf(),
        };

        db.ping()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The serialised read-write handle. Held for the duration of the guard.
    pub fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap()
    }

    /// A read-only connection from the pool.
    pub fn reader(&self) -> Result<PooledConnection<SqliteConnectionManager>, ScanRelayError> {
        Ok(self.readers.get()?)
    }

    /// Runs `f` inside an IMMEDIATE transaction on the writer. IMMEDIATE
    /// takes the write lock at BEGIN, avoiding upgrade deadlocks between a
    /// deferred BEGIN and the first write.
    pub fn immediate_transaction<T, F>(&self, f: F) -> Result<T, ScanRelayError>
    where
        F: FnOnce(&Transaction) -> Result<T, ScanRelayError>,
    {
        let mut conn = self.writer();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Verifies connectivity. Only the writer is pinged: a read-only
    /// connection would attempt WAL initialisation and fail on a fresh
    /// database.
    pub fn ping(&self) -> Result<(), ScanRelayError> {
        self.writer().query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Flushes the WAL back into the main database file. Called on
    /// shutdown before the process exits.
    pub fn close(&self) {
        let conn = self.writer();
        let checkpoint = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_row| Ok(()));
        if let Err(e) = checkpoint {
            log::warn!("WAL checkpoint on close failed: {}", e);
        }
    }
}

fn configure_writer(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")?;
    conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;
    conn.pragma_update(None, "cache_size", CACHE_SIZE_KIB)?;
    conn.pragma_update(None, "mmap_size", MMAP_SIZE)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

fn configure_reader(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "query_only", "ON")?;
    conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;
    conn.pragma_update(None, "cache_size", CACHE_SIZE_KIB)?;
    conn.pragma_update(None, "mmap_size", MMAP_SIZE)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

/// Read-pool size: 2-8 connections depending on CPU count. Going beyond 8
/// shows no throughput benefit for this workload.
fn suggest_connection_count() -> u32 {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    cpus.clamp(2, 8) as u32
}
