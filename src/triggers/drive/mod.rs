pub mod diff;
pub mod limiter;
pub mod paths;
pub mod source;
pub mod store;

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use cron::Schedule;
use log::{debug, error, info, warn};
use serde::Deserialize;

use crate::database::Database;
use crate::error::ScanRelayError;
use crate::filter::Filter;
use crate::rewrite::{RewriteRule, Rewriter};
use crate::scan::Scan;
use crate::triggers::ProcessorFn;
use crate::utils::clean_path;

use diff::{reclassify_trashed, Difference, DriveItem, ItemChange, SyncError};
use limiter::AccountLimiter;
use paths::Paths;
use source::{Change, ChangeSource};
use store::DriveStore;

/// Consecutive failed runs before a job unregisters itself.
const MAX_SYNC_RETRIES: u32 = 5;

/// A sync running longer than this gets a warning; the run itself is never
/// abandoned, so the sync slot always releases exactly once.
const SYNC_WATCHDOG: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DriveTriggerConfig {
    /// Account credential file; also the key sharing one rate limiter
    /// across every trigger using the same account.
    pub account: String,
    pub cron: String,
    pub priority: i64,
    pub time_offset_secs: i64,
    pub rewrite: Vec<RewriteRule>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub drives: Vec<DriveConfig>,
}

impl Default for DriveTriggerConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            cron: "0 */15 * * * *".to_string(),
            priority: 0,
            time_offset_secs: 0,
            rewrite: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            drives: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct DriveConfig {
    pub id: String,
    pub time_offset_secs: i64,
    pub rewrite: Vec<RewriteRule>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Registers one cron-driven sync job per configured drive. Each job owns
/// its retry state and unregisters itself on fatal errors or after too
/// many strikes.
pub fn spawn(
    config: DriveTriggerConfig,
    db: Arc<Database>,
    change_source: Arc<dyn ChangeSource>,
    callback: ProcessorFn,
) -> Result<(), ScanRelayError> {
    let schedule = Schedule::from_str(&config.cron)
        .map_err(|e| ScanRelayError::Config(format!("invalid cron expression {:?}: {e}", config.cron)))?;

    let store = Arc::new(DriveStore::new(db)?);
    let account_limiter = limiter::for_account(&config.account);

    for drive_config in &config.drives {
        let mut rewrite_rules = drive_config.rewrite.clone();
        rewrite_rules.extend(config.rewrite.iter().cloned());

        let mut includes = drive_config.include.clone();
        includes.extend(config.include.iter().cloned());
        let mut excludes = drive_config.exclude.clone();
        excludes.extend(config.exclude.iter().cloned());

        let time_offset = if drive_config.time_offset_secs > 0 {
            drive_config.time_offset_secs
        } else {
            config.time_offset_secs
        };

        let job = SyncJob {
            drive_id: drive_config.id.clone(),
            priority: config.priority,
            time_offset,
            rewriter: Rewriter::new(&rewrite_rules)?,
            filter: Filter::new(&includes, &excludes)?,
            store: store.clone(),
            source: change_source.clone(),
            limiter: account_limiter.clone(),
            callback: callback.clone(),
        };

        // Startup classification: no stored page token means the drive
        // needs one full enumeration before deltas make sense.
        let full_sync = store.page_token(&drive_config.id)?.is_none();

        tokio::spawn(run_job(schedule.clone(), job, full_sync));
    }

    Ok(())
}

/// The per-drive scheduling loop. Runs are strictly sequential: occurrences
/// that pass while a run is still executing are skipped, never queued.
async fn run_job(schedule: Schedule, job: SyncJob, mut full_sync: bool) {
    let mut attempts: u32 = 0;
    let mut errors: Vec<String> = Vec::new();

    loop {
        let next = match schedule.upcoming(chrono::Local).next() {
            Some(next) => next,
            None => {
                warn!("Drive {}: cron schedule has no future runs", job.drive_id);
                return;
            }
        };

        let wait = (next - chrono::Local::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        attempts += 1;

        match job.run_once(&mut full_sync).await {
            Ok(()) => {
                attempts = 0;
                errors.clear();
            }
            Err(e) => {
                match &e {
                    SyncError::InvalidCredentials
                    | SyncError::DataAnomaly(_)
                    | SyncError::Network(_) => {
                        debug!(
                            "Drive {}: sync retry (attempt {}): {}",
                            job.drive_id, attempts, e
                        );
                    }
                    SyncError::Fatal(_) => {
                        error!("Drive {}: sync fatal, unregistering job: {}", job.drive_id, e);
                        return;
                    }
                    _ => {
                        warn!(
                            "Drive {}: sync unexpected error (attempt {}): {}",
                            job.drive_id, attempts, e
                        );
                    }
                }

                errors.push(e.to_string());

                if attempts >= MAX_SYNC_RETRIES {
                    error!(
                        "Drive {}: sync stopped after {} attempts: [{}]",
                        job.drive_id,
                        attempts,
                        errors.join("; ")
                    );
                    return;
                }
            }
        }
    }
}

struct SyncJob {
    drive_id: String,
    priority: i64,
    time_offset: i64,
    rewriter: Rewriter,
    filter: Filter,
    store: Arc<DriveStore>,
    source: Arc<dyn ChangeSource>,
    limiter: Arc<AccountLimiter>,
    callback: ProcessorFn,
}

impl SyncJob {
    async fn run_once(&self, full_sync: &mut bool) -> Result<(), SyncError> {
        let _slot = self.limiter.acquire_sync_slot().await?;

        if *full_sync {
            with_watchdog(&self.drive_id, self.run_full_sync()).await?;
            *full_sync = false;
            return Ok(());
        }

        with_watchdog(&self.drive_id, self.run_incremental_sync()).await
    }

    /// Populates the local snapshot and records the change-feed position.
    /// Emits no scans: there is nothing "new" about a first enumeration.
    async fn run_full_sync(&self) -> Result<(), SyncError> {
        info!("Drive {}: full sync starting", self.drive_id);
        let started = std::time::Instant::now();

        self.limiter.wait().await;
        let page_token = self.source.start_page_token(&self.drive_id).await?;

        self.limiter.wait().await;
        let items = self.source.list_all(&self.drive_id).await?;

        let mut folders = Vec::new();
        let mut files = Vec::new();
        for item in items {
            let drive_item = DriveItem {
                id: item.id,
                name: item.name,
                parent: item.parent,
                trashed: item.trashed,
            };
            if item.is_folder {
                folders.push(drive_item);
            } else {
                files.push(drive_item);
            }
        }

        self.store
            .replace_all(&self.drive_id, &folders, &files, &page_token)?;

        info!(
            "Drive {}: full sync finished in {:.2?} ({} folders, {} files)",
            self.drive_id,
            started.elapsed(),
            folders.len(),
            files.len()
        );

        Ok(())
    }

    async fn run_incremental_sync(&self) -> Result<(), SyncError> {
        debug!("Drive {}: incremental sync starting", self.drive_id);
        let started = std::time::Instant::now();

        let stored_token = self
            .store
            .page_token(&self.drive_id)?
            .ok_or_else(|| SyncError::DataAnomaly("page token disappeared".to_string()))?;

        let mut changes = Vec::new();
        let mut page_token = stored_token;
        let final_token = loop {
            self.limiter.wait().await;
            let page = self.source.changes(&self.drive_id, &page_token).await?;
            changes.extend(page.changes);

            if let Some(next) = page.next_page_token {
                page_token = next;
            } else if let Some(new_start) = page.new_start_page_token {
                break new_start;
            } else {
                return Err(SyncError::DataAnomaly(
                    "change page carries neither a next nor a start token".to_string(),
                ));
            }
        };

        let mut difference = self.build_difference(&changes)?;
        reclassify_trashed(
            &mut difference,
            |item| Ok(self.store.get_file(&self.drive_id, &item.id)?.map(|f| f.trashed).unwrap_or(false)),
            |item| Ok(self.store.get_folder(&self.drive_id, &item.id)?.map(|f| f.trashed).unwrap_or(false)),
        )?;

        // Old paths must resolve against the pre-diff snapshot, so path
        // resolution runs before the diff is persisted.
        let affected = paths::resolve(&self.store, &self.drive_id, &difference)?;

        self.store.apply(&self.drive_id, &difference, &final_token)?;

        debug!(
            "Drive {}: incremental sync finished in {:.2?} ({} new, {} old)",
            self.drive_id,
            started.elapsed(),
            affected.new_folders.len(),
            affected.old_folders.len()
        );

        self.emit_scans(&affected)
    }

    /// Partitions the raw change feed against the stored snapshot.
    fn build_difference(&self, changes: &[Change]) -> Result<Difference, SyncError> {
        let mut difference = Difference::default();

        for change in changes {
            if change.removed {
                // A bare removal carries no metadata; the stored copy
                // tells us what disappeared. Never-seen items are no-ops.
                if let Some(old) = self.store.get_file(&self.drive_id, &change.id)? {
                    difference.removed_files.push(old);
                } else if let Some(old) = self.store.get_folder(&self.drive_id, &change.id)? {
                    difference.removed_folders.push(old);
                }
                continue;
            }

            let item = match &change.item {
                Some(item) => item,
                None => continue,
            };
            let new = DriveItem {
                id: item.id.clone(),
                name: item.name.clone(),
                parent: item.parent.clone(),
                trashed: item.trashed,
            };

            if item.is_folder {
                match self.store.get_folder(&self.drive_id, &item.id)? {
                    Some(old) => difference.changed_folders.push(ItemChange { old, new }),
                    None if item.trashed => {}
                    None => difference.added_folders.push(new),
                }
            } else {
                match self.store.get_file(&self.drive_id, &item.id)? {
                    Some(old) => difference.changed_files.push(ItemChange { old, new }),
                    None if item.trashed => {}
                    None => difference.added_files.push(new),
                }
            }
        }

        Ok(difference)
    }

    /// Rewrites, filters and deduplicates the affected paths, then hands
    /// the scans to the processor. A processor failure is fatal: it means
    /// the durable queue itself is broken.
    fn emit_scans(&self, affected: &Paths) -> Result<(), SyncError> {
        let scan_time = chrono::Utc::now().timestamp() + self.time_offset;

        let mut seen = HashSet::new();
        let mut scans = Vec::new();
        let mut added = 0;
        let mut removed = 0;

        for (folder, is_new) in affected
            .new_folders
            .iter()
            .map(|f| (f, true))
            .chain(affected.old_folders.iter().map(|f| (f, false)))
        {
            let rewritten = self.rewriter.rewrite(folder);

            if !seen.insert(rewritten.clone()) {
                continue;
            }
            if !self.filter.allows(&rewritten) {
                continue;
            }

            scans.push(Scan {
                folder: clean_path(&rewritten),
                relative_path: String::new(),
                priority: self.priority,
                time: scan_time,
            });

            if is_new {
                added += 1;
            } else {
                removed += 1;
            }
        }

        if scans.is_empty() {
            return Ok(());
        }

        (self.callback)(scans).map_err(|e| {
            SyncError::Fatal(format!("moving scans to processor: {e}"))
        })?;

        info!(
            "Drive {}: scans enqueued ({} added, {} removed)",
            self.drive_id, added, removed
        );

        Ok(())
    }
}

/// Runs `sync` to completion. Past the watchdog timeout a warning is
/// logged, but the future is still awaited rather than dropped.
async fn with_watchdog<F>(drive_id: &str, sync: F) -> Result<(), SyncError>
where
    F: std::future::Future<Output = Result<(), SyncError>>,
{
    tokio::pin!(sync);

    match tokio::time::timeout(SYNC_WATCHDOG, &mut sync).await {
        Ok(result) => result,
        Err(_elapsed) => {
            warn!(
                "Drive {}: sync exceeded watchdog timeout ({:?}), still waiting",
                drive_id, SYNC_WATCHDOG
            );
            sync.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::drive::source::ChangePage;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    const DRIVE: &str = "drive1";

    /// In-memory change feed: one page of scripted changes, then a fresh
    /// start token.
    struct FakeSource {
        pages: StdMutex<Vec<ChangePage>>,
        items: Vec<source::ChangeItem>,
    }

    #[async_trait]
    impl ChangeSource for FakeSource {
        async fn start_page_token(&self, _drive_id: &str) -> Result<String, SyncError> {
            Ok("start-1".to_string())
        }

        async fn changes(
            &self,
            _drive_id: &str,
            _page_token: &str,
        ) -> Result<ChangePage, SyncError> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                return Ok(ChangePage {
                    new_start_page_token: Some("start-next".to_string()),
                    ..Default::default()
                });
            }
            Ok(pages.remove(0))
        }

        async fn list_all(&self, _drive_id: &str) -> Result<Vec<source::ChangeItem>, SyncError> {
            Ok(self.items.clone())
        }
    }

    fn change_item(id: &str, name: &str, parent: &str, is_folder: bool) -> source::ChangeItem {
        source::ChangeItem {
            id: id.to_string(),
            name: name.to_string(),
            parent: parent.to_string(),
            trashed: false,
            is_folder,
        }
    }

    fn job_with(
        store: Arc<DriveStore>,
        fake: FakeSource,
        callback: ProcessorFn,
    ) -> SyncJob {
        SyncJob {
            drive_id: DRIVE.to_string(),
            priority: 3,
            time_offset: 0,
            rewriter: Rewriter::new(&[RewriteRule {
                from: "^/(.*)".into(),
                to: "/mnt/drive/$1".into(),
            }])
            .unwrap(),
            filter: Filter::new(&[], &[]).unwrap(),
            store,
            source: Arc::new(fake),
            limiter: limiter::for_account("test-account"),
            callback,
        }
    }

    fn collecting_callback() -> (ProcessorFn, Arc<StdMutex<Vec<Scan>>>) {
        let collected = Arc::new(StdMutex::new(Vec::new()));
        let sink = collected.clone();
        let callback: ProcessorFn = Arc::new(move |scans| {
            sink.lock().unwrap().extend(scans);
            Ok(())
        });
        (callback, collected)
    }

    fn open_store() -> (TempDir, Arc<DriveStore>) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("scanrelay.db")).unwrap());
        let store = Arc::new(DriveStore::new(db).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn test_full_sync_populates_store_without_scans() {
        let (_dir, store) = open_store();
        let (callback, collected) = collecting_callback();

        let fake = FakeSource {
            pages: StdMutex::new(Vec::new()),
            items: vec![
                change_item("media", "Media", DRIVE, true),
                change_item("ep1", "ep1.mkv", "media", false),
            ],
        };
        let job = job_with(store.clone(), fake, callback);

        let mut full_sync = true;
        job.run_once(&mut full_sync).await.unwrap();

        assert!(!full_sync, "successful full sync clears the flag");
        assert_eq!(store.page_token(DRIVE).unwrap().as_deref(), Some("start-1"));
        assert!(store.get_folder(DRIVE, "media").unwrap().is_some());
        assert!(store.get_file(DRIVE, "ep1").unwrap().is_some());
        assert!(collected.lock().unwrap().is_empty(), "full sync emits no scans");
    }

    #[tokio::test]
    async fn test_incremental_sync_emits_deduplicated_scans() {
        let (_dir, store) = open_store();
        store
            .replace_all(
                DRIVE,
                &[DriveItem {
                    id: "media".into(),
                    name: "Media".into(),
                    parent: DRIVE.into(),
                    trashed: false,
                }],
                &[],
                "start-0",
            )
            .unwrap();

        let (callback, collected) = collecting_callback();
        let fake = FakeSource {
            pages: StdMutex::new(vec![ChangePage {
                changes: vec![
                    Change {
                        id: "ep1".into(),
                        removed: false,
                        item: Some(change_item("ep1", "ep1.mkv", "media", false)),
                    },
                    Change {
                        id: "ep2".into(),
                        removed: false,
                        item: Some(change_item("ep2", "ep2.mkv", "media", false)),
                    },
                ],
                next_page_token: None,
                new_start_page_token: Some("start-1".into()),
            }]),
            items: Vec::new(),
        };
        let job = job_with(store.clone(), fake, callback);

        let mut full_sync = false;
        job.run_once(&mut full_sync).await.unwrap();

        let scans = collected.lock().unwrap();
        assert_eq!(scans.len(), 1, "two files in one folder coalesce");
        assert_eq!(scans[0].folder, "/mnt/drive/Media");
        assert_eq!(scans[0].priority, 3);

        // Diff and token persisted together.
        assert_eq!(store.page_token(DRIVE).unwrap().as_deref(), Some("start-1"));
        assert!(store.get_file(DRIVE, "ep1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_removal_emits_old_path_scan() {
        let (_dir, store) = open_store();
        store
            .replace_all(
                DRIVE,
                &[DriveItem {
                    id: "media".into(),
                    name: "Media".into(),
                    parent: DRIVE.into(),
                    trashed: false,
                }],
                &[DriveItem {
                    id: "ep1".into(),
                    name: "ep1.mkv".into(),
                    parent: "media".into(),
                    trashed: false,
                }],
                "start-0",
            )
            .unwrap();

        let (callback, collected) = collecting_callback();
        let fake = FakeSource {
            pages: StdMutex::new(vec![ChangePage {
                changes: vec![Change {
                    id: "ep1".into(),
                    removed: true,
                    item: None,
                }],
                next_page_token: None,
                new_start_page_token: Some("start-1".into()),
            }]),
            items: Vec::new(),
        };
        let job = job_with(store.clone(), fake, callback);

        let mut full_sync = false;
        job.run_once(&mut full_sync).await.unwrap();

        let scans = collected.lock().unwrap();
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].folder, "/mnt/drive/Media");

        assert!(
            store.get_file(DRIVE, "ep1").unwrap().is_none(),
            "removed file leaves the snapshot"
        );
    }

    #[tokio::test]
    async fn test_processor_failure_is_fatal() {
        let (_dir, store) = open_store();
        store
            .replace_all(
                DRIVE,
                &[DriveItem {
                    id: "media".into(),
                    name: "Media".into(),
                    parent: DRIVE.into(),
                    trashed: false,
                }],
                &[],
                "start-0",
            )
            .unwrap();

        let callback: ProcessorFn =
            Arc::new(|_| Err(ScanRelayError::Fatal("queue broken".into())));
        let fake = FakeSource {
            pages: StdMutex::new(vec![ChangePage {
                changes: vec![Change {
                    id: "ep1".into(),
                    removed: false,
                    item: Some(change_item("ep1", "ep1.mkv", "media", false)),
                }],
                next_page_token: None,
                new_start_page_token: Some("start-1".into()),
            }]),
            items: Vec::new(),
        };
        let job = job_with(store, fake, callback);

        let mut full_sync = false;
        let result = job.run_once(&mut full_sync).await;
        assert!(matches!(result, Err(SyncError::Fatal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_waits_for_completion() {
        // A sync that takes longer than the watchdog still completes and
        // returns its own result.
        let result = with_watchdog("drive1", async {
            tokio::time::sleep(SYNC_WATCHDOG + Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(result.is_ok());
    }
}
