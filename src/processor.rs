use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::database::Database;
use crate::error::ScanRelayError;
use crate::scan::Scan;
use crate::stats::Stats;
use crate::store::ScanStore;
use crate::targets::Target;

/// Overall deadline for one dispatch or availability fan-out.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(90);

pub struct ProcessorConfig {
    pub anchors: Vec<PathBuf>,
    pub minimum_age: Duration,
    pub stats: Arc<Stats>,
    pub db: Arc<Database>,
}

/// Owns the scan store and drives dispatch.
///
/// `process` runs under a mutex so at most one dispatch is in flight across
/// the whole process; triggers keep feeding `add` concurrently.
pub struct Processor {
    anchors: Vec<PathBuf>,
    anchor_state: StdMutex<HashMap<PathBuf, bool>>,
    minimum_age: Duration,
    store: ScanStore,
    stats: Arc<Stats>,
    db: Arc<Database>,
    dispatch_lock: Mutex<()>,
}

impl Processor {
    pub fn new(config: ProcessorConfig) -> Result<Self, ScanRelayError> {
        let store = ScanStore::new(config.db.clone())?;

        Ok(Self {
            anchors: config.anchors,
            anchor_state: StdMutex::new(HashMap::new()),
            minimum_age: config.minimum_age,
            store,
            stats: config.stats,
            db: config.db,
            dispatch_lock: Mutex::new(()),
        })
    }

    /// Accepts scans from any trigger: counts them as received, then merges
    /// them into the store.
    pub fn add(&self, scans: Vec<Scan>) -> Result<(), ScanRelayError> {
        self.stats
            .received
            .fetch_add(scans.len() as i64, Ordering::Relaxed);
        self.store.upsert(&scans)
    }

    pub fn remaining(&self) -> Result<i64, ScanRelayError> {
        self.store.remaining()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    #[cfg(test)]
    pub fn store(&self) -> &ScanStore {
        &self.store
    }

    /// Dispatches the next eligible scan to every target concurrently.
    ///
    /// The row is deleted only after all targets accepted it; any failure
    /// leaves the row in place for a later retry.
    pub async fn process(&self, targets: &[Arc<dyn Target>]) -> Result<(), ScanRelayError> {
        let _guard = self.dispatch_lock.lock().await;

        let scan = self.store.next_eligible(self.minimum_age)?;

        for anchor in &self.anchors {
            if !path_exists(anchor) {
                return Err(ScanRelayError::AnchorUnavailable(
                    anchor.display().to_string(),
                ));
            }
        }

        let scan = Arc::new(scan);
        let mut set = JoinSet::new();
        for target in targets {
            let target = target.clone();
            let scan = scan.clone();
            set.spawn(async move { target.scan(&scan).await });
        }
        join_with_deadline(set).await?;

        self.store.delete(&scan.folder)?;
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Checks all targets concurrently; returns the first failure.
    pub async fn check_availability(
        &self,
        targets: &[Arc<dyn Target>],
    ) -> Result<(), ScanRelayError> {
        let mut set = JoinSet::new();
        for target in targets {
            let target = target.clone();
            set.spawn(async move { target.available().await });
        }

        join_with_deadline(set).await
    }

    /// True iff every configured anchor path exists. Availability changes
    /// are logged once per transition, never on steady state.
    pub fn check_anchors(&self) -> bool {
        let mut all_present = true;
        let mut state = self.anchor_state.lock().unwrap();

        for anchor in &self.anchors {
            let present = path_exists(anchor);
            let previous = state.insert(anchor.clone(), present);

            if previous != Some(present) {
                if present {
                    info!("Anchor available: {}", anchor.display());
                } else {
                    warn!("Anchor unavailable: {}", anchor.display());
                }
            }

            all_present &= present;
        }

        all_present
    }

    /// Closes the scan store's database.
    pub fn close(&self) {
        self.db.close();
    }
}

/// Waits for every spawned target call, bounded by the dispatch deadline.
/// All calls are drained even after a failure; the first error wins.
async fn join_with_deadline(
    mut set: JoinSet<Result<(), ScanRelayError>>,
) -> Result<(), ScanRelayError> {
    let drained = tokio::time::timeout(DISPATCH_TIMEOUT, async {
        let mut first_error = None;

        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(ScanRelayError::Fatal(format!("target task failed: {e}"))),
            };

            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        first_error
    })
    .await;

    match drained {
        Ok(None) => Ok(()),
        Ok(Some(e)) => Err(e),
        Err(_elapsed) => {
            set.abort_all();
            Err(ScanRelayError::TargetUnavailable(
                "dispatch deadline exceeded".to_string(),
            ))
        }
    }
}

fn path_exists(path: &std::path::Path) -> bool {
    // Anchors may be files or directories; only presence matters.
    std::fs::metadata(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicI64;
    use tempfile::TempDir;

    enum Behaviour {
        Ok,
        Unavailable,
    }

    struct FakeTarget {
        behaviour: Behaviour,
        calls: AtomicI64,
    }

    impl FakeTarget {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: AtomicI64::new(0),
            })
        }
    }

    #[async_trait]
    impl Target for FakeTarget {
        fn name(&self) -> &str {
            "fake"
        }

        async fn scan(&self, _scan: &Scan) -> Result<(), ScanRelayError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.behaviour {
                Behaviour::Ok => Ok(()),
                Behaviour::Unavailable => {
                    Err(ScanRelayError::TargetUnavailable("offline".into()))
                }
            }
        }

        async fn available(&self) -> Result<(), ScanRelayError> {
            match self.behaviour {
                Behaviour::Ok => Ok(()),
                Behaviour::Unavailable => {
                    Err(ScanRelayError::TargetUnavailable("offline".into()))
                }
            }
        }
    }

    fn new_processor(anchors: Vec<PathBuf>) -> (TempDir, Processor) {
        let dir = TempDir::new().expect("temp dir");
        let db = Arc::new(Database::open(&dir.path().join("scanrelay.db")).expect("open"));
        let processor = Processor::new(ProcessorConfig {
            anchors,
            minimum_age: Duration::from_secs(0),
            stats: Arc::new(Stats::new()),
            db,
        })
        .expect("processor");
        (dir, processor)
    }

    fn eligible_scan(folder: &str) -> Scan {
        Scan {
            folder: folder.to_string(),
            relative_path: String::new(),
            priority: 1,
            time: chrono::Utc::now().timestamp() - 60,
        }
    }

    #[tokio::test]
    async fn test_process_with_no_scans() {
        let (_dir, processor) = new_processor(Vec::new());
        let targets: Vec<Arc<dyn Target>> = vec![FakeTarget::new(Behaviour::Ok)];

        let result = processor.process(&targets).await;
        assert!(matches!(result, Err(ScanRelayError::NoScans)));
    }

    #[tokio::test]
    async fn test_successful_process_removes_row_and_counts() {
        let (_dir, processor) = new_processor(Vec::new());
        processor.add(vec![eligible_scan("/media/F")]).unwrap();

        let t1 = FakeTarget::new(Behaviour::Ok);
        let t2 = FakeTarget::new(Behaviour::Ok);
        let targets: Vec<Arc<dyn Target>> = vec![t1.clone(), t2.clone()];

        processor.process(&targets).await.unwrap();

        assert_eq!(processor.remaining().unwrap(), 0);
        assert_eq!(processor.stats().snapshot().processed, 1);
        assert_eq!(t1.calls.load(Ordering::Relaxed), 1);
        assert_eq!(t2.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_failed_process_keeps_row() {
        let (_dir, processor) = new_processor(Vec::new());
        let scan = eligible_scan("/media/F");
        processor.add(vec![scan.clone()]).unwrap();

        let targets: Vec<Arc<dyn Target>> = vec![
            FakeTarget::new(Behaviour::Ok),
            FakeTarget::new(Behaviour::Unavailable),
        ];

        let result = processor.process(&targets).await;
        assert!(matches!(result, Err(ScanRelayError::TargetUnavailable(_))));

        let rows = processor.store().all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], scan, "failed dispatch must not mutate the row");
        assert_eq!(processor.stats().snapshot().processed, 0);
    }

    #[tokio::test]
    async fn test_missing_anchor_gates_dispatch() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("not-mounted");
        let (_db_dir, processor) = new_processor(vec![missing]);
        processor.add(vec![eligible_scan("/media/F")]).unwrap();

        let targets: Vec<Arc<dyn Target>> = vec![FakeTarget::new(Behaviour::Ok)];
        let result = processor.process(&targets).await;
        assert!(matches!(result, Err(ScanRelayError::AnchorUnavailable(_))));

        assert_eq!(processor.remaining().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_check_anchors_accepts_files_and_directories() {
        let dir = TempDir::new().unwrap();
        let file_anchor = dir.path().join("anchor.txt");
        std::fs::write(&file_anchor, "present").unwrap();
        let dir_anchor = dir.path().to_path_buf();

        let (_db_dir, processor) = new_processor(vec![file_anchor, dir_anchor]);
        assert!(processor.check_anchors());
    }

    #[tokio::test]
    async fn test_check_anchors_with_no_anchors() {
        let (_dir, processor) = new_processor(Vec::new());
        assert!(processor.check_anchors());
    }

    #[tokio::test]
    async fn test_check_anchors_recovers_after_return() {
        let dir = TempDir::new().unwrap();
        let anchor = dir.path().join("mount");
        let (_db_dir, processor) = new_processor(vec![anchor.clone()]);

        assert!(!processor.check_anchors());

        std::fs::create_dir(&anchor).unwrap();
        assert!(processor.check_anchors());
    }

    #[tokio::test]
    async fn test_check_availability_reports_first_failure() {
        let (_dir, processor) = new_processor(Vec::new());

        let ok: Vec<Arc<dyn Target>> = vec![FakeTarget::new(Behaviour::Ok)];
        processor.check_availability(&ok).await.unwrap();

        let mixed: Vec<Arc<dyn Target>> = vec![
            FakeTarget::new(Behaviour::Ok),
            FakeTarget::new(Behaviour::Unavailable),
        ];
        let result = processor.check_availability(&mixed).await;
        assert!(matches!(result, Err(ScanRelayError::TargetUnavailable(_))));
    }

    #[tokio::test]
    async fn test_add_counts_received() {
        let (_dir, processor) = new_processor(Vec::new());
        processor
            .add(vec![eligible_scan("/a"), eligible_scan("/b")])
            .unwrap();

        assert_eq!(processor.stats().snapshot().received, 2);
    }
}
