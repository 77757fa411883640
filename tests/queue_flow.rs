//! End-to-end flow through the durable queue: triggers add, the processor
//! merges, dispatches, and only forgets what every target accepted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use scanrelay::database::Database;
use scanrelay::error::ScanRelayError;
use scanrelay::processor::{Processor, ProcessorConfig};
use scanrelay::scan::Scan;
use scanrelay::stats::Stats;
use scanrelay::targets::Target;

struct FlakyTarget {
    healthy: AtomicBool,
}

#[async_trait]
impl Target for FlakyTarget {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn scan(&self, _scan: &Scan) -> Result<(), ScanRelayError> {
        if self.healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(ScanRelayError::TargetUnavailable("down".into()))
        }
    }

    async fn available(&self) -> Result<(), ScanRelayError> {
        if self.healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(ScanRelayError::TargetUnavailable("down".into()))
        }
    }
}

fn processor_in(dir: &TempDir) -> Arc<Processor> {
    let db = Arc::new(Database::open(&dir.path().join("scanrelay.db")).unwrap());
    Arc::new(
        Processor::new(ProcessorConfig {
            anchors: Vec::<PathBuf>::new(),
            minimum_age: Duration::from_secs(0),
            stats: Arc::new(Stats::new()),
            db,
        })
        .unwrap(),
    )
}

fn scan(folder: &str, priority: i64) -> Scan {
    Scan {
        folder: folder.to_string(),
        relative_path: String::new(),
        priority,
        time: chrono::Utc::now().timestamp() - 60,
    }
}

#[tokio::test]
async fn test_duplicate_adds_merge_and_dispatch_once() {
    let dir = TempDir::new().unwrap();
    let processor = processor_in(&dir);

    // The same folder from two triggers at different priorities.
    processor.add(vec![scan("/media/F", 2)]).unwrap();
    processor.add(vec![scan("/media/F", 5)]).unwrap();
    assert_eq!(processor.remaining().unwrap(), 1);

    let target = Arc::new(FlakyTarget {
        healthy: AtomicBool::new(true),
    });
    let targets: Vec<Arc<dyn Target>> = vec![target];

    processor.process(&targets).await.unwrap();
    assert_eq!(processor.remaining().unwrap(), 0);

    let snapshot = processor.stats().snapshot();
    assert_eq!(snapshot.received, 2);
    assert_eq!(snapshot.processed, 1);
}

#[tokio::test]
async fn test_unavailable_target_keeps_work_until_recovery() {
    let dir = TempDir::new().unwrap();
    let processor = processor_in(&dir);

    processor.add(vec![scan("/media/F", 1)]).unwrap();

    let target = Arc::new(FlakyTarget {
        healthy: AtomicBool::new(false),
    });
    let targets: Vec<Arc<dyn Target>> = vec![target.clone()];

    // Down: the scan survives the failed dispatch.
    let result = processor.process(&targets).await;
    assert!(matches!(result, Err(ScanRelayError::TargetUnavailable(_))));
    assert_eq!(processor.remaining().unwrap(), 1);

    // The availability gate stays closed while the target is down.
    assert!(processor.check_availability(&targets).await.is_err());

    // Recovery: the gate opens and the queued scan drains.
    target.healthy.store(true, Ordering::Relaxed);
    processor.check_availability(&targets).await.unwrap();
    processor.process(&targets).await.unwrap();
    assert_eq!(processor.remaining().unwrap(), 0);
}

#[tokio::test]
async fn test_queue_survives_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let processor = processor_in(&dir);
        processor.add(vec![scan("/media/F", 3)]).unwrap();
        processor.close();
    }

    // A fresh processor over the same database still sees the scan.
    let processor = processor_in(&dir);
    assert_eq!(processor.remaining().unwrap(), 1);

    let target = Arc::new(FlakyTarget {
        healthy: AtomicBool::new(true),
    });
    let targets: Vec<Arc<dyn Target>> = vec![target];
    processor.process(&targets).await.unwrap();
    assert_eq!(processor.remaining().unwrap(), 0);
}
