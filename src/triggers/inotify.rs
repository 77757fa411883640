use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, trace};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::ScanRelayError;
use crate::filter::Filter;
use crate::rewrite::{RewriteRule, Rewriter};
use crate::scan::Scan;
use crate::triggers::ProcessorFn;
use crate::utils::clean_path;

/// Events for the same folder within this window collapse into one scan;
/// every new event pushes the firing time forward.
const COALESCE_WINDOW: Duration = Duration::from_secs(10);

const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct InotifyConfig {
    pub priority: i64,
    pub rewrite: Vec<RewriteRule>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub paths: Vec<InotifyPathConfig>,
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct InotifyPathConfig {
    pub path: String,
    pub rewrite: Vec<RewriteRule>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

struct WatchPath {
    path: String,
    rewriter: Rewriter,
    filter: Filter,
}

/// Starts a recursive watcher over every configured path and routes the
/// surviving events into a coalescing queue.
pub fn spawn(config: InotifyConfig, callback: ProcessorFn) -> Result<(), ScanRelayError> {
    let mut paths = Vec::with_capacity(config.paths.len());
    for path_config in &config.paths {
        let mut rewrite_rules = path_config.rewrite.clone();
        rewrite_rules.extend(config.rewrite.iter().cloned());

        let mut includes = path_config.include.clone();
        includes.extend(config.include.iter().cloned());
        let mut excludes = path_config.exclude.clone();
        excludes.extend(config.exclude.iter().cloned());

        paths.push(WatchPath {
            path: path_config.path.clone(),
            rewriter: Rewriter::new(&rewrite_rules)?,
            filter: Filter::new(&includes, &excludes)?,
        });
    }

    let (queue_tx, _queue_worker) = spawn_queue(callback, config.priority);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        let _ = event_tx.send(result);
    })
    .map_err(|e| ScanRelayError::Fatal(format!("creating filesystem watcher: {e}")))?;

    for watch_path in &paths {
        watcher
            .watch(Path::new(&watch_path.path), RecursiveMode::Recursive)
            .map_err(|e| {
                ScanRelayError::Fatal(format!("watching {}: {e}", watch_path.path))
            })?;
        debug!("Watch added: {}", watch_path.path);
    }

    tokio::spawn(event_worker(watcher, event_rx, paths, queue_tx));

    Ok(())
}

/// Consumes raw watcher events and feeds scan-worthy folders to the queue.
/// Owns the watcher: when this task ends, watching stops.
async fn event_worker(
    _watcher: RecommendedWatcher,
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    paths: Vec<WatchPath>,
    queue: mpsc::UnboundedSender<String>,
) {
    while let Some(result) = events.recv().await {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                error!("Filesystem events failed: {}", e);
                continue;
            }
        };

        trace!("FS event: {:?}", event);

        if !is_scan_worthy(&event) {
            continue;
        }

        for event_path in &event.paths {
            let raw = event_path.to_string_lossy();

            let watch_path = match paths.iter().find(|p| raw.starts_with(&p.path)) {
                Some(p) => p,
                None => {
                    error!("Path match failed: {}", raw);
                    continue;
                }
            };

            let mut rewritten = watch_path.rewriter.rewrite(&raw);
            if !watch_path.filter.allows(&rewritten) {
                continue;
            }

            // A file extension means the event was for a file; scan the
            // directory that holds it.
            if Path::new(&rewritten).extension().is_some() {
                if let Some(parent) = Path::new(&rewritten).parent() {
                    rewritten = parent.to_string_lossy().into_owned();
                }
            }

            if queue.send(rewritten).is_err() {
                return;
            }
        }
    }
}

/// Directory creations only extend the (recursive) watch. File creations,
/// renames and removals trigger a scan; everything else is noise.
fn is_scan_worthy(event: &Event) -> bool {
    match event.kind {
        EventKind::Create(_) => !event
            .paths
            .iter()
            .all(|p| p.metadata().map(|m| m.is_dir()).unwrap_or(false)),
        EventKind::Remove(_) => true,
        EventKind::Modify(ModifyKind::Name(_)) => true,
        _ => false,
    }
}

struct CoalescingQueue {
    callback: ProcessorFn,
    priority: i64,
    scans: Mutex<HashMap<String, Instant>>,
}

/// Spawns the queue worker and returns its input channel. Closing the
/// channel stops the worker.
fn spawn_queue(
    callback: ProcessorFn,
    priority: i64,
) -> (mpsc::UnboundedSender<String>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = Arc::new(CoalescingQueue {
        callback,
        priority,
        scans: Mutex::new(HashMap::new()),
    });

    let handle = tokio::spawn(queue_worker(queue, rx));

    (tx, handle)
}

async fn queue_worker(queue: Arc<CoalescingQueue>, mut inputs: mpsc::UnboundedReceiver<String>) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);

    loop {
        tokio::select! {
            input = inputs.recv() => match input {
                Some(folder) => queue.add(folder),
                None => return,
            },
            _ = ticker.tick() => queue.process(),
        }
    }
}

impl CoalescingQueue {
    fn add(&self, folder: String) {
        let mut scans = self.scans.lock().unwrap();
        scans.insert(folder, Instant::now() + COALESCE_WINDOW);
    }

    fn process(&self) {
        let due: Vec<String> = {
            let mut scans = self.scans.lock().unwrap();
            if scans.is_empty() {
                return;
            }

            let now = Instant::now();
            let ready: Vec<String> = scans
                .iter()
                .filter(|(_, fire_at)| **fire_at <= now)
                .map(|(folder, _)| folder.clone())
                .collect();

            for folder in &ready {
                scans.remove(folder);
            }

            ready
        };

        // Callbacks run outside the lock: the processor may block on the
        // database.
        let now = chrono::Utc::now().timestamp();
        for folder in due {
            let scan = Scan {
                folder: clean_path(&folder),
                relative_path: String::new(),
                priority: self.priority,
                time: now,
            };

            match (self.callback)(vec![scan]) {
                Ok(()) => info!("Inotify scan enqueued: {}", folder),
                Err(e) => error!("Inotify scan enqueue failed for {}: {}", folder, e),
            }
        }
    }
}
