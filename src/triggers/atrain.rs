use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use log::{error, info};
use serde::Deserialize;

use crate::rewrite::{RewriteRule, Rewriter};
use crate::scan::Scan;
use crate::triggers::ProcessorFn;

/// Webhook trigger for drive-change push notifications: the sender resolves
/// drive deltas itself and posts the affected paths per drive id.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct AtrainConfig {
    pub priority: i64,
    pub rewrite: Vec<RewriteRule>,
    pub drives: Vec<AtrainDriveConfig>,
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct AtrainDriveConfig {
    pub id: String,
    pub rewrite: Vec<RewriteRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AtrainEvent {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
}

pub struct AtrainTrigger {
    priority: i64,
    global_rewriter: Rewriter,
    drive_rewriters: HashMap<String, Rewriter>,
    callback: ProcessorFn,
}

impl AtrainTrigger {
    pub fn new(
        config: &AtrainConfig,
        callback: ProcessorFn,
    ) -> Result<Arc<Self>, crate::error::ScanRelayError> {
        let mut drive_rewriters = HashMap::new();
        for drive in &config.drives {
            let mut rules = drive.rewrite.clone();
            rules.extend(config.rewrite.iter().cloned());
            drive_rewriters.insert(drive.id.clone(), Rewriter::new(&rules)?);
        }

        Ok(Arc::new(Self {
            priority: config.priority,
            global_rewriter: Rewriter::new(&config.rewrite)?,
            drive_rewriters,
            callback,
        }))
    }

    fn rewrite(&self, drive: &str, input: &str) -> String {
        match self.drive_rewriters.get(drive) {
            Some(rewriter) => rewriter.rewrite(input),
            None => self.global_rewriter.rewrite(input),
        }
    }

    /// One scan per distinct rewritten folder; a path showing up in both
    /// `created` and `deleted` collapses to a single scan.
    pub fn scans_for_event(&self, drive: &str, event: &AtrainEvent, now: i64) -> Vec<Scan> {
        let mut seen = HashSet::new();
        let mut scans = Vec::new();

        for path in event.created.iter().chain(event.deleted.iter()) {
            let folder = self.rewrite(drive, path);
            if !seen.insert(folder.clone()) {
                continue;
            }

            scans.push(Scan {
                folder,
                relative_path: String::new(),
                priority: self.priority,
                time: now,
            });
        }

        scans
    }
}

pub async fn handle(
    State(trigger): State<Arc<AtrainTrigger>>,
    Path(drive): Path<String>,
    Json(event): Json<AtrainEvent>,
) -> StatusCode {
    let scans = trigger.scans_for_event(&drive, &event, chrono::Utc::now().timestamp());

    if let Err(e) = (trigger.callback)(scans.clone()) {
        error!("A-Train trigger: scan enqueue failed: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    for scan in &scans {
        info!("A-Train trigger: scan enqueued for {}", scan.folder);
    }

    StatusCode::OK
}
