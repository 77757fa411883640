use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use log::{error, info};
use serde::Deserialize;

use crate::rewrite::{RewriteRule, Rewriter};
use crate::scan::Scan;
use crate::triggers::ProcessorFn;
use crate::utils::split_folder_file;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LidarrConfig {
    pub name: String,
    pub priority: i64,
    pub rewrite: Vec<RewriteRule>,
}

impl Default for LidarrConfig {
    fn default() -> Self {
        Self {
            name: "lidarr".to_string(),
            priority: 0,
            rewrite: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LidarrEvent {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(rename = "trackFiles")]
    pub track_files: Vec<LidarrFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LidarrFile {
    pub path: String,
}

pub struct LidarrTrigger {
    pub name: String,
    priority: i64,
    rewriter: Rewriter,
    callback: ProcessorFn,
}

impl LidarrTrigger {
    pub fn new(
        config: &LidarrConfig,
        callback: ProcessorFn,
    ) -> Result<Arc<Self>, crate::error::ScanRelayError> {
        Ok(Arc::new(Self {
            name: config.name.clone(),
            priority: config.priority,
            rewriter: Rewriter::new(&config.rewrite)?,
            callback,
        }))
    }

    /// One scan per distinct parent folder of the track paths. Rewrite
    /// runs after the folder/file split so rules see the folder.
    pub fn scans_for_event(&self, event: &LidarrEvent, now: i64) -> Vec<Scan> {
        let mut seen = HashSet::new();
        let mut scans = Vec::new();

        for file in &event.track_files {
            let (folder, _) = split_folder_file(&file.path);
            let folder = self.rewriter.rewrite(&folder);
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
    State(trigger): State<Arc<LidarrTrigger>>,
    Json(event): Json<LidarrEvent>,
) -> StatusCode {
    if event.event_type.eq_ignore_ascii_case("test") {
        info!("Lidarr trigger {}: test event", trigger.name);
        return StatusCode::OK;
    }

    if !event.event_type.eq_ignore_ascii_case("download") || event.track_files.is_empty() {
        error!("Lidarr trigger {}: required fields missing", trigger.name);
        return StatusCode::BAD_REQUEST;
    }

    let scans = trigger.scans_for_event(&event, chrono::Utc::now().timestamp());

    if let Err(e) = (trigger.callback)(scans.clone()) {
        error!("Lidarr trigger {}: scan enqueue failed: {}", trigger.name, e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    for scan in &scans {
        info!(
            "Lidarr trigger {}: scan enqueued for {} ({})",
            trigger.name, scan.folder, event.event_type
        );
    }

    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger() -> Arc<LidarrTrigger> {
        let callback: ProcessorFn = Arc::new(|_| Ok(()));
        LidarrTrigger::new(
            &LidarrConfig {
                name: "lidarr".into(),
                priority: 1,
                rewrite: Vec::new(),
            },
            callback,
        )
        .unwrap()
    }

    #[test]
    fn test_tracks_deduplicate_by_folder() {
        let event = LidarrEvent {
            event_type: "Download".into(),
            track_files: vec![
                LidarrFile {
                    path: "/Music/Artist/Album/01.flac".into(),
                },
                LidarrFile {
                    path: "/Music/Artist/Album/02.flac".into(),
                },
                LidarrFile {
                    path: "/Music/Artist/Other Album/01.flac".into(),
                },
            ],
        };

        let scans = trigger().scans_for_event(&event, 100);
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].folder, "/Music/Artist/Album");
        assert_eq!(scans[1].folder, "/Music/Artist/Other Album");
        assert!(scans.iter().all(|s| s.relative_path.is_empty()));
    }

    #[test]
    fn test_rewrite_applies_to_folder_after_split() {
        let callback: ProcessorFn = Arc::new(|_| Ok(()));
        // Anchored to the folder: the rule would never match the full
        // track path, so this fails if rewriting runs before the split.
        let trigger = LidarrTrigger::new(
            &LidarrConfig {
                name: "lidarr".into(),
                priority: 1,
                rewrite: vec![RewriteRule {
                    from: "^/Music/(.*)/Album$".into(),
                    to: "/mnt/unionfs/Media/Music/$1/Album".into(),
                }],
            },
            callback,
        )
        .unwrap();

        let event = LidarrEvent {
            event_type: "Download".into(),
            track_files: vec![LidarrFile {
                path: "/Music/Artist/Album/01.flac".into(),
            }],
        };

        let scans = trigger.scans_for_event(&event, 100);
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].folder, "/mnt/unionfs/Media/Music/Artist/Album");
    }
}
