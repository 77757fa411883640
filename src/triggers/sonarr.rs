use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use log::{error, info};
use serde::Deserialize;

use crate::rewrite::{RewriteRule, Rewriter};
use crate::scan::Scan;
use crate::triggers::ProcessorFn;
use crate::utils::{clean_path, split_folder_file};

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SonarrConfig {
    pub name: String,
    pub priority: i64,
    pub rewrite: Vec<RewriteRule>,
}

impl Default for SonarrConfig {
    fn default() -> Self {
        Self {
            name: "sonarr".to_string(),
            priority: 0,
            rewrite: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SonarrEvent {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(rename = "episodeFile")]
    pub episode_file: SonarrFile,
    pub series: SonarrSeries,
    #[serde(rename = "renamedEpisodeFiles")]
    pub renamed_files: Vec<SonarrRenamedFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SonarrFile {
    #[serde(rename = "relativePath")]
    pub relative_path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SonarrSeries {
    pub path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SonarrRenamedFile {
    /// The series path may have changed as part of the rename, so the
    /// previous location carries its own full path.
    #[serde(rename = "previousPath")]
    pub previous_path: String,
    #[serde(rename = "relativePath")]
    pub relative_path: String,
}

pub struct SonarrTrigger {
    pub name: String,
    priority: i64,
    rewriter: Rewriter,
    callback: ProcessorFn,
}

impl SonarrTrigger {
    pub fn new(
        config: &SonarrConfig,
        callback: ProcessorFn,
    ) -> Result<Arc<Self>, crate::error::ScanRelayError> {
        Ok(Arc::new(Self {
            name: config.name.clone(),
            priority: config.priority,
            rewriter: Rewriter::new(&config.rewrite)?,
            callback,
        }))
    }

    /// Maps an event to `folder -> relative file` pairs. `Err` means a
    /// required field was missing; an empty map means nothing to scan.
    pub fn paths_for_event(event: &SonarrEvent) -> Result<HashMap<String, String>, ()> {
        let event_type = event.event_type.to_lowercase();

        match event_type.as_str() {
            "download" | "episodefiledelete" => {
                if event.episode_file.relative_path.is_empty() || event.series.path.is_empty() {
                    return Err(());
                }

                let full = format!(
                    "{}/{}",
                    event.series.path.trim_end_matches('/'),
                    event.episode_file.relative_path
                );
                let (folder, file) = split_folder_file(&full);
                Ok(HashMap::from([(folder, file)]))
            }

            "seriesdelete" => {
                if event.series.path.is_empty() {
                    return Err(());
                }

                Ok(HashMap::from([(event.series.path.clone(), String::new())]))
            }

            "rename" => {
                if event.series.path.is_empty() {
                    return Err(());
                }

                let mut paths = HashMap::new();
                for renamed in &event.renamed_files {
                    let (previous_folder, previous_file) =
                        split_folder_file(&renamed.previous_path);
                    let current = format!(
                        "{}/{}",
                        event.series.path.trim_end_matches('/'),
                        renamed.relative_path
                    );
                    let (current_folder, current_file) = split_folder_file(&current);

                    paths.entry(previous_folder).or_insert(previous_file);
                    paths.entry(current_folder).or_insert(current_file);
                }

                Ok(paths)
            }

            _ => Ok(HashMap::new()),
        }
    }

    pub fn scans_for_event(&self, event: &SonarrEvent, now: i64) -> Result<Vec<Scan>, ()> {
        let paths = Self::paths_for_event(event)?;

        Ok(paths
            .into_iter()
            .map(|(folder, file)| Scan {
                folder: self.rewriter.rewrite(&clean_path(&folder)),
                relative_path: file,
                priority: self.priority,
                time: now,
            })
            .collect())
    }
}

pub async fn handle(
    State(trigger): State<Arc<SonarrTrigger>>,
    Json(event): Json<SonarrEvent>,
) -> StatusCode {
    if event.event_type.eq_ignore_ascii_case("test") {
        info!("Sonarr trigger {}: test event", trigger.name);
        return StatusCode::OK;
    }

    let scans = match trigger.scans_for_event(&event, chrono::Utc::now().timestamp()) {
        Ok(scans) => scans,
        Err(()) => {
            error!("Sonarr trigger {}: required fields missing", trigger.name);
            return StatusCode::BAD_REQUEST;
        }
    };

    if let Err(e) = (trigger.callback)(scans.clone()) {
        error!("Sonarr trigger {}: scan enqueue failed: {}", trigger.name, e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    for scan in &scans {
        info!(
            "Sonarr trigger {}: scan enqueued for {} ({})",
            trigger.name, scan.folder, event.event_type
        );
    }

    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(rules: Vec<RewriteRule>) -> Arc<SonarrTrigger> {
        let callback: ProcessorFn = Arc::new(|_| Ok(()));
        SonarrTrigger::new(
            &SonarrConfig {
                name: "sonarr".into(),
                priority: 5,
                rewrite: rules,
            },
            callback,
        )
        .unwrap()
    }

    fn tv_rewrite() -> Vec<RewriteRule> {
        vec![RewriteRule {
            from: "^/TV/(.*)".into(),
            to: "/mnt/unionfs/Media/TV/$1".into(),
        }]
    }

    #[test]
    fn test_download_event() {
        let event = SonarrEvent {
            event_type: "Download".into(),
            episode_file: SonarrFile {
                relative_path: "Season 1/S01E01.mkv".into(),
            },
            series: SonarrSeries {
                path: "/TV/Westworld".into(),
            },
            renamed_files: Vec::new(),
        };

        let t = trigger(tv_rewrite());
        let scans = t.scans_for_event(&event, 100).unwrap();

        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].folder, "/mnt/unionfs/Media/TV/Westworld/Season 1");
        assert_eq!(scans[0].relative_path, "S01E01.mkv");
        assert_eq!(scans[0].priority, 5);
    }

    #[test]
    fn test_download_missing_fields() {
        let event = SonarrEvent {
            event_type: "Download".into(),
            ..Default::default()
        };

        assert!(SonarrTrigger::paths_for_event(&event).is_err());
    }

    #[test]
    fn test_series_delete_scans_series_root() {
        let event = SonarrEvent {
            event_type: "SeriesDelete".into(),
            series: SonarrSeries {
                path: "/TV/Westworld".into(),
            },
            ..Default::default()
        };

        let t = trigger(tv_rewrite());
        let scans = t.scans_for_event(&event, 100).unwrap();

        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].folder, "/mnt/unionfs/Media/TV/Westworld");
        assert_eq!(scans[0].relative_path, "");
    }

    #[test]
    fn test_rename_deduplicates_by_folder() {
        // Two renames in Season 1, one in Season 2, and the previous paths
        // live under the old series folder: four distinct folders total.
        let event = SonarrEvent {
            event_type: "Rename".into(),
            series: SonarrSeries {
                path: "/TV/Westworld".into(),
            },
            renamed_files: vec![
                SonarrRenamedFile {
                    previous_path: "/TV/Westworld (2016)/Season 1/old1.mkv".into(),
                    relative_path: "Season 1/S01E01.mkv".into(),
                },
                SonarrRenamedFile {
                    previous_path: "/TV/Westworld (2016)/Season 1/old2.mkv".into(),
                    relative_path: "Season 1/S01E02.mkv".into(),
                },
                SonarrRenamedFile {
                    previous_path: "/TV/Westworld (2016)/Season 2/old3.mkv".into(),
                    relative_path: "Season 2/S02E01.mkv".into(),
                },
            ],
            ..Default::default()
        };

        let t = trigger(tv_rewrite());
        let scans = t.scans_for_event(&event, 100).unwrap();

        assert_eq!(scans.len(), 4, "each folder appears exactly once");

        let mut folders: Vec<&str> = scans.iter().map(|s| s.folder.as_str()).collect();
        folders.sort_unstable();
        assert_eq!(
            folders,
            vec![
                "/mnt/unionfs/Media/TV/Westworld (2016)/Season 1",
                "/mnt/unionfs/Media/TV/Westworld (2016)/Season 2",
                "/mnt/unionfs/Media/TV/Westworld/Season 1",
                "/mnt/unionfs/Media/TV/Westworld/Season 2",
            ]
        );

        assert!(scans.iter().all(|s| s.priority == 5));
    }

    #[test]
    fn test_unknown_event_produces_no_scans() {
        let event = SonarrEvent {
            event_type: "Grab".into(),
            ..Default::default()
        };

        let t = trigger(Vec::new());
        let scans = t.scans_for_event(&event, 100).unwrap();
        assert!(scans.is_empty());
    }
}
