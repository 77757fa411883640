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
pub struct RadarrConfig {
    pub name: String,
    pub priority: i64,
    pub rewrite: Vec<RewriteRule>,
}

impl Default for RadarrConfig {
    fn default() -> Self {
        Self {
            name: "radarr".to_string(),
            priority: 0,
            rewrite: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RadarrEvent {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(rename = "movieFile")]
    pub movie_file: RadarrFile,
    pub movie: RadarrMovie,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RadarrFile {
    #[serde(rename = "relativePath")]
    pub relative_path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RadarrMovie {
    #[serde(rename = "folderPath")]
    pub folder_path: String,
}

pub struct RadarrTrigger {
    pub name: String,
    priority: i64,
    rewriter: Rewriter,
    callback: ProcessorFn,
}

impl RadarrTrigger {
    pub fn new(
        config: &RadarrConfig,
        callback: ProcessorFn,
    ) -> Result<Arc<Self>, crate::error::ScanRelayError> {
        Ok(Arc::new(Self {
            name: config.name.clone(),
            priority: config.priority,
            rewriter: Rewriter::new(&config.rewrite)?,
            callback,
        }))
    }

    pub fn scan_for_event(&self, event: &RadarrEvent, now: i64) -> Result<Option<Scan>, ()> {
        let event_type = event.event_type.to_lowercase();

        let (folder, file) = match event_type.as_str() {
            "download" | "moviefiledelete" => {
                if event.movie_file.relative_path.is_empty() || event.movie.folder_path.is_empty()
                {
                    return Err(());
                }

                let full = format!(
                    "{}/{}",
                    event.movie.folder_path.trim_end_matches('/'),
                    event.movie_file.relative_path
                );
                split_folder_file(&full)
            }

            "moviedelete" | "rename" => {
                if event.movie.folder_path.is_empty() {
                    return Err(());
                }

                (event.movie.folder_path.clone(), String::new())
            }

            _ => return Ok(None),
        };

        Ok(Some(Scan {
            folder: self.rewriter.rewrite(&clean_path(&folder)),
            relative_path: file,
            priority: self.priority,
            time: now,
        }))
    }
}

pub async fn handle(
    State(trigger): State<Arc<RadarrTrigger>>,
    Json(event): Json<RadarrEvent>,
) -> StatusCode {
    if event.event_type.eq_ignore_ascii_case("test") {
        info!("Radarr trigger {}: test event", trigger.name);
        return StatusCode::OK;
    }

    let scan = match trigger.scan_for_event(&event, chrono::Utc::now().timestamp()) {
        Ok(Some(scan)) => scan,
        Ok(None) => return StatusCode::OK,
        Err(()) => {
            error!("Radarr trigger {}: required fields missing", trigger.name);
            return StatusCode::BAD_REQUEST;
        }
    };

    let folder = scan.folder.clone();
    if let Err(e) = (trigger.callback)(vec![scan]) {
        error!("Radarr trigger {}: scan enqueue failed: {}", trigger.name, e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    info!(
        "Radarr trigger {}: scan enqueued for {} ({})",
        trigger.name, folder, event.event_type
    );

    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger() -> Arc<RadarrTrigger> {
        let callback: ProcessorFn = Arc::new(|_| Ok(()));
        RadarrTrigger::new(
            &RadarrConfig {
                name: "radarr".into(),
                priority: 2,
                rewrite: vec![RewriteRule {
                    from: "^/Movies/(.*)".into(),
                    to: "/mnt/unionfs/Media/Movies/$1".into(),
                }],
            },
            callback,
        )
        .unwrap()
    }

    #[test]
    fn test_download_event() {
        let event = RadarrEvent {
            event_type: "Download".into(),
            movie_file: RadarrFile {
                relative_path: "Alien.1979.mkv".into(),
            },
            movie: RadarrMovie {
                folder_path: "/Movies/Alien (1979)".into(),
            },
        };

        let scan = trigger().scan_for_event(&event, 100).unwrap().unwrap();
        assert_eq!(scan.folder, "/mnt/unionfs/Media/Movies/Alien (1979)");
        assert_eq!(scan.relative_path, "Alien.1979.mkv");
        assert_eq!(scan.priority, 2);
    }

    #[test]
    fn test_movie_delete_scans_folder() {
        let event = RadarrEvent {
            event_type: "MovieDelete".into(),
            movie: RadarrMovie {
                folder_path: "/Movies/Alien (1979)".into(),
            },
            ..Default::default()
        };

        let scan = trigger().scan_for_event(&event, 100).unwrap().unwrap();
        assert_eq!(scan.folder, "/mnt/unionfs/Media/Movies/Alien (1979)");
        assert_eq!(scan.relative_path, "");
    }

    #[test]
    fn test_missing_fields() {
        let event = RadarrEvent {
            event_type: "Download".into(),
            ..Default::default()
        };

        assert!(trigger().scan_for_event(&event, 100).is_err());
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        let event = RadarrEvent {
            event_type: "Grab".into(),
            ..Default::default()
        };

        assert!(trigger().scan_for_event(&event, 100).unwrap().is_none());
    }
}
