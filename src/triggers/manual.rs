use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use log::{error, info};
use serde::Deserialize;

use crate::rewrite::{RewriteRule, Rewriter};
use crate::scan::Scan;
use crate::triggers::ProcessorFn;
use crate::utils::{clean_path, split_folder_file};

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ManualConfig {
    pub priority: i64,
    pub rewrite: Vec<RewriteRule>,
}

pub struct ManualTrigger {
    priority: i64,
    rewriter: Rewriter,
    callback: ProcessorFn,
}

const FORM_TEMPLATE: &str = include_str!("manual.html");

impl ManualTrigger {
    pub fn new(
        config: &ManualConfig,
        callback: ProcessorFn,
    ) -> Result<Arc<Self>, crate::error::ScanRelayError> {
        Ok(Arc::new(Self {
            priority: config.priority,
            rewriter: Rewriter::new(&config.rewrite)?,
            callback,
        }))
    }

    /// Translates `dir` and `path` query values into scans. Rewrite runs
    /// after the folder/file split so rules see the folder path; repeated
    /// folder/file pairs within one request collapse to a single scan.
    pub fn scans_for_request(&self, dirs: &[String], paths: &[String], now: i64) -> Vec<Scan> {
        let mut seen = HashSet::new();
        let mut scans = Vec::with_capacity(dirs.len() + paths.len());

        for dir in dirs {
            let folder = self.rewriter.rewrite(&clean_path(dir));
            if !seen.insert((folder.clone(), String::new())) {
                continue;
            }

            scans.push(Scan {
                folder,
                relative_path: String::new(),
                priority: self.priority,
                time: now,
            });
        }

        for path in paths {
            let (folder, file) = split_folder_file(path);
            let folder = self.rewriter.rewrite(&clean_path(&folder));
            if !seen.insert((folder.clone(), file.clone())) {
                continue;
            }

            scans.push(Scan {
                folder,
                relative_path: file,
                priority: self.priority,
                time: now,
            });
        }

        scans
    }
}

pub async fn form() -> Html<&'static str> {
    Html(FORM_TEMPLATE)
}

pub async fn handle(
    State(trigger): State<Arc<ManualTrigger>>,
    Query(params): Query<Vec<(String, String)>>,
) -> StatusCode {
    let dirs: Vec<String> = params
        .iter()
        .filter(|(k, _)| k == "dir")
        .map(|(_, v)| v.clone())
        .collect();
    let paths: Vec<String> = params
        .iter()
        .filter(|(k, _)| k == "path")
        .map(|(_, v)| v.clone())
        .collect();

    if dirs.is_empty() && paths.is_empty() {
        error!("Manual trigger: empty request");
        return StatusCode::BAD_REQUEST;
    }

    let scans = trigger.scans_for_request(&dirs, &paths, chrono::Utc::now().timestamp());

    if let Err(e) = (trigger.callback)(scans.clone()) {
        error!("Manual trigger: scan enqueue failed: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    for scan in &scans {
        info!(
            "Manual scan enqueued: {} {}",
            scan.folder, scan.relative_path
        );
    }

    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(priority: i64, rules: Vec<RewriteRule>) -> Arc<ManualTrigger> {
        let callback: ProcessorFn = Arc::new(|_| Ok(()));
        ManualTrigger::new(
            &ManualConfig {
                priority,
                rewrite: rules,
            },
            callback,
        )
        .unwrap()
    }

    #[test]
    fn test_dir_becomes_whole_folder_scan() {
        let t = trigger(3, Vec::new());
        let scans = t.scans_for_request(&["/Movies/Alien (1979)/".to_string()], &[], 100);

        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].folder, "/Movies/Alien (1979)");
        assert_eq!(scans[0].relative_path, "");
        assert_eq!(scans[0].priority, 3);
        assert_eq!(scans[0].time, 100);
    }

    #[test]
    fn test_path_splits_into_folder_and_file() {
        let t = trigger(1, Vec::new());
        let scans =
            t.scans_for_request(&[], &["/TV/Westworld/S01E01.mkv".to_string()], 100);

        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].folder, "/TV/Westworld");
        assert_eq!(scans[0].relative_path, "S01E01.mkv");
    }

    #[test]
    fn test_rewrite_applies_after_split() {
        let t = trigger(
            1,
            vec![RewriteRule {
                from: "^/TV/(.*)".into(),
                to: "/mnt/unionfs/Media/TV/$1".into(),
            }],
        );
        let scans =
            t.scans_for_request(&[], &["/TV/Westworld/S01E01.mkv".to_string()], 100);

        assert_eq!(scans[0].folder, "/mnt/unionfs/Media/TV/Westworld");
        assert_eq!(scans[0].relative_path, "S01E01.mkv");
    }

    #[test]
    fn test_duplicates_collapse_within_one_request() {
        let t = trigger(1, Vec::new());

        // The same folder twice as dir, and the same file twice as path.
        let scans = t.scans_for_request(
            &["/Movies/Alien (1979)".to_string(), "/Movies/Alien (1979)/".to_string()],
            &[
                "/TV/Westworld/S01E01.mkv".to_string(),
                "/TV/Westworld/S01E01.mkv".to_string(),
            ],
            100,
        );

        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].folder, "/Movies/Alien (1979)");
        assert_eq!(scans[1].folder, "/TV/Westworld");
        assert_eq!(scans[1].relative_path, "S01E01.mkv");
    }

    #[test]
    fn test_folder_and_file_scans_are_distinct() {
        let t = trigger(1, Vec::new());

        // A whole-folder scan and a file scan in the same folder differ in
        // relative path, so both survive.
        let scans = t.scans_for_request(
            &["/TV/Westworld".to_string()],
            &["/TV/Westworld/S01E01.mkv".to_string()],
            100,
        );

        assert_eq!(scans.len(), 2);
    }
}
