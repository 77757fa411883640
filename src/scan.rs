use serde::{Deserialize, Serialize};

/// A scan request for a single folder.
///
/// Scans flow from triggers into the store and from the store out to
/// targets. `folder` is the primary key: repeated scans for the same folder
/// merge in the store (`priority` keeps its maximum, `relative_path` and
/// `time` take the latest value).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scan {
    /// Absolute path of the directory to scan, after rewrite rules.
    pub folder: String,

    /// Optional file path relative to `folder`. Empty means the whole
    /// folder should be scanned.
    pub relative_path: String,

    /// Trigger-assigned priority; higher wins on merge.
    pub priority: i64,

    /// Unix timestamp at which this scan becomes eligible for dispatch.
    pub time: i64,
}
