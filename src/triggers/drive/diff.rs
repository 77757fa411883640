use thiserror::Error;

/// Error classes for one sync run. The job's retry logic keys off these:
/// credentials, anomalies and network failures are retried up to the strike
/// limit, `Fatal` unregisters the job at once, `Store` falls into the
/// unknown-but-retryable bucket.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("data anomaly: {0}")]
    DataAnomaly(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("datastore error: {0}")]
    Store(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Store(e.to_string())
    }
}

impl From<crate::error::ScanRelayError> for SyncError {
    fn from(e: crate::error::ScanRelayError) -> Self {
        SyncError::Store(e.to_string())
    }
}

/// A file or folder as known to the drive, reduced to the fields path
/// resolution needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    pub parent: String,
    pub trashed: bool,
}

/// An item that changed between the stored snapshot and the remote state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemChange {
    pub old: DriveItem,
    pub new: DriveItem,
}

/// The partitioned outcome of one incremental sync, before and after
/// reclassification.
#[derive(Clone, Debug, Default)]
pub struct Difference {
    pub added_files: Vec<DriveItem>,
    pub changed_files: Vec<ItemChange>,
    pub removed_files: Vec<DriveItem>,

    pub added_folders: Vec<DriveItem>,
    pub changed_folders: Vec<ItemChange>,
    pub removed_folders: Vec<DriveItem>,
}

impl Difference {
    pub fn is_empty(&self) -> bool {
        self.added_files.is_empty()
            && self.changed_files.is_empty()
            && self.removed_files.is_empty()
            && self.added_folders.is_empty()
            && self.changed_folders.is_empty()
            && self.removed_folders.is_empty()
    }
}

/// Normalises trash-state flips so downstream path resolution sees clean
/// added/removed/changed partitions:
/// - a "changed" item that came out of the trash is really an addition;
/// - a "changed" item that went into the trash is really a removal;
/// - a removal of something already known trashed is old news and dropped.
///
/// `known_trashed_*` consult the datastore; their errors abort the run.
pub fn reclassify_trashed<F, G>(
    diff: &mut Difference,
    mut known_trashed_file: F,
    mut known_trashed_folder: G,
) -> Result<(), SyncError>
where
    F: FnMut(&DriveItem) -> Result<bool, SyncError>,
    G: FnMut(&DriveItem) -> Result<bool, SyncError>,
{
    drop_known_removals(&mut diff.removed_files, &mut known_trashed_file)?;
    drop_known_removals(&mut diff.removed_folders, &mut known_trashed_folder)?;

    move_trash_transitions(
        &mut diff.changed_files,
        &mut diff.added_files,
        &mut diff.removed_files,
    );
    move_trash_transitions(
        &mut diff.changed_folders,
        &mut diff.added_folders,
        &mut diff.removed_folders,
    );

    Ok(())
}

fn drop_known_removals<F>(
    removed: &mut Vec<DriveItem>,
    known_trashed: &mut F,
) -> Result<(), SyncError>
where
    F: FnMut(&DriveItem) -> Result<bool, SyncError>,
{
    let mut index = 0;
    while index < removed.len() {
        if removed[index].trashed && known_trashed(&removed[index])? {
            removed.remove(index);
        } else {
            index += 1;
        }
    }

    Ok(())
}

fn move_trash_transitions(
    changed: &mut Vec<ItemChange>,
    added: &mut Vec<DriveItem>,
    removed: &mut Vec<DriveItem>,
) {
    let mut index = 0;
    while index < changed.len() {
        let change = &changed[index];
        match (change.old.trashed, change.new.trashed) {
            (true, false) => {
                let change = changed.remove(index);
                added.push(change.new);
            }
            (false, true) => {
                let change = changed.remove(index);
                removed.push(change.new);
            }
            _ => index += 1,
        }
    }
}
