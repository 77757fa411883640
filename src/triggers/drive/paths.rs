use std::collections::HashMap;

use super::diff::{Difference, DriveItem, SyncError};
use super::store::DriveStore;

/// Folder lookups during path resolution fall back from the in-flight diff
/// to the datastore. The cap bounds the parent walk so corrupt state can
/// never loop forever.
const MAX_PATH_DEPTH: usize = 256;

/// The folder paths affected by a diff: `new_folders` for current
/// locations, `old_folders` for where removed or moved content used to be.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Paths {
    pub new_folders: Vec<String>,
    pub old_folders: Vec<String>,
}

struct FolderMaps {
    current: HashMap<String, DriveItem>,
    old: HashMap<String, DriveItem>,
}

/// Resolves a reclassified diff into affected folder paths, reduced to the
/// roots of each affected subtree so one scan covers nested changes.
pub fn resolve(
    store: &DriveStore,
    drive_id: &str,
    diff: &Difference,
) -> Result<Paths, SyncError> {
    let mut maps = folder_maps(diff);

    let (new_parents, old_parents) = collect_parents(store, drive_id, diff, &mut maps)?;

    let mut paths = Paths::default();
    for folder in root_folders(&new_parents) {
        paths
            .new_folders
            .push(folder_path(store, drive_id, &folder.id, &mut maps.current)?);
    }
    for folder in root_folders(&old_parents) {
        paths
            .old_folders
            .push(folder_path(store, drive_id, &folder.id, &mut maps.old)?);
    }

    Ok(paths)
}

/// Folder state carried by the diff itself, keyed by id. Added folders are
/// present in both views so a path through a brand-new tree resolves.
fn folder_maps(diff: &Difference) -> FolderMaps {
    let mut current = HashMap::new();
    let mut old = HashMap::new();

    for folder in &diff.added_folders {
        current.insert(folder.id.clone(), folder.clone());
        old.insert(folder.id.clone(), folder.clone());
    }

    for change in &diff.changed_folders {
        current.insert(change.new.id.clone(), change.new.clone());
        old.insert(change.old.id.clone(), change.old.clone());
    }

    for folder in &diff.removed_folders {
        old.insert(folder.id.clone(), folder.clone());
    }

    FolderMaps { current, old }
}

/// Gathers every folder the diff touches: changed/removed folders
/// themselves plus the parents of every affected file.
fn collect_parents(
    store: &DriveStore,
    drive_id: &str,
    diff: &Difference,
    maps: &mut FolderMaps,
) -> Result<(Vec<DriveItem>, Vec<DriveItem>), SyncError> {
    let mut new_parents: HashMap<String, DriveItem> = HashMap::new();
    let mut old_parents: HashMap<String, DriveItem> = HashMap::new();

    for change in &diff.changed_folders {
        new_parents.insert(change.new.id.clone(), change.new.clone());
        old_parents.insert(change.old.id.clone(), change.old.clone());
    }

    for folder in &diff.removed_folders {
        old_parents.insert(folder.id.clone(), folder.clone());
    }

    for file in &diff.added_files {
        let folder = lookup_folder(store, drive_id, &file.parent, &mut maps.current)?;
        new_parents.insert(folder.id.clone(), folder);
    }

    for change in &diff.changed_files {
        let current = lookup_folder(store, drive_id, &change.new.parent, &mut maps.current)?;
        new_parents.insert(current.id.clone(), current);

        let old = lookup_folder(store, drive_id, &change.old.parent, &mut maps.old)?;
        old_parents.insert(old.id.clone(), old);
    }

    for file in &diff.removed_files {
        let folder = lookup_folder(store, drive_id, &file.parent, &mut maps.old)?;
        old_parents.insert(folder.id.clone(), folder);
    }

    Ok((
        new_parents.into_values().collect(),
        old_parents.into_values().collect(),
    ))
}

/// Keeps only folders whose parent is outside the set: scanning a root
/// already covers every descendant in the set.
fn root_folders(folders: &[DriveItem]) -> Vec<DriveItem> {
    let ids: std::collections::HashSet<&str> =
        folders.iter().map(|f| f.id.as_str()).collect();

    folders
        .iter()
        .filter(|f| !ids.contains(f.parent.as_str()))
        .cloned()
        .collect()
}

fn lookup_folder(
    store: &DriveStore,
    drive_id: &str,
    folder_id: &str,
    map: &mut HashMap<String, DriveItem>,
) -> Result<DriveItem, SyncError> {
    if let Some(folder) = map.get(folder_id) {
        return Ok(folder.clone());
    }

    // The drive itself acts as the root folder.
    if folder_id == drive_id {
        let root = DriveItem {
            id: drive_id.to_string(),
            ..Default::default()
        };
        map.insert(drive_id.to_string(), root.clone());
        return Ok(root);
    }

    let folder = store
        .get_folder(drive_id, folder_id)?
        .ok_or_else(|| SyncError::DataAnomaly(format!("unknown folder: {folder_id}")))?;
    map.insert(folder.id.clone(), folder.clone());

    Ok(folder)
}

/// Builds the absolute path of a folder by walking parent ids upward
/// through `map`, falling back to the datastore for unseen ancestors.
fn folder_path(
    store: &DriveStore,
    drive_id: &str,
    folder_id: &str,
    map: &mut HashMap<String, DriveItem>,
) -> Result<String, SyncError> {
    if folder_id == drive_id {
        return Ok("/".to_string());
    }

    let top = lookup_folder(store, drive_id, folder_id, map)?;

    let mut segments = vec![top.name.clone()];
    let mut next_id = top.parent.clone();

    let mut hops = 0;
    while !next_id.is_empty() && next_id != drive_id {
        hops += 1;
        if hops > MAX_PATH_DEPTH {
            return Err(SyncError::DataAnomaly(format!(
                "folder ancestry deeper than {MAX_PATH_DEPTH}: {folder_id}"
            )));
        }

        let folder = lookup_folder(store, drive_id, &next_id, map)?;
        segments.push(folder.name.clone());
        next_id = folder.parent.clone();
    }

    segments.reverse();
    Ok(format!("/{}", segments.join("/")))
}
