use std::sync::Arc;

use rusqlite::OptionalExtension;
use rust_embed::RustEmbed;

use crate::database::Database;
use crate::error::ScanRelayError;
use crate::migrate;

use super::diff::{Difference, DriveItem};

#[derive(RustEmbed)]
#[folder = "migrations/drive/"]
struct Migrations;

/// Local snapshot of each drive's tree plus the incremental-sync page
/// token. Lives in the shared database under the `drive` component.
pub struct DriveStore {
    db: Arc<Database>,
}

impl DriveStore {
    pub fn new(db: Arc<Database>) -> Result<Self, ScanRelayError> {
        {
            let mut conn = db.writer();
            migrate::migrate::<Migrations>(&mut conn, "drive")?;
        }

        Ok(Self { db })
    }

    /// The stored page token, or None when the drive has never completed a
    /// full sync.
    pub fn page_token(&self, drive_id: &str) -> Result<Option<String>, ScanRelayError> {
        let conn = self.db.reader()?;
        let token: Option<Option<String>> = conn
            .query_row(
                "SELECT page_token FROM drive WHERE id = ?",
                [drive_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(token.flatten())
    }

    pub fn get_folder(
        &self,
        drive_id: &str,
        folder_id: &str,
    ) -> Result<Option<DriveItem>, ScanRelayError> {
        self.get_item("drive_folder", drive_id, folder_id)
    }

    pub fn get_file(
        &self,
        drive_id: &str,
        file_id: &str,
    ) -> Result<Option<DriveItem>, ScanRelayError> {
        self.get_item("drive_file", drive_id, file_id)
    }

    fn get_item(
        &self,
        table: &str,
        drive_id: &str,
        item_id: &str,
    ) -> Result<Option<DriveItem>, ScanRelayError> {
        let conn = self.db.reader()?;
        let sql = format!("SELECT id, name, parent, trashed FROM {table} WHERE drive_id = ? AND id = ?");

        let item = conn
            .query_row(&sql, [drive_id, item_id], |row| {
                Ok(DriveItem {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    parent: row.get(2)?,
                    trashed: row.get(3)?,
                })
            })
            .optional()?;

        Ok(item)
    }

    /// Replaces the whole snapshot for a drive: used by full sync.
    pub fn replace_all(
        &self,
        drive_id: &str,
        folders: &[DriveItem],
        files: &[DriveItem],
        page_token: &str,
    ) -> Result<(), ScanRelayError> {
        self.db.immediate_transaction(|tx| {
            tx.execute(
                "INSERT INTO drive (id, page_token) VALUES (?, ?)
                 ON CONFLICT (id) DO UPDATE SET page_token = excluded.page_token",
                rusqlite::params![drive_id, page_token],
            )?;

            tx.execute("DELETE FROM drive_folder WHERE drive_id = ?", [drive_id])?;
            tx.execute("DELETE FROM drive_file WHERE drive_id = ?", [drive_id])?;

            for folder in folders {
                upsert_item(tx, "drive_folder", drive_id, folder)?;
            }
            for file in files {
                upsert_item(tx, "drive_file", drive_id, file)?;
            }

            Ok(())
        })
    }

    /// Applies a reclassified diff and the new page token in one
    /// transaction, so a crash never leaves the token ahead of the data.
    pub fn apply(
        &self,
        drive_id: &str,
        diff: &Difference,
        page_token: &str,
    ) -> Result<(), ScanRelayError> {
        self.db.immediate_transaction(|tx| {
            tx.execute(
                "INSERT INTO drive (id, page_token) VALUES (?, ?)
                 ON CONFLICT (id) DO UPDATE SET page_token = excluded.page_token",
                rusqlite::params![drive_id, page_token],
            )?;

            for folder in diff
                .added_folders
                .iter()
                .chain(diff.changed_folders.iter().map(|c| &c.new))
            {
                upsert_item(tx, "drive_folder", drive_id, folder)?;
            }
            for folder in &diff.removed_folders {
                tx.execute(
                    "DELETE FROM drive_folder WHERE drive_id = ? AND id = ?",
                    rusqlite::params![drive_id, folder.id],
                )?;
            }

            for file in diff
                .added_files
                .iter()
                .chain(diff.changed_files.iter().map(|c| &c.new))
            {
                upsert_item(tx, "drive_file", drive_id, file)?;
            }
            for file in &diff.removed_files {
                tx.execute(
                    "DELETE FROM drive_file WHERE drive_id = ? AND id = ?",
                    rusqlite::params![drive_id, file.id],
                )?;
            }

            Ok(())
        })
    }
}

fn upsert_item(
    tx: &rusqlite::Transaction,
    table: &str,
    drive_id: &str,
    item: &DriveItem,
) -> Result<(), ScanRelayError> {
    let sql = format!(
        "INSERT INTO {table} (drive_id, id, name, parent, trashed) VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (drive_id, id) DO UPDATE SET
             name = excluded.name, parent = excluded.parent, trashed = excluded.trashed"
    );
    tx.execute(
        &sql,
        rusqlite::params![drive_id, item.id, item.name, item.parent, item.trashed],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::drive::diff::ItemChange;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, DriveStore) {
        let dir = TempDir::new().expect("temp dir");
        let db = Arc::new(Database::open(&dir.path().join("scanrelay.db")).expect("open"));
        let store = DriveStore::new(db).expect("store");
        (dir, store)
    }

    fn folder(id: &str, parent: &str) -> DriveItem {
        DriveItem {
            id: id.to_string(),
            name: format!("name-{id}"),
            parent: parent.to_string(),
            trashed: false,
        }
    }

    #[test]
    fn test_page_token_starts_absent() {
        let (_dir, store) = open_store();
        assert!(store.page_token("drive1").unwrap().is_none());
    }

    #[test]
    fn test_replace_all_stores_snapshot_and_token() {
        let (_dir, store) = open_store();

        store
            .replace_all(
                "drive1",
                &[folder("d1", "drive1")],
                &[folder("f1", "d1")],
                "token-1",
            )
            .unwrap();

        assert_eq!(store.page_token("drive1").unwrap().as_deref(), Some("token-1"));
        assert!(store.get_folder("drive1", "d1").unwrap().is_some());
        assert!(store.get_file("drive1", "f1").unwrap().is_some());
        assert!(store.get_folder("drive1", "missing").unwrap().is_none());
    }

    #[test]
    fn test_apply_upserts_and_removes() {
        let (_dir, store) = open_store();
        store
            .replace_all("drive1", &[folder("d1", "drive1")], &[], "token-1")
            .unwrap();

        let diff = Difference {
            added_folders: vec![folder("d2", "d1")],
            changed_folders: vec![ItemChange {
                old: folder("d1", "drive1"),
                new: DriveItem {
                    name: "renamed".into(),
                    ..folder("d1", "drive1")
                },
            }],
            removed_files: Vec::new(),
            ..Default::default()
        };

        store.apply("drive1", &diff, "token-2").unwrap();

        assert_eq!(store.page_token("drive1").unwrap().as_deref(), Some("token-2"));
        assert_eq!(
            store.get_folder("drive1", "d1").unwrap().unwrap().name,
            "renamed"
        );
        assert!(store.get_folder("drive1", "d2").unwrap().is_some());
    }

    #[test]
    fn test_drives_are_isolated() {
        let (_dir, store) = open_store();
        store
            .replace_all("drive1", &[folder("d1", "drive1")], &[], "t1")
            .unwrap();

        assert!(store.get_folder("drive2", "d1").unwrap().is_none());
        assert!(store.page_token("drive2").unwrap().is_none());
    }
}
