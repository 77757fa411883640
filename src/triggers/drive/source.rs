use std::fs;
use std::path::Path;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::targets::http::new_client;

use super::diff::SyncError;

const API_BASE: &str = "https://www.googleapis.com/drive/v3";

const CHANGE_FIELDS: &str =
    "nextPageToken,newStartPageToken,changes(fileId,removed,file(id,name,parents,trashed,mimeType))";

const FILE_FIELDS: &str = "nextPageToken,files(id,name,parents,trashed,mimeType)";

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// One remote item as reported by the change feed.
#[derive(Clone, Debug, Default)]
pub struct ChangeItem {
    pub id: String,
    pub name: String,
    pub parent: String,
    pub trashed: bool,
    pub is_folder: bool,
}

/// One change-feed entry: either an updated item or a bare removal.
#[derive(Clone, Debug)]
pub struct Change {
    pub id: String,
    pub removed: bool,
    pub item: Option<ChangeItem>,
}

/// One page of the change feed. Exactly one of the tokens is set: `next`
/// while more pages remain, `new_start` on the final page.
#[derive(Clone, Debug, Default)]
pub struct ChangePage {
    pub changes: Vec<Change>,
    pub next_page_token: Option<String>,
    pub new_start_page_token: Option<String>,
}

/// The remote drive API as the sync engine sees it. Production uses the
/// REST client below; tests plug in an in-memory feed.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// A token marking "now" in the change feed, used to seed incremental
    /// syncs after a full enumeration.
    async fn start_page_token(&self, drive_id: &str) -> Result<String, SyncError>;

    /// One page of changes since `page_token`.
    async fn changes(&self, drive_id: &str, page_token: &str) -> Result<ChangePage, SyncError>;

    /// Complete enumeration of the drive, for full syncs.
    async fn list_all(&self, drive_id: &str) -> Result<Vec<ChangeItem>, SyncError>;
}

/// REST client for the drive changes API. The account file holds a bearer
/// token maintained by an external refresher.
pub struct RestChangeSource {
    token: String,
    client: Client,
}

impl RestChangeSource {
    pub fn from_account_file(path: &Path) -> Result<Self, SyncError> {
        let token = fs::read_to_string(path)
            .map_err(|e| SyncError::Fatal(format!("reading account file {}: {e}", path.display())))?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(SyncError::Fatal(format!(
                "account file {} is empty",
                path.display()
            )));
        }

        let client =
            new_client().map_err(|e| SyncError::Fatal(format!("building drive client: {e}")))?;

        Ok(Self { token, client })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SyncError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::InvalidCredentials);
        }
        if status.is_server_error() {
            return Err(SyncError::Network(format!("drive API returned {status}")));
        }
        if !status.is_success() {
            return Err(SyncError::Fatal(format!("drive API returned {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| SyncError::DataAnomaly(format!("decoding drive response: {e}")))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    trashed: bool,
    #[serde(default)]
    mime_type: String,
}

impl From<ApiFile> for ChangeItem {
    fn from(file: ApiFile) -> Self {
        let is_folder = file.mime_type == FOLDER_MIME;
        ChangeItem {
            id: file.id,
            name: file.name,
            parent: file.parents.into_iter().next().unwrap_or_default(),
            trashed: file.trashed,
            is_folder,
        }
    }
}

#[async_trait]
impl ChangeSource for RestChangeSource {
    async fn start_page_token(&self, drive_id: &str) -> Result<String, SyncError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            start_page_token: String,
        }

        let url = format!("{API_BASE}/changes/startPageToken");
        let response: Response = self
            .get_json(&url, &[("driveId", drive_id), ("supportsAllDrives", "true")])
            .await?;

        Ok(response.start_page_token)
    }

    async fn changes(&self, drive_id: &str, page_token: &str) -> Result<ChangePage, SyncError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ApiChange {
            #[serde(default)]
            file_id: String,
            #[serde(default)]
            removed: bool,
            file: Option<ApiFile>,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            #[serde(default)]
            changes: Vec<ApiChange>,
            next_page_token: Option<String>,
            new_start_page_token: Option<String>,
        }

        let url = format!("{API_BASE}/changes");
        let response: Response = self
            .get_json(
                &url,
                &[
                    ("driveId", drive_id),
                    ("pageToken", page_token),
                    ("supportsAllDrives", "true"),
                    ("includeItemsFromAllDrives", "true"),
                    ("fields", CHANGE_FIELDS),
                ],
            )
            .await?;

        Ok(ChangePage {
            changes: response
                .changes
                .into_iter()
                .map(|c| Change {
                    id: c.file_id,
                    removed: c.removed,
                    item: c.file.map(ChangeItem::from),
                })
                .collect(),
            next_page_token: response.next_page_token,
            new_start_page_token: response.new_start_page_token,
        })
    }

    async fn list_all(&self, drive_id: &str) -> Result<Vec<ChangeItem>, SyncError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            #[serde(default)]
            files: Vec<ApiFile>,
            next_page_token: Option<String>,
        }

        let url = format!("{API_BASE}/files");
        let mut items = Vec::new();
        let mut page_token = String::new();

        loop {
            let mut query = vec![
                ("driveId", drive_id),
                ("corpora", "drive"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
                ("pageSize", "1000"),
                ("fields", FILE_FIELDS),
            ];
            if !page_token.is_empty() {
                query.push(("pageToken", page_token.as_str()));
            }

            let response: Response = self.get_json(&url, &query).await?;
            items.extend(response.files.into_iter().map(ChangeItem::from));

            match response.next_page_token {
                Some(next) => page_token = next,
                None => break,
            }
        }

        Ok(items)
    }
}
