use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::ScanRelayError;
use crate::rewrite::{RewriteRule, Rewriter};
use crate::scan::Scan;
use crate::targets::http::{new_client, read_body_limited, status_error, transport_error};
use crate::targets::Target;
use crate::utils::{cleaned_path_equal, join_url};

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct EmbyConfig {
    pub url: String,
    pub token: String,
    pub rewrite: Vec<RewriteRule>,
}

#[derive(Clone, Debug)]
struct Library {
    name: String,
    path: String,
}

pub struct EmbyTarget {
    base_url: String,
    token: String,
    libraries: Vec<Library>,
    rewriter: Rewriter,
    client: Client,
}

impl EmbyTarget {
    pub async fn new(config: EmbyConfig) -> Result<Self, ScanRelayError> {
        let rewriter = Rewriter::new(&config.rewrite)?;
        let client = new_client()?;

        let mut target = Self {
            base_url: config.url,
            token: config.token,
            libraries: Vec::new(),
            rewriter,
            client,
        };

        target.libraries = target.fetch_libraries().await?;
        debug!(
            "Emby libraries at {}: {:?}",
            target.base_url,
            target.libraries.iter().map(|l| &l.name).collect::<Vec<_>>()
        );

        Ok(target)
    }

    async fn fetch_libraries(&self) -> Result<Vec<Library>, ScanRelayError> {
        #[derive(Deserialize)]
        struct VirtualFolder {
            #[serde(rename = "Name")]
            name: String,
            #[serde(rename = "Locations", default)]
            locations: Vec<String>,
        }

        let url = join_url(&self.base_url, &["Library", "VirtualFolders"]);
        let response = self
            .client
            .get(&url)
            .header("X-Emby-Token", &self.token)
            .send()
            .await
            .map_err(|e| transport_error("emby", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("emby", status));
        }

        let body = read_body_limited(response).await?;
        let folders: Vec<VirtualFolder> = serde_json::from_slice(&body)
            .map_err(|e| ScanRelayError::Fatal(format!("decoding emby libraries: {e}")))?;

        let mut libraries = Vec::new();
        for folder in folders {
            for location in folder.locations {
                let mut path = location;
                if !path.is_empty() && !path.ends_with('/') {
                    path.push('/');
                }

                libraries.push(Library {
                    name: folder.name.clone(),
                    path,
                });
            }
        }

        Ok(libraries)
    }

    fn library_for(&self, folder: &str) -> Option<&Library> {
        self.libraries
            .iter()
            .find(|l| folder.starts_with(&l.path) || cleaned_path_equal(folder, &l.path))
    }
}

#[async_trait]
impl Target for EmbyTarget {
    fn name(&self) -> &str {
        "emby"
    }

    async fn scan(&self, scan: &Scan) -> Result<(), ScanRelayError> {
        let folder = self.rewriter.rewrite(&scan.folder);

        let library = match self.library_for(&folder) {
            Some(library) => library,
            None => {
                warn!("Emby: no library matches {}", folder);
                return Ok(());
            }
        };

        let scan_path = if scan.relative_path.is_empty() {
            folder.clone()
        } else {
            format!(
                "{}/{}",
                folder.trim_end_matches('/'),
                scan.relative_path.trim_start_matches('/')
            )
        };

        debug!("Emby scan sending: {} ({})", scan_path, library.name);

        let url = join_url(&self.base_url, &["Library", "Media", "Updated"]);
        let response = self
            .client
            .post(&url)
            .header("X-Emby-Token", &self.token)
            .json(&json!({
                "Updates": [{"Path": scan_path, "UpdateType": "Created"}],
            }))
            .send()
            .await
            .map_err(|e| transport_error("emby scan", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("emby scan", status));
        }

        info!("Emby scan sent: {} ({})", scan_path, library.name);
        Ok(())
    }

    async fn available(&self) -> Result<(), ScanRelayError> {
        let url = join_url(&self.base_url, &["System", "Info"]);
        let response = self
            .client
            .get(&url)
            .header("X-Emby-Token", &self.token)
            .send()
            .await
            .map_err(|e| transport_error("emby", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("emby", status));
        }

        Ok(())
    }
}
