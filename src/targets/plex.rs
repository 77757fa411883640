use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;

use crate::error::ScanRelayError;
use crate::rewrite::{RewriteRule, Rewriter};
use crate::scan::Scan;
use crate::targets::http::{new_client, read_body_limited, status_error, transport_error};
use crate::targets::Target;
use crate::utils::{cleaned_path_equal, join_url};

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PlexConfig {
    pub url: String,
    pub token: String,
    pub rewrite: Vec<RewriteRule>,
}

impl Default for PlexConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            rewrite: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
struct Library {
    id: i64,
    name: String,
    path: String,
}

pub struct PlexTarget {
    base_url: String,
    token: String,
    libraries: Vec<Library>,
    rewriter: Rewriter,
    client: Client,
}

impl PlexTarget {
    /// Connects to the server, verifies the version is supported, and
    /// caches the library sections used to route scans.
    pub async fn new(config: PlexConfig) -> Result<Self, ScanRelayError> {
        let rewriter = Rewriter::new(&config.rewrite)?;
        let client = new_client()?;

        let mut target = Self {
            base_url: config.url,
            token: config.token,
            libraries: Vec::new(),
            rewriter,
            client,
        };

        let version = target.version().await?;
        debug!("Plex version at {}: {}", target.base_url, version);
        if !is_supported_version(&version) {
            return Err(ScanRelayError::Fatal(format!(
                "plex at {} runs unsupported version {}",
                target.base_url, version
            )));
        }

        target.libraries = target.fetch_libraries().await?;
        debug!(
            "Plex libraries at {}: {:?}",
            target.base_url,
            target.libraries.iter().map(|l| &l.name).collect::<Vec<_>>()
        );

        Ok(target)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, ScanRelayError> {
        let response = self
            .client
            .get(url)
            .header("X-Plex-Token", &self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| transport_error("plex", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("plex", status));
        }

        read_body_limited(response).await
    }

    async fn version(&self) -> Result<String, ScanRelayError> {
        #[derive(Deserialize)]
        struct Container {
            version: String,
        }
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "MediaContainer")]
            media_container: Container,
        }

        let body = self.get(&join_url(&self.base_url, &[])).await?;
        let parsed: Response = serde_json::from_slice(&body)
            .map_err(|e| ScanRelayError::Fatal(format!("decoding plex version: {e}")))?;

        Ok(parsed.media_container.version)
    }

    async fn fetch_libraries(&self) -> Result<Vec<Library>, ScanRelayError> {
        #[derive(Deserialize)]
        struct Location {
            path: String,
        }
        #[derive(Deserialize)]
        struct Directory {
            key: String,
            title: String,
            #[serde(rename = "Location", default)]
            locations: Vec<Location>,
        }
        #[derive(Deserialize)]
        struct Container {
            #[serde(rename = "Directory", default)]
            directories: Vec<Directory>,
        }
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "MediaContainer")]
            media_container: Container,
        }

        let url = join_url(&self.base_url, &["library", "sections"]);
        let body = self.get(&url).await?;
        let parsed: Response = serde_json::from_slice(&body)
            .map_err(|e| ScanRelayError::Fatal(format!("decoding plex libraries: {e}")))?;

        let mut libraries = Vec::new();
        for directory in parsed.media_container.directories {
            let id: i64 = directory.key.parse().map_err(|_| {
                ScanRelayError::Fatal(format!("plex library key not numeric: {}", directory.key))
            })?;

            for location in directory.locations {
                let mut path = location.path;
                if !path.is_empty() && !path.ends_with('/') {
                    path.push('/');
                }

                libraries.push(Library {
                    id,
                    name: directory.title.clone(),
                    path,
                });
            }
        }

        Ok(libraries)
    }

    fn libraries_for(&self, folder: &str) -> Vec<&Library> {
        self.libraries
            .iter()
            .filter(|l| folder.starts_with(&l.path) || cleaned_path_equal(folder, &l.path))
            .collect()
    }
}

#[async_trait]
impl Target for PlexTarget {
    fn name(&self) -> &str {
        "plex"
    }

    async fn scan(&self, scan: &Scan) -> Result<(), ScanRelayError> {
        let folder = self.rewriter.rewrite(&scan.folder);

        let libraries = self.libraries_for(&folder);
        if libraries.is_empty() {
            // A folder outside every library is not worth failing the
            // whole dispatch over.
            warn!("Plex: no library matches {}", folder);
            return Ok(());
        }

        for library in libraries {
            debug!("Plex scan sending: {} ({})", folder, library.name);

            let url = join_url(
                &self.base_url,
                &["library", "sections", &library.id.to_string(), "refresh"],
            );
            let response = self
                .client
                .get(&url)
                .query(&[("path", folder.as_str())])
                .header("X-Plex-Token", &self.token)
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|e| transport_error("plex scan", e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(status_error("plex scan", status));
            }

            info!("Plex scan sent: {} ({})", folder, library.name);
        }

        Ok(())
    }

    async fn available(&self) -> Result<(), ScanRelayError> {
        self.version().await.map(|_| ())
    }
}

/// Folder-scoped refresh requires 1.20 or any later major.
fn is_supported_version(version: &str) -> bool {
    let mut parts = version.split('.');
    let major: u32 = match parts.next().and_then(|p| p.parse().ok()) {
        Some(m) => m,
        None => return false,
    };
    let minor: u32 = match parts.next().and_then(|p| p.parse().ok()) {
        Some(m) => m,
        None => return false,
    };

    major >= 2 || (major == 1 && minor >= 20)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_versions() {
        assert!(is_supported_version("1.20.3.3483"));
        assert!(is_supported_version("1.25.0"));
        assert!(is_supported_version("2.0.0"));
        assert!(!is_supported_version("1.19.5"));
        assert!(!is_supported_version("garbage"));
        assert!(!is_supported_version("1"));
    }
}
