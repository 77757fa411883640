use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;

use crate::error::ScanRelayError;
use crate::rewrite::{RewriteRule, Rewriter};
use crate::scan::Scan;
use crate::targets::http::{new_client, status_error, transport_error};
use crate::targets::Target;
use crate::utils::join_url;

/// Forwards scans to another scanrelay instance's manual trigger. Useful
/// when one machine watches the filesystem and another talks to the media
/// servers.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct RelayConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub rewrite: Vec<RewriteRule>,
}

pub struct RelayTarget {
    base_url: String,
    username: String,
    password: String,
    rewriter: Rewriter,
    client: Client,
}

impl RelayTarget {
    pub fn new(config: RelayConfig) -> Result<Self, ScanRelayError> {
        Ok(Self {
            base_url: config.url,
            username: config.username,
            password: config.password,
            rewriter: Rewriter::new(&config.rewrite)?,
            client: new_client()?,
        })
    }

    fn authenticated(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() && self.password.is_empty() {
            request
        } else {
            request.basic_auth(&self.username, Some(&self.password))
        }
    }

    /// A whole-folder scan forwards as `dir`; a file scan forwards the
    /// joined path as `path` and the remote end re-splits it.
    fn scan_query(folder: &str, scan: &Scan) -> Vec<(&'static str, String)> {
        if scan.relative_path.is_empty() {
            vec![("dir", folder.to_string())]
        } else {
            vec![(
                "path",
                format!(
                    "{}/{}",
                    folder.trim_end_matches('/'),
                    scan.relative_path.trim_start_matches('/')
                ),
            )]
        }
    }
}

#[async_trait]
impl Target for RelayTarget {
    fn name(&self) -> &str {
        "relay"
    }

    async fn scan(&self, scan: &Scan) -> Result<(), ScanRelayError> {
        let folder = self.rewriter.rewrite(&scan.folder);

        let url = join_url(&self.base_url, &["triggers", "manual"]);
        let query = Self::scan_query(&folder, scan);

        debug!("Relay scan sending: {}", folder);

        let response = self
            .authenticated(self.client.post(&url).query(&query))
            .send()
            .await
            .map_err(|e| transport_error("relay scan", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("relay scan", status));
        }

        info!("Relay scan sent: {}", folder);
        Ok(())
    }

    async fn available(&self) -> Result<(), ScanRelayError> {
        let url = join_url(&self.base_url, &["health"]);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error("relay", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("relay", status));
        }

        Ok(())
    }
}
