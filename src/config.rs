use std::fs;
use std::path::Path;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::ScanRelayError;
use crate::targets::emby::EmbyConfig;
use crate::targets::plex::PlexConfig;
use crate::targets::relay::RelayConfig;
use crate::triggers::atrain::AtrainConfig;
use crate::triggers::drive::DriveTriggerConfig;
use crate::triggers::inotify::InotifyConfig;
use crate::triggers::lidarr::LidarrConfig;
use crate::triggers::manual::ManualConfig;
use crate::triggers::radarr::RadarrConfig;
use crate::triggers::sonarr::SonarrConfig;

/// Full configuration, merged from config.toml and SCANRELAY_* environment
/// variables (environment wins). Unknown keys are rejected so typos fail
/// fast instead of silently doing nothing.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Bind addresses; entries without a port use `port`.
    pub host: Vec<String>,
    pub port: u16,

    /// Seconds a scan must sit in the queue before dispatch, letting
    /// copies settle.
    pub minimum_age_secs: u64,

    /// Sleep between successful dispatches, to go easy on targets.
    pub scan_delay_secs: u64,

    /// Stats reporting interval; 0 disables the reporter.
    pub scan_stats_secs: u64,

    /// Paths whose presence gates all dispatching (mount canaries).
    pub anchors: Vec<String>,

    pub auth: AuthConfig,
    pub triggers: TriggersConfig,
    pub targets: TargetsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: vec!["0.0.0.0".to_string()],
            port: 3030,
            minimum_age_secs: 600,
            scan_delay_secs: 5,
            scan_stats_secs: 3600,
            anchors: Vec::new(),
            auth: AuthConfig::default(),
            triggers: TriggersConfig::default(),
            targets: TargetsConfig::default(),
        }
    }
}

/// HTTP basic auth for the webhook routes. Both fields must be set for
/// auth to be enforced.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    pub fn enabled(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TriggersConfig {
    pub manual: ManualConfig,
    pub atrain: AtrainConfig,
    pub drive: Vec<DriveTriggerConfig>,
    pub inotify: Vec<InotifyConfig>,
    pub lidarr: Vec<LidarrConfig>,
    pub radarr: Vec<RadarrConfig>,
    pub sonarr: Vec<SonarrConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TargetsConfig {
    pub plex: Vec<PlexConfig>,
    pub emby: Vec<EmbyConfig>,
    pub relay: Vec<RelayConfig>,
}

impl Config {
    /// Loads configuration, writing a commented template on first run so
    /// users have something to edit.
    pub fn load(config_path: &Path) -> Result<Self, ScanRelayError> {
        if !config_path.exists() {
            write_default_config(config_path)?;
        }

        // The CLI owns these variables; they are not config keys.
        let env = Env::prefixed("SCANRELAY_")
            .ignore(&["config", "database", "log_dir", "log_level"])
            .split("__");

        Figment::new()
            .merge(Toml::file(config_path))
            .merge(env)
            .extract()
            .map_err(|e| ScanRelayError::Config(e.to_string()))
    }
}

fn write_default_config(config_path: &Path) -> Result<(), ScanRelayError> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let template = r#"# scanrelay configuration
#
# Precedence: environment variables (SCANRELAY_*) > this file > defaults.
# Double underscores separate sections in environment names, e.g.
# SCANRELAY_AUTH__USERNAME.
#
# host = ["0.0.0.0"]
# port = 3030
# minimum_age_secs = 600
# scan_delay_secs = 5
# scan_stats_secs = 3600
# anchors = ["/mnt/unionfs/mounted.txt"]
#
# [auth]
# username = ""
# password = ""
#
# [[triggers.sonarr]]
# name = "sonarr"
# priority = 2
# rewrite = [{ from = "^/TV/(.*)", to = "/mnt/unionfs/Media/TV/$1" }]
#
# [[triggers.inotify]]
# priority = 0
# paths = [{ path = "/mnt/unionfs/Media" }]
#
# [[triggers.drive]]
# account = "/config/account.token"
# cron = "0 */15 * * * *"
# priority = 5
# drives = [{ id = "0A1xxxxxxxxxUk9PVA" }]
#
# [[targets.plex]]
# url = "https://plex.domain.tld"
# token = "XXXX"
#
# [[targets.emby]]
# url = "https://emby.domain.tld"
# token = "XXXX"
"#;

    fs::write(config_path, template)?;
    Ok(())
}
