use std::path::PathBuf;

use clap::{ArgAction, Parser};
use directories::ProjectDirs;

/// Relay scan notifications into media-server libraries.
#[derive(Parser)]
#[command(name = "scanrelay", version, about)]
pub struct Cli {
    /// Config file path.
    #[arg(long, env = "SCANRELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file path.
    #[arg(long, env = "SCANRELAY_DATABASE")]
    pub database: Option<PathBuf>,

    /// Log directory.
    #[arg(long, env = "SCANRELAY_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace). Overrides -v.
    #[arg(long, env = "SCANRELAY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbosity: u8,
}

impl Cli {
    fn default_dir() -> PathBuf {
        ProjectDirs::from("", "", "scanrelay")
            .map(|dirs| dirs.data_local_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| Self::default_dir().join("config.toml"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| Self::default_dir().join("scanrelay.db"))
    }

    pub fn log_dir_path(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| Self::default_dir().join("logs"))
    }

    /// Effective log specification: explicit level wins, then verbosity.
    pub fn log_spec(&self) -> String {
        if let Some(level) = &self.log_level {
            return format!("scanrelay={level}");
        }

        match self.verbosity {
            0 => "scanrelay=info".to_string(),
            1 => "scanrelay=debug".to_string(),
            _ => "scanrelay=trace".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_spec_from_verbosity() {
        let cli = Cli::parse_from(["scanrelay"]);
        assert_eq!(cli.log_spec(), "scanrelay=info");

        let cli = Cli::parse_from(["scanrelay", "-v"]);
        assert_eq!(cli.log_spec(), "scanrelay=debug");

        let cli = Cli::parse_from(["scanrelay", "-vv"]);
        assert_eq!(cli.log_spec(), "scanrelay=trace");
    }

    #[test]
    fn test_explicit_level_wins() {
        let cli = Cli::parse_from(["scanrelay", "-vv", "--log-level", "warn"]);
        assert_eq!(cli.log_spec(), "scanrelay=warn");
    }
}
