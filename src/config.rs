//! Configuration for the update agent.
//!
//! The surrounding agent exposes many knobs; the update core consumes only
//! the narrow subset defined by the [`Settings`] trait. [`AutoupdateConfig`]
//! is the production implementation, deserialized from the agent's TOML
//! config file with defaults for every field.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Release channel that the metadata client uses to select a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateChannel {
    /// Production releases (default).
    #[default]
    Stable,
    /// Pre-release candidates.
    Beta,
    /// Latest builds, updated continuously.
    Nightly,
}

impl std::fmt::Display for UpdateChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Beta => write!(f, "beta"),
            Self::Nightly => write!(f, "nightly"),
        }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Auto-update settings.
    pub autoupdate: AutoupdateConfig,
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::LauncherError::Config(e.to_string()))
    }
}

/// Auto-update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoupdateConfig {
    /// Base URL of the release mirror that serves target archives.
    pub mirror_url: String,
    /// Base URL of the signed-metadata (TUF) server. The external metadata
    /// client talks to it; the core only carries the value.
    pub tuf_server_url: String,
    /// Release channel to follow.
    pub channel: UpdateChannel,
    /// Seconds between update checks.
    pub interval_secs: u64,
    /// Seconds to wait after startup before the first check.
    pub initial_delay_secs: u64,
    /// Root of the on-disk update library.
    pub update_directory: PathBuf,
    /// Install a channel target even when it is older than the running
    /// version. Off means the agent only ever moves forward.
    pub allow_rollback: bool,
}

impl Default for AutoupdateConfig {
    fn default() -> Self {
        Self {
            mirror_url: "https://dl.kolide.co".to_owned(),
            tuf_server_url: "https://tuf.kolide.co".to_owned(),
            channel: UpdateChannel::default(),
            interval_secs: 60 * 60,
            initial_delay_secs: 0,
            update_directory: default_update_directory(),
            allow_rollback: true,
        }
    }
}

/// Returns the default root for the update library.
///
/// Resolves to `<platform data dir>/launcher/updates`. Override with the
/// `LAUNCHER_UPDATE_DIR` environment variable.
pub fn default_update_directory() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("LAUNCHER_UPDATE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("launcher").join("updates"))
        .unwrap_or_else(|| PathBuf::from("/tmp/launcher-updates"))
}

/// Read-only settings the update core consumes from its host.
pub trait Settings: Send + Sync {
    /// Base URL of the release mirror.
    fn mirror_url(&self) -> &str;
    /// Base URL of the signed-metadata server.
    fn tuf_server_url(&self) -> &str;
    /// Release channel to follow.
    fn update_channel(&self) -> UpdateChannel;
    /// Interval between update checks.
    fn autoupdate_interval(&self) -> Duration;
    /// Delay before the first check after startup.
    fn autoupdate_initial_delay(&self) -> Duration;
    /// Root of the on-disk update library.
    fn update_directory(&self) -> &Path;
    /// Whether a channel target older than the running version is installed.
    fn allow_rollback(&self) -> bool;
}

impl Settings for AutoupdateConfig {
    fn mirror_url(&self) -> &str {
        &self.mirror_url
    }

    fn tuf_server_url(&self) -> &str {
        &self.tuf_server_url
    }

    fn update_channel(&self) -> UpdateChannel {
        self.channel
    }

    fn autoupdate_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    fn autoupdate_initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    fn update_directory(&self) -> &Path {
        &self.update_directory
    }

    fn allow_rollback(&self) -> bool {
        self.allow_rollback
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_config_points_at_stable() {
        let config = AutoupdateConfig::default();
        assert_eq!(config.channel, UpdateChannel::Stable);
        assert_eq!(config.interval_secs, 3600);
        assert_eq!(config.initial_delay_secs, 0);
        assert!(config.allow_rollback);
        assert!(!config.mirror_url.is_empty());
    }

    #[test]
    fn channel_display() {
        assert_eq!(UpdateChannel::Stable.to_string(), "stable");
        assert_eq!(UpdateChannel::Beta.to_string(), "beta");
        assert_eq!(UpdateChannel::Nightly.to_string(), "nightly");
    }

    #[test]
    fn channel_serde_values() {
        let stable: UpdateChannel = serde_json::from_str(r#""stable""#).unwrap();
        assert_eq!(stable, UpdateChannel::Stable);

        let beta: UpdateChannel = serde_json::from_str(r#""beta""#).unwrap();
        assert_eq!(beta, UpdateChannel::Beta);

        let nightly: UpdateChannel = serde_json::from_str(r#""nightly""#).unwrap();
        assert_eq!(nightly, UpdateChannel::Nightly);
    }

    #[test]
    fn config_toml_round_trip() {
        let toml_str = r#"
[autoupdate]
mirror_url = "https://mirror.example.com"
channel = "beta"
interval_secs = 600
initial_delay_secs = 30
update_directory = "/var/lib/launcher/updates"
allow_rollback = false
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.autoupdate.mirror_url, "https://mirror.example.com");
        assert_eq!(config.autoupdate.channel, UpdateChannel::Beta);
        assert_eq!(config.autoupdate.interval_secs, 600);
        assert_eq!(config.autoupdate.initial_delay_secs, 30);
        assert!(!config.autoupdate.allow_rollback);
        assert_eq!(
            config.autoupdate.update_directory,
            PathBuf::from("/var/lib/launcher/updates")
        );
    }

    #[test]
    fn config_toml_defaults_when_missing() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.autoupdate.channel, UpdateChannel::Stable);
        assert!(config.autoupdate.allow_rollback);
    }

    #[test]
    fn settings_durations() {
        let config = AutoupdateConfig {
            interval_secs: 90,
            initial_delay_secs: 5,
            ..Default::default()
        };
        assert_eq!(config.autoupdate_interval(), Duration::from_secs(90));
        assert_eq!(config.autoupdate_initial_delay(), Duration::from_secs(5));
    }

    #[test]
    fn default_update_directory_is_absolute() {
        // HOME / LOCALAPPDATA is always set in dev and CI.
        assert!(default_update_directory().is_absolute());
    }
}
