//! Configuration struct definitions.
//!
//! Every field has a default matching `defaults.toml`, so a partial file
//! deserializes on its own.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin host settings.
    pub plugins: PluginsSection,
    /// External plugin heartbeat settings.
    pub heartbeat: HeartbeatSection,
    /// Logging settings.
    pub logging: LoggingSection,
}

/// `[plugins]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Root of `plugins/` and `versions/`. A leading `~/` is the home
    /// directory.
    pub root_dir: String,
    /// Descriptor registry file, relative to `root_dir` unless absolute.
    pub registry_file: String,
    /// Bound on spawn, handshake and dispense, in seconds.
    pub handshake_timeout_secs: u64,
    /// Pause inside a restart, in milliseconds.
    pub restart_delay_ms: u64,
    /// Cookie variable used when a manifest omits `magic_cookie_key`.
    pub default_cookie_key: String,
    /// Application protocol version used when a manifest omits it.
    pub default_protocol_version: u32,
    /// Largest accepted package, in bytes.
    pub max_archive_bytes: u64,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            root_dir: "~/.tessera".to_string(),
            registry_file: "registry.toml".to_string(),
            handshake_timeout_secs: 30,
            restart_delay_ms: 1000,
            default_cookie_key: "TESSERA_PLUGIN".to_string(),
            default_protocol_version: 1,
            max_archive_bytes: 104_857_600,
        }
    }
}

impl PluginsSection {
    /// `root_dir` with `~/` expanded against `home`.
    #[must_use]
    pub fn root_path(&self, home: &Path) -> PathBuf {
        expand_home(&self.root_dir, home)
    }

    /// Absolute location of the registry file.
    #[must_use]
    pub fn registry_path(&self, home: &Path) -> PathBuf {
        let file = expand_home(&self.registry_file, home);
        if file.is_absolute() {
            file
        } else {
            self.root_path(home).join(file)
        }
    }

    /// Handshake timeout.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Restart delay.
    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// `[heartbeat]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    /// Silence after which an external plugin is marked stopped.
    pub timeout_secs: u64,
    /// Interval between sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            sweep_interval_secs: 10,
        }
    }
}

impl HeartbeatSection {
    /// Heartbeat timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Level or `EnvFilter` expression.
    pub level: String,
    /// `pretty`, `compact`, `json` or `full`.
    pub format: String,
    /// Log to daily files in this directory instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            directory: None,
        }
    }
}

fn expand_home(raw: &str, home: &Path) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None if raw == "~" => home.to_path_buf(),
        None => PathBuf::from(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_path_expands_home() {
        let section = PluginsSection::default();
        assert_eq!(
            section.root_path(Path::new("/home/u")),
            PathBuf::from("/home/u/.tessera")
        );
    }

    #[test]
    fn test_registry_path_relative_and_absolute() {
        let mut section = PluginsSection {
            root_dir: "/srv/tessera".to_string(),
            ..PluginsSection::default()
        };
        assert_eq!(
            section.registry_path(Path::new("/home/u")),
            PathBuf::from("/srv/tessera/registry.toml")
        );
        section.registry_file = "/var/lib/tessera.toml".to_string();
        assert_eq!(
            section.registry_path(Path::new("/home/u")),
            PathBuf::from("/var/lib/tessera.toml")
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[plugins]\nrestart_delay_ms = 5\n").unwrap();
        assert_eq!(config.plugins.restart_delay(), Duration::from_millis(5));
        assert_eq!(config.plugins.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(config.heartbeat, HeartbeatSection::default());
    }
}
