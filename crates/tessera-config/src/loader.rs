//! Config file discovery and layered loading.
//!
//! 1. Parse `defaults.toml` → base
//! 2. Merge `/etc/tessera/config.toml` (system)
//! 3. Merge `~/.tessera/config.toml` (user)
//! 4. Merge the explicit `--config` file, which must exist
//! 5. Apply `TESSERA_*` overrides
//! 6. Deserialize and validate

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_overrides, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// A loaded configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The merged, validated configuration.
    pub config: Config,
    /// Files that contributed, lowest precedence first.
    pub loaded_files: Vec<String>,
    /// Home directory used for `~/` expansion.
    pub home_dir: PathBuf,
}

impl ResolvedConfig {
    /// Plugin root directory with `~/` expanded.
    #[must_use]
    pub fn plugin_root(&self) -> PathBuf {
        self.config.plugins.root_path(&self.home_dir)
    }

    /// Registry file location.
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.config.plugins.registry_path(&self.home_dir)
    }
}

/// Load the configuration with layered file precedence.
///
/// `explicit` is a file named on the command line; unlike the other layers
/// it must exist. `home_override` replaces the detected home directory,
/// which is used both for the user layer and for `~/` expansion.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any file is unreadable or malformed, an
/// environment override does not convert, or validation fails.
pub fn load(explicit: Option<&Path>, home_override: Option<&Path>) -> ConfigResult<ResolvedConfig> {
    let home_dir = match home_override {
        Some(h) => h.to_path_buf(),
        None => home_directory()?,
    };

    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;
    let mut loaded_files = Vec::new();

    let system_path = PathBuf::from("/etc/tessera/config.toml");
    let user_path = home_dir.join(".tessera").join("config.toml");
    for (layer, path) in [("system", &system_path), ("user", &user_path)] {
        if let Some(overlay) = try_load_file(path)? {
            deep_merge(&mut merged, &overlay);
            loaded_files.push(path.display().to_string());
            info!(path = %path.display(), layer, "loaded config");
        }
    }

    if let Some(path) = explicit {
        let overlay = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
            path: path.display().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        deep_merge(&mut merged, &overlay);
        loaded_files.push(path.display().to_string());
        info!(path = %path.display(), layer = "explicit", "loaded config");
    }

    let env_count = apply_env_overrides(&mut merged, &collect_env_vars())?;
    if env_count > 0 {
        debug!(count = env_count, "applied environment overrides");
    }

    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;
    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        loaded_files,
        home_dir,
    })
}

/// Load a config from a specific file path (no layering).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed or
/// validated.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let value = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    })?;
    let config: Config = value
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })?;
    validate::validate(&config)?;
    Ok(config)
}

/// Recursively merge `overlay` into `base`. Tables merge per key; anything
/// else in the overlay replaces the base value.
pub fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                if let Some(base_val) = base_table.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}

/// Read and parse a file, returning `None` if it does not exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    let size = u64::try_from(content.len()).unwrap_or(u64::MAX);
    if size > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {size} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit"
            ),
        });
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(Some(value))
}

fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_deserialize_to_config() {
        let config: Config = toml::from_str(DEFAULTS_TOML).unwrap();
        assert_eq!(config, Config::default());
        assert!(validate::validate(&config).is_ok());
    }

    #[test]
    fn test_user_and_explicit_layers() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".tessera")).unwrap();
        std::fs::write(
            home.path().join(".tessera/config.toml"),
            "[plugins]\nrestart_delay_ms = 250\nhandshake_timeout_secs = 10\n",
        )
        .unwrap();
        let explicit = home.path().join("host.toml");
        std::fs::write(&explicit, "[plugins]\nhandshake_timeout_secs = 5\n").unwrap();

        let resolved = load(Some(&explicit), Some(home.path())).unwrap();
        assert_eq!(resolved.config.plugins.restart_delay_ms, 250);
        assert_eq!(resolved.config.plugins.handshake_timeout_secs, 5);
        assert_eq!(resolved.loaded_files.len(), 2);
        assert_eq!(resolved.plugin_root(), home.path().join(".tessera"));
        assert_eq!(
            resolved.registry_path(),
            home.path().join(".tessera/registry.toml")
        );
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let home = tempfile::tempdir().unwrap();
        let result = load(Some(&home.path().join("missing.toml")), Some(home.path()));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_invalid_layer_is_rejected() {
        let home = tempfile::tempdir().unwrap();
        let explicit = home.path().join("host.toml");
        std::fs::write(&explicit, "[heartbeat]\ntimeout_secs = 0\n").unwrap();
        let result = load(Some(&explicit), Some(home.path()));
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_deep_merge_replaces_scalars_only() {
        let mut base: toml::Value = toml::from_str("[a]\nx = 1\ny = 2\n").unwrap();
        let overlay: toml::Value = toml::from_str("[a]\ny = 3\n").unwrap();
        deep_merge(&mut base, &overlay);
        assert_eq!(base["a"]["x"].as_integer(), Some(1));
        assert_eq!(base["a"]["y"].as_integer(), Some(3));
    }

    #[test]
    fn test_load_file_nonexistent() {
        let result = load_file(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_oversized_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("huge.toml");
        let data = "x = \"".to_owned() + &"a".repeat(1_100_000) + "\"";
        std::fs::write(&file_path, data).unwrap();

        let result = try_load_file(&file_path);
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }
}
