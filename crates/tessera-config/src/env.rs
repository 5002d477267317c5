//! `TESSERA_*` environment overrides.
//!
//! Overrides are the last layer: they win over every file. A value is
//! converted to the type the merged tree already holds at that path.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "TESSERA_ROOT_DIR",
        field_path: "plugins.root_dir",
    },
    EnvMapping {
        var_name: "TESSERA_REGISTRY_FILE",
        field_path: "plugins.registry_file",
    },
    EnvMapping {
        var_name: "TESSERA_HANDSHAKE_TIMEOUT_SECS",
        field_path: "plugins.handshake_timeout_secs",
    },
    EnvMapping {
        var_name: "TESSERA_RESTART_DELAY_MS",
        field_path: "plugins.restart_delay_ms",
    },
    EnvMapping {
        var_name: "TESSERA_DEFAULT_COOKIE_KEY",
        field_path: "plugins.default_cookie_key",
    },
    EnvMapping {
        var_name: "TESSERA_MAX_ARCHIVE_BYTES",
        field_path: "plugins.max_archive_bytes",
    },
    EnvMapping {
        var_name: "TESSERA_HEARTBEAT_TIMEOUT_SECS",
        field_path: "heartbeat.timeout_secs",
    },
    EnvMapping {
        var_name: "TESSERA_LOG_LEVEL",
        field_path: "logging.level",
    },
    EnvMapping {
        var_name: "TESSERA_LOG_FORMAT",
        field_path: "logging.format",
    },
];

/// Snapshot of the `TESSERA_*` variables in the process environment.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("TESSERA_"))
        .collect()
}

/// Apply every mapped variable present in `env_vars` to `merged`.
///
/// Returns the number of overrides applied.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] when a value does not convert to the
/// type of the field it overrides.
pub fn apply_env_overrides<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;
    for mapping in ENV_MAPPINGS {
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };
        let value = convert(mapping, lookup(merged, mapping.field_path), raw)?;
        set_path(merged, mapping.field_path, value);
        debug!(var = mapping.var_name, field = mapping.field_path, "applied env override");
        count = count.saturating_add(1);
    }
    Ok(count)
}

fn convert(
    mapping: &EnvMapping,
    existing: Option<&toml::Value>,
    raw: &str,
) -> ConfigResult<toml::Value> {
    let env_err = |message: String| ConfigError::EnvError {
        var_name: mapping.var_name.to_string(),
        message,
    };
    match existing {
        Some(toml::Value::Integer(_)) => raw
            .trim()
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|e| env_err(format!("expected an integer: {e}"))),
        Some(toml::Value::Boolean(_)) => raw
            .trim()
            .parse::<bool>()
            .map(toml::Value::Boolean)
            .map_err(|e| env_err(format!("expected true or false: {e}"))),
        _ => Ok(toml::Value::String(raw.to_string())),
    }
}

fn lookup<'a>(root: &'a toml::Value, path: &str) -> Option<&'a toml::Value> {
    path.split('.').try_fold(root, |node, key| node.get(key))
}

fn set_path(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut node = root;
    let mut parts = path.split('.').peekable();
    while let Some(key) = parts.next() {
        let toml::Value::Table(table) = node else {
            return;
        };
        if parts.peek().is_none() {
            table.insert(key.to_string(), value);
            return;
        }
        node = table
            .entry(key.to_string())
            .or_insert(toml::Value::Table(toml::Table::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> toml::Value {
        toml::from_str("[plugins]\nhandshake_timeout_secs = 30\nroot_dir = \"~/.tessera\"\n")
            .unwrap()
    }

    #[test]
    fn test_integer_override() {
        let mut merged = base();
        let env = HashMap::from([(
            "TESSERA_HANDSHAKE_TIMEOUT_SECS".to_string(),
            "5".to_string(),
        )]);
        assert_eq!(apply_env_overrides(&mut merged, &env).unwrap(), 1);
        assert_eq!(
            lookup(&merged, "plugins.handshake_timeout_secs"),
            Some(&toml::Value::Integer(5))
        );
    }

    #[test]
    fn test_bad_integer() {
        let mut merged = base();
        let env = HashMap::from([(
            "TESSERA_HANDSHAKE_TIMEOUT_SECS".to_string(),
            "soon".to_string(),
        )]);
        let err = apply_env_overrides(&mut merged, &env).unwrap_err();
        assert!(matches!(err, ConfigError::EnvError { .. }));
    }

    #[test]
    fn test_creates_missing_table() {
        let mut merged = base();
        let env = HashMap::from([("TESSERA_LOG_LEVEL".to_string(), "debug".to_string())]);
        apply_env_overrides(&mut merged, &env).unwrap();
        assert_eq!(
            lookup(&merged, "logging.level").and_then(toml::Value::as_str),
            Some("debug")
        );
    }

    #[test]
    fn test_unmapped_vars_ignored() {
        let mut merged = base();
        let env = HashMap::from([("TESSERA_UNKNOWN".to_string(), "x".to_string())]);
        assert_eq!(apply_env_overrides(&mut merged, &env).unwrap(), 0);
    }
}
