//! Bridge from `tessera_config::ResolvedConfig` to host and logging types.

use std::path::PathBuf;

use tessera_config::ResolvedConfig;
use tessera_plugins::HostOptions;
use tessera_telemetry::{LogConfig, LogFormat};

/// Host options for the plugin manager.
pub(crate) fn to_host_options(resolved: &ResolvedConfig) -> HostOptions {
    let plugins = &resolved.config.plugins;
    let heartbeat = &resolved.config.heartbeat;
    HostOptions {
        root_dir: resolved.plugin_root(),
        handshake_timeout: plugins.handshake_timeout(),
        restart_delay: plugins.restart_delay(),
        default_cookie_key: plugins.default_cookie_key.clone(),
        default_protocol_version: plugins.default_protocol_version,
        max_archive_bytes: plugins.max_archive_bytes,
        heartbeat_timeout: heartbeat.timeout(),
        sweep_interval: heartbeat.sweep_interval(),
    }
}

/// Logging setup. `verbose` forces `debug`.
pub(crate) fn to_log_config(resolved: &ResolvedConfig, verbose: bool) -> LogConfig {
    let logging = &resolved.config.logging;
    let level = if verbose { "debug" } else { logging.level.as_str() };
    // Validation already rejected unknown formats.
    let format = logging.format.parse().unwrap_or(LogFormat::Compact);
    let config = LogConfig::new(level).with_format(format);
    match &logging.directory {
        Some(dir) => config.with_file_logging(expand(resolved, dir)),
        None => config,
    }
}

fn expand(resolved: &ResolvedConfig, raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => resolved.home_dir.join(rest),
        None => PathBuf::from(raw),
    }
}
