//! Subcommand implementations.

pub(crate) mod plugin;
pub(crate) mod resource;
pub(crate) mod run;

use std::sync::Arc;

use anyhow::Context;
use tessera_config::ResolvedConfig;
use tessera_plugins::{DescriptorId, FileDescriptorStore, PluginManager};

use crate::config_bridge;

/// Open the plugin manager over the configured registry file.
pub(crate) fn open_manager(resolved: &ResolvedConfig) -> PluginManager {
    let store = Arc::new(FileDescriptorStore::new(resolved.registry_path()));
    PluginManager::with_process_launcher(store, config_bridge::to_host_options(resolved))
}

/// Parse a descriptor id given on the command line.
pub(crate) fn parse_id(raw: &str) -> anyhow::Result<DescriptorId> {
    raw.parse()
        .with_context(|| format!("'{raw}' is not a plugin id"))
}
