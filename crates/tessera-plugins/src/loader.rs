//! Versioned plugin loader.
//!
//! Resolves `(name, version)` to a [`StoreCapability`], starting the plugin
//! process on first use and caching the live connection under
//! `name_version`. The loader is independent of the supervisor's reported
//! status: it only requires the descriptor to be enabled.
//!
//! Binaries run from a per-version extraction of the installed archive
//! (`<versions>/<key>/<version>/`), so an upgrade installed under a new key
//! never disturbs a version that is still loaded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tessera_plugin_protocol::InitParams;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::archive;
use crate::capability::StoreCapability;
use crate::descriptor::{DescriptorId, PluginDescriptor, PluginKey, loader_key, parse_version};
use crate::error::{PluginError, PluginResult};
use crate::keyed::KeyedLocks;
use crate::launcher::{LaunchSpec, PluginConnection, PluginLauncher};
use crate::paths::PluginPaths;
use crate::store::DescriptorStore;

/// Default bound on spawn + handshake + dispense + `Init`.
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the best-effort `Destroy` call during release.
const DESTROY_TIMEOUT: Duration = Duration::from_secs(5);

struct Loaded {
    descriptor_id: DescriptorId,
    connection: Arc<dyn PluginConnection>,
    capability: StoreCapability,
}

/// Resolves plugins by name and version, lazily starting them.
pub struct PluginLoader {
    store: Arc<dyn DescriptorStore>,
    launcher: Arc<dyn PluginLauncher>,
    paths: PluginPaths,
    load_timeout: Duration,
    loaded: Mutex<HashMap<String, Loaded>>,
    gates: KeyedLocks<String>,
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("paths", &self.paths)
            .field("load_timeout", &self.load_timeout)
            .field("loaded", &self.loaded())
            .finish_non_exhaustive()
    }
}

impl PluginLoader {
    /// Create a loader.
    #[must_use]
    pub fn new(
        store: Arc<dyn DescriptorStore>,
        launcher: Arc<dyn PluginLauncher>,
        paths: PluginPaths,
    ) -> Self {
        Self {
            store,
            launcher,
            paths,
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            loaded: Mutex::new(HashMap::new()),
            gates: KeyedLocks::new(),
        }
    }

    /// Override the load timeout.
    #[must_use]
    pub fn with_load_timeout(mut self, load_timeout: Duration) -> Self {
        self.load_timeout = load_timeout;
        self
    }

    /// Resolve `(name, version)` to a store capability.
    ///
    /// Reuses the cached process when it is still alive; otherwise spawns
    /// one, dispenses `plugin_store`, calls `Init` and caches it. Concurrent
    /// calls for the same pair spawn at most one process.
    ///
    /// # Errors
    ///
    /// - [`PluginError::InvalidVersion`] before any lookup
    /// - [`PluginError::NotFound`] / [`PluginError::AmbiguousPlugin`]
    /// - [`PluginError::BinaryMissing`], extraction errors
    /// - launch, dispense, `Init` and timeout errors; the process is killed
    ///   and nothing is cached
    pub async fn resolve(&self, name: &str, version: &str) -> PluginResult<StoreCapability> {
        let parsed = parse_version(version)?;
        let canonical = parsed.to_string();
        let key = loader_key(name, &canonical);

        let _guard = self.gates.lock(key.clone()).await;

        let descriptor = self.lookup(name, version).await?;

        if let Some(capability) = self.cached(&key) {
            debug!(loader_key = %key, "Reusing loaded plugin");
            return Ok(capability);
        }

        let binary = self.ensure_binary(&descriptor).await?;
        let spec = LaunchSpec::for_descriptor(&descriptor, binary);
        let (connection, capability) = self.load(&descriptor, spec).await?;

        info!(
            plugin_id = %descriptor.id,
            key = %descriptor.key,
            loader_key = %key,
            pid = connection.pid(),
            "Plugin loaded"
        );
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                Loaded {
                    descriptor_id: descriptor.id,
                    connection,
                    capability: capability.clone(),
                },
            );
        Ok(capability)
    }

    /// Destroy and kill the cached process for `(name, version)`.
    ///
    /// Returns `false` when nothing was loaded under that pair.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidVersion`] for a malformed version.
    pub async fn release(&self, name: &str, version: &str) -> PluginResult<bool> {
        let canonical = parse_version(version)?.to_string();
        let key = loader_key(name, &canonical);
        Ok(self.release_key(&key).await)
    }

    /// Release every entry that belongs to `id`.
    pub async fn release_descriptor(&self, id: DescriptorId) -> usize {
        let keys: Vec<String> = self
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, l)| l.descriptor_id == id)
            .map(|(k, _)| k.clone())
            .collect();
        let mut released = 0usize;
        for key in keys {
            if self.release_key(&key).await {
                released = released.saturating_add(1);
            }
        }
        released
    }

    /// Release everything. Used at host shutdown.
    pub async fn release_all(&self) -> usize {
        let keys = self.loaded();
        let results = futures::future::join_all(keys.iter().map(|k| self.release_key(k))).await;
        results.into_iter().filter(|released| *released).count()
    }

    /// Keys (`name_version`) currently cached, sorted.
    #[must_use]
    pub fn loaded(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    async fn release_key(&self, key: &str) -> bool {
        let _guard = self.gates.lock(key.to_string()).await;

        let entry = self
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        let Some(entry) = entry else {
            return false;
        };

        if !entry.connection.has_exited() {
            match timeout(DESTROY_TIMEOUT, entry.capability.destroy()).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => debug!(loader_key = %key, error = %e, "Destroy failed"),
                Err(_) => debug!(loader_key = %key, "Destroy timed out"),
            }
        }
        entry.connection.kill().await;
        info!(loader_key = %key, "Plugin released");
        true
    }

    /// Number of keys with a resolve or release held or pending.
    #[cfg(test)]
    pub(crate) fn gate_count(&self) -> usize {
        self.gates.len()
    }

    async fn lookup(&self, name: &str, version: &str) -> PluginResult<PluginDescriptor> {
        let mut found = self.store.find_by_name_version(name, version).await?;
        match found.len() {
            0 => Err(PluginError::NotFound(format!("{name}@{version}"))),
            1 => found
                .pop()
                .ok_or_else(|| PluginError::NotFound(format!("{name}@{version}"))),
            count => Err(PluginError::AmbiguousPlugin {
                name: name.to_string(),
                version: version.to_string(),
                count,
            }),
        }
    }

    /// A capability from the cached connection, dropping the entry if its
    /// process has exited.
    fn cached(&self, key: &str) -> Option<StoreCapability> {
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        let alive = loaded.get(key).map(|l| !l.connection.has_exited())?;
        if alive {
            return loaded.get(key).map(|l| l.capability.clone());
        }
        warn!(loader_key = %key, "Cached plugin process exited, reloading");
        drop(loaded.remove(key));
        None
    }

    /// Path of the binary for `descriptor`, extracting its archive into
    /// the versioned directory on first use.
    async fn ensure_binary(&self, descriptor: &PluginDescriptor) -> PluginResult<PathBuf> {
        let Some(archive_path) = descriptor.archive_path.clone() else {
            return if descriptor.binary_path.is_file() {
                Ok(descriptor.binary_path.clone())
            } else {
                Err(PluginError::BinaryMissing {
                    plugin: descriptor.key.clone(),
                    path: descriptor.binary_path.clone(),
                })
            };
        };

        let dir = self.paths.version_dir(&descriptor.key, &descriptor.version);
        let binary = dir.join(&descriptor.binary_entry);
        if binary.is_file() {
            return Ok(binary);
        }

        let key = descriptor.key.clone();
        tokio::task::spawn_blocking(move || extract_version(&key, &archive_path, &dir, binary))
            .await
            .map_err(|e| PluginError::Extraction {
                message: format!("extraction task failed: {e}"),
            })?
    }

    async fn load(
        &self,
        descriptor: &PluginDescriptor,
        spec: LaunchSpec,
    ) -> PluginResult<(Arc<dyn PluginConnection>, StoreCapability)> {
        let limit = self.load_timeout;
        let launched = match timeout(limit, self.launcher.launch(spec)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PluginError::Timeout {
                    operation: format!("starting plugin {}", descriptor.key),
                    seconds: limit.as_secs_f64(),
                });
            },
        };

        let params = InitParams {
            plugin_name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            config: descriptor.config.clone(),
            ..InitParams::default()
        };
        let setup = async {
            let store = launched.dispense(descriptor.capability).await?.into_store()?;
            store.init(&params).await?;
            Ok::<_, PluginError>(store)
        };

        match timeout(limit, setup).await {
            Ok(Ok(store)) => Ok((launched, store)),
            Ok(Err(e)) => {
                launched.kill().await;
                Err(e)
            },
            Err(_) => {
                launched.kill().await;
                Err(PluginError::Timeout {
                    operation: format!("initializing plugin {}", descriptor.key),
                    seconds: limit.as_secs_f64(),
                })
            },
        }
    }
}

/// Unzip `archive_path` into `dir` and check that `binary` landed there.
fn extract_version(
    key: &PluginKey,
    archive_path: &Path,
    dir: &Path,
    binary: PathBuf,
) -> PluginResult<PathBuf> {
    let bytes = std::fs::read(archive_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PluginError::BinaryMissing {
                plugin: key.clone(),
                path: archive_path.to_path_buf(),
            }
        } else {
            e.into()
        }
    })?;
    std::fs::create_dir_all(dir)?;
    let files = archive::extract(&bytes, dir)?;
    if !binary.is_file() {
        return Err(PluginError::BinaryMissing {
            plugin: key.clone(),
            path: binary,
        });
    }
    archive::mark_executable(&binary)?;
    debug!(key = %key, dir = %dir.display(), files, "Extracted versioned plugin");
    Ok(binary)
}
