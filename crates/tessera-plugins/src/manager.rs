//! Host facade tying the installer, supervisor, loader and heartbeat
//! registry to one descriptor store and one directory tree.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tessera_plugin_protocol::{DEFAULT_COOKIE_KEY, DEFAULT_PROTOCOL_VERSION};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descriptor::{DescriptorFilter, DescriptorId, FlagsUpdate, PluginDescriptor};
use crate::error::{PluginError, PluginResult};
use crate::heartbeat::{DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_SWEEP_INTERVAL, HeartbeatRegistry};
use crate::installer::{DEFAULT_MAX_ARCHIVE_BYTES, InstallDefaults, PackageInstaller};
use crate::launcher::{PluginLauncher, ProcessLauncher};
use crate::loader::PluginLoader;
use crate::paths::PluginPaths;
use crate::store::DescriptorStore;
use crate::supervisor::{PluginSupervisor, SupervisorConfig};

/// Host tuning, usually built from the configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOptions {
    /// Root of `plugins/` and `versions/`.
    pub root_dir: PathBuf,
    /// Bound on spawn + handshake + dispense (+ `Init` for the loader).
    pub handshake_timeout: Duration,
    /// Pause inside a restart.
    pub restart_delay: Duration,
    /// Cookie variable name when a manifest omits it.
    pub default_cookie_key: String,
    /// Application protocol version when a manifest omits it.
    pub default_protocol_version: u32,
    /// Largest accepted archive.
    pub max_archive_bytes: u64,
    /// Silence after which an external plugin is marked stopped.
    pub heartbeat_timeout: Duration,
    /// Interval of the heartbeat sweeper.
    pub sweep_interval: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        let supervisor = SupervisorConfig::default();
        Self {
            root_dir: PathBuf::from("."),
            handshake_timeout: supervisor.start_timeout,
            restart_delay: supervisor.restart_delay,
            default_cookie_key: DEFAULT_COOKIE_KEY.to_string(),
            default_protocol_version: DEFAULT_PROTOCOL_VERSION,
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Everything a host process needs to manage plugins.
pub struct PluginManager {
    store: Arc<dyn DescriptorStore>,
    paths: PluginPaths,
    options: HostOptions,
    installer: PackageInstaller,
    supervisor: PluginSupervisor,
    loader: Arc<PluginLoader>,
    heartbeat: Arc<HeartbeatRegistry>,
    sweeper_cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("paths", &self.paths)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Wire a manager around `store` and `launcher`.
    #[must_use]
    pub fn new(
        store: Arc<dyn DescriptorStore>,
        launcher: Arc<dyn PluginLauncher>,
        options: HostOptions,
    ) -> Self {
        let paths = PluginPaths::new(&options.root_dir);
        let installer = PackageInstaller::new(Arc::clone(&store), paths.clone()).with_defaults(
            InstallDefaults {
                cookie_key: options.default_cookie_key.clone(),
                protocol_version: options.default_protocol_version,
                max_archive_bytes: options.max_archive_bytes,
            },
        );
        let supervisor = PluginSupervisor::new(
            Arc::clone(&store),
            Arc::clone(&launcher),
            SupervisorConfig {
                start_timeout: options.handshake_timeout,
                restart_delay: options.restart_delay,
            },
        );
        let loader = Arc::new(
            PluginLoader::new(Arc::clone(&store), launcher, paths.clone())
                .with_load_timeout(options.handshake_timeout),
        );

        Self {
            store,
            paths,
            options,
            installer,
            supervisor,
            loader,
            heartbeat: Arc::new(HeartbeatRegistry::new()),
            sweeper_cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// A manager launching real processes.
    #[must_use]
    pub fn with_process_launcher(store: Arc<dyn DescriptorStore>, options: HostOptions) -> Self {
        Self::new(store, Arc::new(ProcessLauncher::new()), options)
    }

    /// Plugin directory layout.
    #[must_use]
    pub fn paths(&self) -> &PluginPaths {
        &self.paths
    }

    /// The supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &PluginSupervisor {
        &self.supervisor
    }

    /// The versioned loader.
    #[must_use]
    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    /// The external plugin registry.
    #[must_use]
    pub fn heartbeat(&self) -> &Arc<HeartbeatRegistry> {
        &self.heartbeat
    }

    /// Validate and install a package.
    ///
    /// # Errors
    ///
    /// See [`PackageInstaller::install`].
    pub async fn install(&self, archive_bytes: &[u8]) -> PluginResult<PluginDescriptor> {
        self.installer.install(archive_bytes).await
    }

    /// Load a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for an unknown id.
    pub async fn get(&self, id: DescriptorId) -> PluginResult<PluginDescriptor> {
        self.store
            .get_by_id(id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// List descriptors.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn list(&self, filter: &DescriptorFilter) -> PluginResult<Vec<PluginDescriptor>> {
        self.store.list(filter).await
    }

    /// Stop, release and delete a plugin and everything it wrote to disk.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for an unknown id, or the stop
    /// error if a running plugin cannot be stopped.
    pub async fn uninstall(&self, id: DescriptorId) -> PluginResult<PluginDescriptor> {
        let descriptor = self.get(id).await?;

        match self.supervisor.stop(id).await {
            Ok(()) | Err(PluginError::NotRunning(_)) => {},
            Err(e) => return Err(e),
        }
        let released = self.loader.release_descriptor(id).await;
        if released > 0 {
            debug!(plugin_id = %id, released, "Released loaded versions");
        }

        remove_dir(&self.paths.plugin_dir(&descriptor.key));
        remove_dir(&self.paths.key_versions_dir(&descriptor.key));
        if let Some(archive) = &descriptor.archive_path {
            remove_file(archive);
        }

        self.store.delete(id).await?;
        info!(plugin_id = %id, key = %descriptor.key, "Plugin uninstalled");
        Ok(descriptor)
    }

    /// Enable or disable a plugin. Disabling does not stop it.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for an unknown id.
    pub async fn set_enabled(&self, id: DescriptorId, enabled: bool) -> PluginResult<PluginDescriptor> {
        self.store
            .update_flags(
                id,
                FlagsUpdate {
                    enabled: Some(enabled),
                    auto_start: None,
                },
            )
            .await
    }

    /// Toggle autostart.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for an unknown id.
    pub async fn set_auto_start(
        &self,
        id: DescriptorId,
        auto_start: bool,
    ) -> PluginResult<PluginDescriptor> {
        self.store
            .update_flags(
                id,
                FlagsUpdate {
                    enabled: None,
                    auto_start: Some(auto_start),
                },
            )
            .await
    }

    /// Host startup: clear stale statuses, autostart plugins and start the
    /// heartbeat sweeper. Returns the number of autostart tasks spawned.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn boot(&self) -> PluginResult<usize> {
        let reset = self.supervisor.reset_stale_statuses().await?;
        if reset > 0 {
            info!(reset, "Reset stale plugin statuses");
        }
        let scheduled = self.supervisor.auto_start_all().await?;

        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_none() {
            *sweeper = Some(Arc::clone(&self.heartbeat).spawn_sweeper(
                self.options.sweep_interval,
                self.options.heartbeat_timeout,
                self.sweeper_cancel.clone(),
            ));
        }
        Ok(scheduled)
    }

    /// Stop everything the host started.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        let released = self.loader.release_all().await;
        if released > 0 {
            debug!(released, "Released loaded versions");
        }

        self.sweeper_cancel.cancel();
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Heartbeat sweeper task failed");
        }
        info!("Plugin host stopped");
    }
}

fn remove_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!(dir = %dir.display(), "Removed directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove directory"),
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove file");
    }
}
