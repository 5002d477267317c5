//! Plugin process supervisor.
//!
//! Drives the reported lifecycle of installed plugins:
//!
//! ```text
//! stopped --start--> loading --(handshake + dispense)--> running
//! loading --(failure / timeout)--> error
//! running --stop--> stopped
//! error --start--> loading
//! ```
//!
//! `start` checks its preconditions synchronously, marks the descriptor
//! `loading` and hands the launch to a background task. The task owns the
//! descriptor's lifecycle lock until it settles, so a `stop` issued while a
//! start is in flight waits for it instead of racing it. A second `start`
//! in that window fails at once with [`PluginError::StartInProgress`].
//!
//! Status in the store is reported, not authoritative: [`PluginSupervisor::health`]
//! re-checks the live process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tessera_plugin_protocol::HealthResult;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::capability::Capability;
use crate::descriptor::{
    DescriptorFilter, DescriptorId, PluginDescriptor, PluginKey, PluginStatus, StatusUpdate,
};
use crate::error::{PluginError, PluginResult};
use crate::keyed::{KeyedGuard, KeyedLocks};
use crate::launcher::{LaunchSpec, PluginConnection, PluginLauncher};
use crate::store::DescriptorStore;

/// Message recorded when a live process is found dead.
pub const EXITED_UNEXPECTEDLY: &str = "plugin process exited unexpectedly";

/// Supervisor tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Bound on spawn + handshake + dispense.
    pub start_timeout: Duration,
    /// Pause between the stop and start halves of a restart.
    pub restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            restart_delay: Duration::from_secs(1),
        }
    }
}

struct LiveHandle {
    key: PluginKey,
    connection: Arc<dyn PluginConnection>,
    capability: Capability,
}

struct Inner {
    store: Arc<dyn DescriptorStore>,
    launcher: Arc<dyn PluginLauncher>,
    config: SupervisorConfig,
    live: Mutex<HashMap<DescriptorId, LiveHandle>>,
    starting: Mutex<HashSet<DescriptorId>>,
    locks: KeyedLocks<DescriptorId>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Starts, stops and restarts plugin processes by descriptor id.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PluginSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PluginSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSupervisor")
            .field("config", &self.inner.config)
            .field("running", &self.running_ids().len())
            .field("shutting_down", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PluginSupervisor {
    /// Create a supervisor.
    #[must_use]
    pub fn new(
        store: Arc<dyn DescriptorStore>,
        launcher: Arc<dyn PluginLauncher>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                launcher,
                config,
                live: Mutex::new(HashMap::new()),
                starting: Mutex::new(HashSet::new()),
                locks: KeyedLocks::new(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Supervisor tuning in effect.
    #[must_use]
    pub fn config(&self) -> SupervisorConfig {
        self.inner.config
    }

    /// Begin starting a plugin.
    ///
    /// Returns once the descriptor is `loading`; the outcome is reported
    /// through its status (`running` or `error`).
    ///
    /// # Errors
    ///
    /// Precondition failures leave the descriptor untouched:
    /// [`PluginError::NotFound`], [`PluginError::Disabled`],
    /// [`PluginError::BinaryMissing`], [`PluginError::UnresolvedDependency`],
    /// [`PluginError::DependencyNotRunning`], [`PluginError::AlreadyRunning`],
    /// [`PluginError::StartInProgress`] and [`PluginError::ShuttingDown`].
    pub async fn start(&self, id: DescriptorId) -> PluginResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PluginError::ShuttingDown);
        }
        let claim = StartClaim::acquire(&self.inner, id)?;
        let guard = self.inner.locks.lock(id).await;

        let descriptor = self.check_startable(id).await?;
        self.inner
            .store
            .update_status(id, StatusUpdate::loading())
            .await?;
        info!(plugin_id = %id, key = %descriptor.key, "Starting plugin");

        let this = self.clone();
        self.inner.tasks.spawn(async move {
            this.run_start(descriptor, claim, guard).await;
        });
        Ok(())
    }

    /// Stop a running plugin.
    ///
    /// Waits for an in-flight start of the same plugin to settle first.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotRunning`] when no live handle exists.
    pub async fn stop(&self, id: DescriptorId) -> PluginResult<()> {
        let _guard = self.inner.locks.lock(id).await;

        let handle = self.live().remove(&id);
        let Some(handle) = handle else {
            return Err(PluginError::NotRunning(id));
        };

        handle.connection.kill().await;
        self.inner
            .store
            .update_status(id, StatusUpdate::stopped())
            .await?;
        info!(plugin_id = %id, key = %handle.key, "Plugin stopped");
        Ok(())
    }

    /// Stop (tolerating a plugin that is not running), pause, then start.
    ///
    /// # Errors
    ///
    /// Any stop error other than [`PluginError::NotRunning`] aborts the
    /// restart; start errors are returned as from [`Self::start`].
    pub async fn restart(&self, id: DescriptorId) -> PluginResult<()> {
        match self.stop(id).await {
            Ok(()) | Err(PluginError::NotRunning(_)) => {},
            Err(e) => return Err(e),
        }
        tokio::time::sleep(self.inner.config.restart_delay).await;
        self.start(id).await
    }

    /// Start every enabled autostart plugin that is not live, each in its
    /// own task. Failures are logged. Returns the number of tasks spawned.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store cannot be listed.
    pub async fn auto_start_all(&self) -> PluginResult<usize> {
        let candidates = self.inner.store.list_auto_start().await?;
        let mut scheduled = 0usize;
        for descriptor in candidates {
            if self.is_live(descriptor.id) {
                continue;
            }
            let this = self.clone();
            self.inner.tasks.spawn(async move {
                if let Err(e) = this.start(descriptor.id).await {
                    warn!(
                        plugin_id = %descriptor.id,
                        key = %descriptor.key,
                        error = %e,
                        "Autostart failed"
                    );
                }
            });
            scheduled = scheduled.saturating_add(1);
        }
        info!(scheduled, "Autostart scheduled");
        Ok(scheduled)
    }

    /// Mark descriptors reported `running` or `loading` without a live
    /// handle as `stopped`. Run once at boot, before anything is started.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn reset_stale_statuses(&self) -> PluginResult<usize> {
        let all = self.inner.store.list(&DescriptorFilter::default()).await?;
        let mut reset = 0usize;
        for descriptor in all {
            let stale = matches!(
                descriptor.status,
                PluginStatus::Running | PluginStatus::Loading
            );
            if stale && !self.is_live(descriptor.id) {
                self.inner
                    .store
                    .update_status(descriptor.id, StatusUpdate::stopped())
                    .await?;
                debug!(plugin_id = %descriptor.id, key = %descriptor.key, "Reset stale status");
                reset = reset.saturating_add(1);
            }
        }
        Ok(reset)
    }

    /// Probe a running plugin.
    ///
    /// A dead process is detected here: its handle is dropped and the
    /// descriptor set to `error`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotRunning`], [`PluginError::ProcessExited`]
    /// or the probe's own error.
    pub async fn health(&self, id: DescriptorId) -> PluginResult<HealthResult> {
        let capability = self.capability(id).await?;
        match capability.probe().await {
            Err(e) if e.is_process_exit() => {
                self.mark_exited(id).await;
                Err(e)
            },
            other => other,
        }
    }

    /// The capability of a running plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotRunning`], or
    /// [`PluginError::ProcessExited`] when the process died since it
    /// started.
    pub async fn capability(&self, id: DescriptorId) -> PluginResult<Capability> {
        let found = {
            let live = self.live();
            live.get(&id)
                .map(|h| (h.connection.has_exited(), h.capability.clone(), h.key.clone()))
        };
        let Some((exited, capability, key)) = found else {
            return Err(PluginError::NotRunning(id));
        };
        if exited {
            self.mark_exited(id).await;
            return Err(PluginError::ProcessExited(key.to_string()));
        }
        Ok(capability)
    }

    /// Whether a handle whose process has not exited is cached for `id`.
    #[must_use]
    pub fn is_live(&self, id: DescriptorId) -> bool {
        self.live()
            .get(&id)
            .is_some_and(|h| !h.connection.has_exited())
    }

    /// Ids with a cached handle.
    #[must_use]
    pub fn running_ids(&self) -> Vec<DescriptorId> {
        let mut ids: Vec<DescriptorId> = self.live().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Poll the reported status until it leaves `loading`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if the descriptor disappears and
    /// [`PluginError::Timeout`] if it is still loading after `limit`.
    pub async fn wait_until_settled(
        &self,
        id: DescriptorId,
        limit: Duration,
    ) -> PluginResult<PluginDescriptor> {
        let poll = async {
            loop {
                let descriptor = self
                    .inner
                    .store
                    .get_by_id(id)
                    .await?
                    .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
                if descriptor.status != PluginStatus::Loading {
                    return Ok(descriptor);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        timeout(limit, poll).await.map_err(|_| PluginError::Timeout {
            operation: format!("waiting for plugin {id} to settle"),
            seconds: limit.as_secs_f64(),
        })?
    }

    /// Cancel in-flight starts, wait for background tasks and stop every
    /// running plugin. Later starts fail with [`PluginError::ShuttingDown`].
    pub async fn shutdown(&self) {
        info!("Shutting down plugin supervisor");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let ids = self.running_ids();
        let results = futures::future::join_all(ids.iter().map(|id| self.stop(*id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(plugin_id = %id, error = %e, "Failed to stop plugin during shutdown");
            }
        }
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<DescriptorId, LiveHandle>> {
        self.inner.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of descriptors with a lifecycle operation held or pending.
    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.inner.locks.len()
    }

    async fn check_startable(&self, id: DescriptorId) -> PluginResult<PluginDescriptor> {
        let store = &self.inner.store;
        let descriptor = store
            .get_by_id(id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        if !descriptor.enabled {
            return Err(PluginError::Disabled(descriptor.key));
        }
        if !descriptor.binary_path.is_file() {
            return Err(PluginError::BinaryMissing {
                plugin: descriptor.key,
                path: descriptor.binary_path,
            });
        }
        for dependency in &descriptor.dependencies {
            let Some(dep) = store.get_by_key(dependency).await? else {
                return Err(PluginError::UnresolvedDependency {
                    plugin: descriptor.key.clone(),
                    dependency: dependency.clone(),
                });
            };
            if dep.status != PluginStatus::Running {
                return Err(PluginError::DependencyNotRunning {
                    plugin: descriptor.key.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        let dead = {
            let mut live = self.live();
            match live.get(&id).map(|h| h.connection.has_exited()) {
                Some(false) => return Err(PluginError::AlreadyRunning(descriptor.key)),
                Some(true) => live.remove(&id),
                None => None,
            }
        };
        if let Some(dead) = dead {
            debug!(plugin_id = %id, key = %dead.key, "Discarding dead handle");
            dead.connection.kill().await;
        }
        Ok(descriptor)
    }

    async fn run_start(
        &self,
        descriptor: PluginDescriptor,
        claim: StartClaim,
        _guard: KeyedGuard<DescriptorId>,
    ) {
        let id = descriptor.id;
        let key = descriptor.key.clone();
        let limit = self.inner.config.start_timeout;
        let spec = LaunchSpec::for_descriptor(&descriptor, descriptor.binary_path.clone());
        let launcher = Arc::clone(&self.inner.launcher);

        let attempt = async {
            let connection = launcher.launch(spec).await?;
            match connection.dispense(descriptor.capability).await {
                Ok(capability) => Ok((connection, capability)),
                Err(e) => {
                    connection.kill().await;
                    Err(e)
                },
            }
        };

        // Dropping the attempt drops any half-started connection, which
        // kills the child.
        let outcome = tokio::select! {
            () = self.inner.shutdown.cancelled() => None,
            result = timeout(limit, attempt) => Some(result),
        };

        let update = match outcome {
            None => {
                info!(plugin_id = %id, key = %key, "Start cancelled by shutdown");
                StatusUpdate::stopped()
            },
            Some(Ok(Ok((connection, capability)))) => {
                info!(
                    plugin_id = %id,
                    key = %key,
                    pid = connection.pid(),
                    capability = %capability.kind(),
                    "Plugin running"
                );
                self.live().insert(
                    id,
                    LiveHandle {
                        key: key.clone(),
                        connection,
                        capability,
                    },
                );
                StatusUpdate::running()
            },
            Some(Ok(Err(e))) => {
                error!(plugin_id = %id, key = %key, error = %e, "Plugin failed to start");
                StatusUpdate::failed(e.to_string())
            },
            Some(Err(_)) => {
                let e = PluginError::Timeout {
                    operation: format!("starting plugin {key}"),
                    seconds: limit.as_secs_f64(),
                };
                error!(plugin_id = %id, key = %key, error = %e, "Plugin failed to start");
                StatusUpdate::failed(e.to_string())
            },
        };

        // Anyone who sees the settled status may start again.
        drop(claim);
        if let Err(e) = self.inner.store.update_status(id, update).await {
            warn!(plugin_id = %id, key = %key, error = %e, "Failed to record plugin status");
        }
    }

    async fn mark_exited(&self, id: DescriptorId) {
        let _guard = self.inner.locks.lock(id).await;

        let handle = self.live().remove(&id);
        let Some(handle) = handle else {
            return;
        };
        warn!(plugin_id = %id, key = %handle.key, "Plugin process exited unexpectedly");
        handle.connection.kill().await;
        if let Err(e) = self
            .inner
            .store
            .update_status(id, StatusUpdate::failed(EXITED_UNEXPECTEDLY))
            .await
        {
            warn!(plugin_id = %id, error = %e, "Failed to record plugin status");
        }
    }
}

/// Marks a start of one descriptor as in flight until dropped.
struct StartClaim {
    inner: Arc<Inner>,
    id: DescriptorId,
}

impl StartClaim {
    fn acquire(inner: &Arc<Inner>, id: DescriptorId) -> PluginResult<Self> {
        let mut starting = inner.starting.lock().unwrap_or_else(PoisonError::into_inner);
        if !starting.insert(id) {
            return Err(PluginError::StartInProgress(id));
        }
        Ok(Self {
            inner: Arc::clone(inner),
            id,
        })
    }
}

impl Drop for StartClaim {
    fn drop(&mut self) {
        self.inner
            .starting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
