//! Registry of self-registering external plugins.
//!
//! Plugins that run outside the host (started by an orchestrator, another
//! machine) announce themselves with [`HeartbeatRegistry::register`] and then
//! send periodic heartbeats. A sweeper marks entries whose last heartbeat is
//! older than the timeout as `stopped`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descriptor::PluginStatus;
use crate::error::{PluginError, PluginResult};

/// Default age after which an entry is considered gone.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// What an external plugin reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRegistration {
    /// Unique name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Where the plugin can be reached.
    pub address: String,
    /// Reported status.
    #[serde(default)]
    pub status: PluginStatus,
    /// When the plugin process started.
    pub started_at: DateTime<Utc>,
    /// Free-form labels.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A registration plus the time of its last heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredPlugin {
    /// The registration as last reported.
    #[serde(flatten)]
    pub registration: PluginRegistration,
    /// Last register or heartbeat.
    pub last_heartbeat: DateTime<Utc>,
}

/// In-memory table of external plugins keyed by name.
#[derive(Debug, Default)]
pub struct HeartbeatRegistry {
    entries: RwLock<HashMap<String, RegisteredPlugin>>,
}

impl HeartbeatRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an entry. Counts as a heartbeat.
    pub async fn register(&self, registration: PluginRegistration) {
        info!(
            name = %registration.name,
            version = %registration.version,
            address = %registration.address,
            "External plugin registered"
        );
        let entry = RegisteredPlugin {
            registration,
            last_heartbeat: Utc::now(),
        };
        self.entries
            .write()
            .await
            .insert(entry.registration.name.clone(), entry);
    }

    /// Record a heartbeat, optionally updating the reported status.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for an unknown name.
    pub async fn heartbeat(&self, name: &str, status: Option<PluginStatus>) -> PluginResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        entry.last_heartbeat = Utc::now();
        if let Some(status) = status {
            entry.registration.status = status;
        }
        debug!(name, status = %entry.registration.status, "Heartbeat");
        Ok(())
    }

    /// Mark entries silent for longer than `timeout` as `stopped`.
    ///
    /// Returns the names that changed status in this sweep.
    pub async fn sweep(&self, timeout: Duration) -> Vec<String> {
        self.sweep_at(Utc::now(), timeout).await
    }

    async fn sweep_at(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let cutoff = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut swept = Vec::new();
        let mut entries = self.entries.write().await;
        for (name, entry) in entries.iter_mut() {
            if entry.last_heartbeat < cutoff && entry.registration.status != PluginStatus::Stopped
            {
                entry.registration.status = PluginStatus::Stopped;
                warn!(name = %name, last_heartbeat = %entry.last_heartbeat, "Heartbeat timed out");
                swept.push(name.clone());
            }
        }
        swept.sort();
        swept
    }

    /// Look up an entry.
    pub async fn get(&self, name: &str) -> Option<RegisteredPlugin> {
        self.entries.read().await.get(name).cloned()
    }

    /// All entries, sorted by name.
    pub async fn list(&self) -> Vec<RegisteredPlugin> {
        let mut all: Vec<RegisteredPlugin> = self.entries.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.registration.name.cmp(&b.registration.name));
        all
    }

    /// Remove an entry. Returns `true` if it existed.
    pub async fn deregister(&self, name: &str) -> bool {
        self.entries.write().await.remove(name).is_some()
    }

    /// Run [`Self::sweep`] every `interval` until `cancel` fires.
    #[must_use]
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = self.sweep(timeout).await;
                        if !swept.is_empty() {
                            info!(count = swept.len(), "Marked silent external plugins stopped");
                        }
                    },
                }
            }
            debug!("Heartbeat sweeper stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::arithmetic_side_effects)]
mod tests {
    use super::*;

    fn registration(name: &str) -> PluginRegistration {
        PluginRegistration {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            address: "127.0.0.1:9000".to_string(),
            status: PluginStatus::Running,
            started_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let registry = HeartbeatRegistry::new();
        registry.register(registration("b")).await;
        registry.register(registration("a")).await;

        let names: Vec<_> = registry
            .list()
            .await
            .into_iter()
            .map(|e| e.registration.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.get("a").await.is_some());
        assert!(registry.get("zzz").await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown() {
        let registry = HeartbeatRegistry::new();
        let err = registry.heartbeat("ghost", None).await.unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_updates_status() {
        let registry = HeartbeatRegistry::new();
        registry.register(registration("a")).await;
        registry
            .heartbeat("a", Some(PluginStatus::Error))
            .await
            .unwrap();
        assert_eq!(
            registry.get("a").await.unwrap().registration.status,
            PluginStatus::Error
        );
    }

    #[tokio::test]
    async fn test_sweep_marks_silent_entries() {
        let registry = HeartbeatRegistry::new();
        registry.register(registration("a")).await;

        assert!(registry.sweep(Duration::from_secs(30)).await.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(60);
        let swept = registry.sweep_at(later, Duration::from_secs(30)).await;
        assert_eq!(swept, vec!["a"]);
        assert_eq!(
            registry.get("a").await.unwrap().registration.status,
            PluginStatus::Stopped
        );

        // Already stopped entries are not reported again.
        assert!(registry
            .sweep_at(later, Duration::from_secs(30))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_deregister() {
        let registry = HeartbeatRegistry::new();
        registry.register(registration("a")).await;
        assert!(registry.deregister("a").await);
        assert!(!registry.deregister("a").await);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let registry = Arc::new(HeartbeatRegistry::new());
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&registry).spawn_sweeper(
            Duration::from_millis(10),
            Duration::from_secs(30),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
