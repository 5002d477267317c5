//! TOML-file descriptor store.
//!
//! The registry file holds a `schema_version` and a flat `[[plugin]]` array.
//! Readers take a shared lock and writers an exclusive lock on a `.lk`
//! sibling, so several host processes (or a host and the CLI) can share one
//! registry. Every write goes through a temporary file in the same
//! directory that is synced and renamed into place.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DescriptorStore, sort_by_creation};
use crate::descriptor::{
    DescriptorFilter, DescriptorId, FlagsUpdate, PluginDescriptor, PluginKey, StatusUpdate,
};
use crate::error::{PluginError, PluginResult};

/// Current registry schema version.
const SCHEMA_VERSION: u32 = 1;

/// Default registry file name.
pub const REGISTRY_FILE_NAME: &str = "registry.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    schema_version: u32,
    #[serde(default, rename = "plugin")]
    plugins: Vec<PluginDescriptor>,
}

/// Descriptor store persisted as a TOML file.
#[derive(Debug, Clone)]
pub struct FileDescriptorStore {
    path: PathBuf,
}

impl FileDescriptorStore {
    /// Use the registry at `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the registry file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<T, F>(&self, f: F) -> PluginResult<T>
    where
        T: Send + 'static,
        F: FnOnce(RegistryFile) -> PluginResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let registry = load(&path)?;
            f(registry)
        })
        .await
        .map_err(|e| PluginError::Storage(format!("registry task failed: {e}")))?
    }

    async fn update<T, F>(&self, f: F) -> PluginResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RegistryFile) -> PluginResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || update(&path, f))
            .await
            .map_err(|e| PluginError::Storage(format!("registry task failed: {e}")))?
    }
}

#[async_trait]
impl DescriptorStore for FileDescriptorStore {
    async fn get_by_id(&self, id: DescriptorId) -> PluginResult<Option<PluginDescriptor>> {
        self.read(move |r| Ok(r.plugins.into_iter().find(|d| d.id == id)))
            .await
    }

    async fn get_by_key(&self, key: &PluginKey) -> PluginResult<Option<PluginDescriptor>> {
        let key = key.clone();
        self.read(move |r| Ok(r.plugins.into_iter().find(|d| d.key == key)))
            .await
    }

    async fn list(&self, filter: &DescriptorFilter) -> PluginResult<Vec<PluginDescriptor>> {
        let filter = filter.clone();
        self.read(move |r| {
            let mut found: Vec<PluginDescriptor> = r
                .plugins
                .into_iter()
                .filter(|d| filter.matches(d))
                .collect();
            sort_by_creation(&mut found);
            Ok(found)
        })
        .await
    }

    async fn update_status(
        &self,
        id: DescriptorId,
        update: StatusUpdate,
    ) -> PluginResult<PluginDescriptor> {
        self.update(move |r| {
            let descriptor = r
                .plugins
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            descriptor.apply_status(&update);
            Ok(descriptor.clone())
        })
        .await
    }

    async fn update_flags(
        &self,
        id: DescriptorId,
        flags: FlagsUpdate,
    ) -> PluginResult<PluginDescriptor> {
        self.update(move |r| {
            let descriptor = r
                .plugins
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            descriptor.apply_flags(&flags);
            Ok(descriptor.clone())
        })
        .await
    }

    async fn create(&self, descriptor: PluginDescriptor) -> PluginResult<()> {
        self.update(move |r| {
            if r.plugins.iter().any(|d| d.key == descriptor.key) {
                return Err(PluginError::DuplicateKey(descriptor.key));
            }
            r.plugins.push(descriptor);
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: DescriptorId) -> PluginResult<bool> {
        self.update(move |r| {
            let before = r.plugins.len();
            r.plugins.retain(|d| d.id != id);
            Ok(r.plugins.len() < before)
        })
        .await
    }
}

/// Load the registry under a shared lock. A missing file is an empty
/// registry.
fn load(path: &Path) -> PluginResult<RegistryFile> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| storage_error(path, "create parent directory", &e))?;
    }
    let _lock_guard = acquire_lock_file(path, LockMode::Shared)?;
    read_unlocked(path)
}

/// Load, mutate and save under one exclusive lock so concurrent writers
/// cannot interleave and lose entries. Nothing is written if `f` fails.
fn update<T, F>(path: &Path, f: F) -> PluginResult<T>
where
    F: FnOnce(&mut RegistryFile) -> PluginResult<T>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| storage_error(path, "create parent directory", &e))?;
    }
    let _lock_guard = acquire_lock_file(path, LockMode::Exclusive)?;

    let mut registry = read_unlocked(path)?;
    let out = f(&mut registry)?;
    save_unlocked(path, &registry)?;
    Ok(out)
}

fn read_unlocked(path: &Path) -> PluginResult<RegistryFile> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RegistryFile {
                schema_version: SCHEMA_VERSION,
                plugins: Vec::new(),
            });
        },
        Err(e) => return Err(storage_error(path, "read registry", &e)),
    };

    let registry: RegistryFile =
        toml::from_str(&content).map_err(|e| storage_error(path, "parse registry", &e))?;

    if registry.schema_version != SCHEMA_VERSION {
        warn!(
            path = %path.display(),
            found = registry.schema_version,
            expected = SCHEMA_VERSION,
            "Registry schema version mismatch, attempting best-effort load"
        );
    }
    Ok(registry)
}

fn save_unlocked(path: &Path, registry: &RegistryFile) -> PluginResult<()> {
    let header = "# Managed by tessera. Do not edit while the host is running.\n\n";
    let body = toml::to_string_pretty(&RegistryFile {
        schema_version: SCHEMA_VERSION,
        plugins: registry.plugins.clone(),
    })
    .map_err(|e| storage_error(path, "serialize registry", &e))?;

    let parent = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| storage_error(path, "create temp file", &e))?;
    tmp.write_all(header.as_bytes())
        .and_then(|()| tmp.write_all(body.as_bytes()))
        .map_err(|e| storage_error(path, "write temp registry", &e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| storage_error(path, "sync temp registry", &e))?;
    tmp.persist(path)
        .map_err(|e| storage_error(path, "replace registry", &e))?;

    debug!(path = %path.display(), entries = registry.plugins.len(), "Saved plugin registry");
    Ok(())
}

fn storage_error(path: &Path, action: &str, e: &dyn std::fmt::Display) -> PluginError {
    PluginError::Storage(format!("{action} at {}: {e}", path.display()))
}

#[derive(Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Lock a `.lk` sibling of `path`. The lock is released when the returned
/// file is dropped.
fn acquire_lock_file(path: &Path, mode: LockMode) -> PluginResult<File> {
    let mut lock_name = path.as_os_str().to_owned();
    lock_name.push(".lk");
    let lock_path = PathBuf::from(lock_name);

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| storage_error(&lock_path, "open lock file", &e))?;

    match mode {
        LockMode::Shared => FileExt::lock_shared(&file),
        LockMode::Exclusive => FileExt::lock_exclusive(&file),
    }
    .map_err(|e| storage_error(&lock_path, "acquire lock", &e))?;

    Ok(file)
}
