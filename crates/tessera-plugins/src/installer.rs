//! Package installer.
//!
//! Validation runs to completion before anything on disk changes:
//!
//! 1. the archive is readable and has a root `plugin-config.yaml`
//! 2. the manifest parses and carries every required field
//! 3. the key is valid and not registered
//! 4. every dependency is registered
//! 5. exactly one executable is present
//!
//! Only then is the install directory replaced, the archive extracted and
//! copied, and the descriptor created.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tessera_plugin_protocol::{DEFAULT_COOKIE_KEY, DEFAULT_PROTOCOL_VERSION};
use tracing::{debug, info, warn};

use crate::archive;
use crate::descriptor::{DescriptorId, HandshakeToken, PluginDescriptor, PluginStatus};
use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use crate::paths::PluginPaths;
use crate::store::DescriptorStore;

/// Default upper bound on the size of an uploaded archive (100 MB).
pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 104_857_600;

/// Values applied when a manifest leaves them out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallDefaults {
    /// Cookie variable name.
    pub cookie_key: String,
    /// Application protocol version used when the manifest omits it or
    /// the declared value does not parse.
    pub protocol_version: u32,
    /// Largest accepted archive, in bytes.
    pub max_archive_bytes: u64,
}

impl Default for InstallDefaults {
    fn default() -> Self {
        Self {
            cookie_key: DEFAULT_COOKIE_KEY.to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
        }
    }
}

/// Validates plugin packages and installs them.
pub struct PackageInstaller {
    store: Arc<dyn DescriptorStore>,
    paths: PluginPaths,
    defaults: InstallDefaults,
}

impl std::fmt::Debug for PackageInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageInstaller")
            .field("paths", &self.paths)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl PackageInstaller {
    /// Create an installer writing under `paths`.
    #[must_use]
    pub fn new(store: Arc<dyn DescriptorStore>, paths: PluginPaths) -> Self {
        Self {
            store,
            paths,
            defaults: InstallDefaults::default(),
        }
    }

    /// Override the manifest defaults.
    #[must_use]
    pub fn with_defaults(mut self, defaults: InstallDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Validate and install a zip package.
    ///
    /// # Errors
    ///
    /// Validation failures (`MalformedPackage`, `ManifestParse`,
    /// `InvalidKey`, `DuplicateKey`, `UnresolvedDependency`,
    /// `PackageTooLarge`) leave the filesystem and the store untouched.
    /// Extraction failures (`Io`, `Extraction`, `PathTraversal`,
    /// `UnsafeEntry`) remove the partially written install directory.
    pub async fn install(&self, archive_bytes: &[u8]) -> PluginResult<PluginDescriptor> {
        let size = u64::try_from(archive_bytes.len()).unwrap_or(u64::MAX);
        if size > self.defaults.max_archive_bytes {
            return Err(PluginError::PackageTooLarge {
                size,
                limit: self.defaults.max_archive_bytes,
            });
        }

        let layout = archive::inspect(archive_bytes)?;
        let manifest = PluginManifest::parse(&layout.manifest)?;
        manifest.validate()?;

        let key = manifest.plugin_key()?;
        if self.store.get_by_key(&key).await?.is_some() {
            return Err(PluginError::DuplicateKey(key));
        }

        let dependencies = manifest.dependency_keys()?;
        for dependency in &dependencies {
            if self.store.get_by_key(dependency).await?.is_none() {
                return Err(PluginError::UnresolvedDependency {
                    plugin: key,
                    dependency: dependency.clone(),
                });
            }
        }

        let binary_entry = layout.binary_entry()?.to_path_buf();
        let capability = manifest.capability_kind()?;
        let version = manifest.version.trim().to_string();

        // Destructive phase.
        let plugin_dir = self.paths.plugin_dir(&key);
        let archive_path = self.paths.archive_path(&key, &version);
        {
            let bytes = archive_bytes.to_vec();
            let plugin_dir = plugin_dir.clone();
            let archive_path = archive_path.clone();
            let binary_entry = binary_entry.clone();
            run_blocking(move || {
                let written = write_package(&bytes, &plugin_dir, &archive_path, &binary_entry);
                if written.is_err() {
                    cleanup(&plugin_dir, &archive_path);
                }
                written
            })
            .await?;
        }

        let now = Utc::now();
        let descriptor = PluginDescriptor {
            id: DescriptorId::new(),
            key: key.clone(),
            name: manifest.name.trim().to_string(),
            version,
            description: manifest.description.clone(),
            binary_path: plugin_dir.join(&binary_entry),
            binary_entry,
            archive_path: Some(archive_path.clone()),
            capability,
            config: manifest.config.clone(),
            dependencies,
            enabled: true,
            auto_start: manifest.auto_start,
            status: PluginStatus::Stopped,
            last_error: None,
            last_started_at: None,
            last_stopped_at: None,
            created_at: now,
            updated_at: now,
            handshake: HandshakeToken {
                protocol_version: manifest
                    .protocol_version
                    .unwrap_or(self.defaults.protocol_version),
                cookie_key: manifest.cookie_key_or(&self.defaults.cookie_key),
                cookie_value: manifest.magic_cookie_value.clone(),
            },
        };

        // A concurrent install of the same key can still win the race here.
        if let Err(e) = self.store.create(descriptor.clone()).await {
            let cleaned = run_blocking(move || {
                cleanup(&plugin_dir, &archive_path);
                Ok(())
            })
            .await;
            if let Err(cleanup_err) = cleaned {
                warn!(key = %key, error = %cleanup_err, "Cleanup after failed registration did not run");
            }
            return Err(e);
        }

        info!(
            plugin_id = %descriptor.id,
            key = %descriptor.key,
            version = %descriptor.version,
            binary = %descriptor.binary_path.display(),
            "Plugin installed"
        );
        Ok(descriptor)
    }
}

/// Run filesystem work off the async workers.
async fn run_blocking<F>(f: F) -> PluginResult<()>
where
    F: FnOnce() -> PluginResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PluginError::Extraction {
            message: format!("install task failed: {e}"),
        })?
}

fn write_package(
    archive_bytes: &[u8],
    plugin_dir: &Path,
    archive_path: &Path,
    binary_entry: &Path,
) -> PluginResult<()> {
    match std::fs::remove_dir_all(plugin_dir) {
        Ok(()) => debug!(dir = %plugin_dir.display(), "Removed stale plugin directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e.into()),
    }
    std::fs::create_dir_all(plugin_dir)?;

    let files = archive::extract(archive_bytes, plugin_dir)?;
    let binary_path = plugin_dir.join(binary_entry);
    if !binary_path.is_file() {
        return Err(PluginError::MalformedPackage(format!(
            "executable {} missing after extraction",
            binary_entry.display()
        )));
    }
    archive::mark_executable(&binary_path)?;

    if let Some(parent) = archive_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(archive_path, archive_bytes)?;

    debug!(dir = %plugin_dir.display(), files, "Extracted plugin package");
    Ok(())
}

fn cleanup(plugin_dir: &Path, archive_path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(plugin_dir)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(dir = %plugin_dir.display(), error = %e, "Failed to clean up plugin directory");
    }
    if let Err(e) = std::fs::remove_file(archive_path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %archive_path.display(), error = %e, "Failed to clean up archive copy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::{manifest, zip_bytes};
    use crate::descriptor::PluginKey;
    use crate::descriptor::fixtures::descriptor;
    use crate::store::MemoryDescriptorStore;
    use tessera_plugin_protocol::CapabilityKind;

    fn installer(dir: &tempfile::TempDir) -> (PackageInstaller, Arc<MemoryDescriptorStore>) {
        let store = Arc::new(MemoryDescriptorStore::new());
        let installer = PackageInstaller::new(store.clone(), PluginPaths::new(dir.path()));
        (installer, store)
    }

    fn package(key: &str, extra: &str) -> Vec<u8> {
        let m = manifest(key, extra);
        zip_bytes(&[
            ("plugin-config.yaml", &m),
            ("bin/", b""),
            ("bin/server", b"#!/bin/sh\nexit 0\n"),
            ("static/logo.svg", b"<svg/>"),
        ])
    }

    #[tokio::test]
    async fn test_install_creates_stopped_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, store) = installer(&dir);

        let d = installer.install(&package("demo", "")).await.unwrap();
        assert_eq!(d.status, PluginStatus::Stopped);
        assert!(d.enabled);
        assert!(!d.auto_start);
        assert_eq!(d.capability, CapabilityKind::PluginStore);
        assert_eq!(d.handshake.protocol_version, 1);
        assert_eq!(d.handshake.cookie_key, "TESSERA_PLUGIN");
        assert_eq!(d.handshake.cookie_value, "x");
        assert_eq!(d.binary_entry, Path::new("bin/server"));
        assert_eq!(d.binary_path, dir.path().join("plugins/demo/bin/server"));
        assert!(d.binary_path.is_file());
        assert!(dir.path().join("plugins/demo/static/logo.svg").is_file());
        assert!(d.archive_path.as_ref().unwrap().is_file());

        assert_eq!(store.get_by_id(d.id).await.unwrap().unwrap(), d);
    }

    #[tokio::test]
    async fn test_duplicate_key() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, _store) = installer(&dir);
        installer.install(&package("demo", "")).await.unwrap();

        let err = installer.install(&package("demo", "")).await.unwrap_err();
        assert!(matches!(err, PluginError::DuplicateKey(k) if k.as_str() == "demo"));
        // The first install is intact.
        assert!(dir.path().join("plugins/demo/bin/server").is_file());
    }

    #[tokio::test]
    async fn test_unresolved_dependency_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, store) = installer(&dir);

        let err = installer
            .install(&package("demo", "dependencies: [missing-dep]\n"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PluginError::UnresolvedDependency { ref dependency, .. } if dependency.as_str() == "missing-dep"
        ));
        assert!(
            store
                .get_by_key(&PluginKey::from_static("demo"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(!dir.path().join("plugins/demo").exists());
    }

    #[tokio::test]
    async fn test_resolved_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, store) = installer(&dir);
        store.create(descriptor("base", "Base", "1.0.0")).await.unwrap();

        let d = installer
            .install(&package("demo", "dependencies: [base]\nauto_start: true\n"))
            .await
            .unwrap();
        assert_eq!(d.dependencies, vec![PluginKey::from_static("base")]);
        assert!(d.auto_start);
    }

    #[tokio::test]
    async fn test_validation_order_manifest_before_binary() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, _store) = installer(&dir);

        // No binary and a missing required field: the manifest error wins.
        let bytes = zip_bytes(&[("plugin-config.yaml", b"key: demo\nname: Demo\n")]);
        let err = installer.install(&bytes).await.unwrap_err();
        assert!(matches!(err, PluginError::MalformedPackage(m) if m.contains("version")));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, _store) = installer(&dir);
        let m = manifest("demo", "");
        let bytes = zip_bytes(&[("plugin-config.yaml", &m), ("readme.txt", b"hi")]);
        let err = installer.install(&bytes).await.unwrap_err();
        assert!(matches!(err, PluginError::MalformedPackage(_)));
        assert!(!dir.path().join("plugins/demo").exists());
    }

    #[tokio::test]
    async fn test_invalid_key() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, _store) = installer(&dir);
        let err = installer.install(&package("Bad/Key", "")).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_archive_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, _store) = installer(&dir);
        let installer = installer.with_defaults(InstallDefaults {
            max_archive_bytes: 16,
            ..InstallDefaults::default()
        });
        let err = installer.install(&package("demo", "")).await.unwrap_err();
        assert!(matches!(err, PluginError::PackageTooLarge { limit: 16, .. }));
    }

    #[tokio::test]
    async fn test_manifest_overrides_and_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, _store) = installer(&dir);
        let installer = installer.with_defaults(InstallDefaults {
            cookie_key: "HOST_COOKIE".into(),
            protocol_version: 4,
            ..InstallDefaults::default()
        });

        let d = installer
            .install(&package("demo", "protocol_version: nope\ncapability: basic\n"))
            .await
            .unwrap();
        assert_eq!(d.handshake.protocol_version, 4);
        assert_eq!(d.handshake.cookie_key, "HOST_COOKIE");
        assert_eq!(d.capability, CapabilityKind::Basic);
    }

    #[tokio::test]
    async fn test_stale_directory_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, _store) = installer(&dir);
        let stale = dir.path().join("plugins/demo/leftover.txt");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "old").unwrap();

        installer.install(&package("demo", "")).await.unwrap();
        assert!(!stale.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_binary_marked_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let (installer, _store) = installer(&dir);
        let d = installer.install(&package("demo", "")).await.unwrap();
        let mode = std::fs::metadata(&d.binary_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    /// Store whose `create` loses a race to another installer.
    struct RacingStore(MemoryDescriptorStore);

    #[async_trait::async_trait]
    impl DescriptorStore for RacingStore {
        async fn get_by_id(&self, id: DescriptorId) -> PluginResult<Option<PluginDescriptor>> {
            self.0.get_by_id(id).await
        }

        async fn get_by_key(&self, key: &PluginKey) -> PluginResult<Option<PluginDescriptor>> {
            self.0.get_by_key(key).await
        }

        async fn list(
            &self,
            filter: &crate::descriptor::DescriptorFilter,
        ) -> PluginResult<Vec<PluginDescriptor>> {
            self.0.list(filter).await
        }

        async fn update_status(
            &self,
            id: DescriptorId,
            update: crate::descriptor::StatusUpdate,
        ) -> PluginResult<PluginDescriptor> {
            self.0.update_status(id, update).await
        }

        async fn update_flags(
            &self,
            id: DescriptorId,
            flags: crate::descriptor::FlagsUpdate,
        ) -> PluginResult<PluginDescriptor> {
            self.0.update_flags(id, flags).await
        }

        async fn create(&self, descriptor: PluginDescriptor) -> PluginResult<()> {
            Err(PluginError::DuplicateKey(descriptor.key))
        }

        async fn delete(&self, id: DescriptorId) -> PluginResult<bool> {
            self.0.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_lost_registration_race_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PluginPaths::new(dir.path());
        let installer = PackageInstaller::new(
            Arc::new(RacingStore(MemoryDescriptorStore::new())),
            paths.clone(),
        );

        let err = installer.install(&package("demo", "")).await.unwrap_err();
        assert!(matches!(err, PluginError::DuplicateKey(_)));
        let key = PluginKey::from_static("demo");
        assert!(!paths.plugin_dir(&key).exists());
        assert!(!paths.archive_path(&key, "1.0.0").exists());
    }
}
