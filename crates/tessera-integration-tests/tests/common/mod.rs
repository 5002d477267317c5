//! Shared harness: a plugin host rooted in a tempdir and packages wrapping
//! the `stub-plugin` binary.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tessera_plugins::{
    DescriptorId, FileDescriptorStore, HostOptions, PluginDescriptor, PluginManager, PluginStatus,
};
use zip::write::SimpleFileOptions;

/// Upper bound for a start to settle in tests.
pub const SETTLE: Duration = Duration::from_secs(10);

/// A host over a file registry in a tempdir.
pub struct TestHost {
    /// The manager under test.
    pub manager: PluginManager,
    /// Where the stub records its pids.
    pub spawn_dir: PathBuf,
    /// Registry file location.
    #[allow(dead_code)]
    pub registry: PathBuf,
    _dir: TempDir,
}

#[allow(dead_code)]
impl TestHost {
    /// Host with short timeouts.
    pub fn new() -> Self {
        Self::with_handshake_timeout(Duration::from_secs(5))
    }

    /// Host whose spawn + handshake bound is `handshake_timeout`.
    pub fn with_handshake_timeout(handshake_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let root = dir.path().join("root");
        let spawn_dir = dir.path().join("spawns");
        std::fs::create_dir_all(&spawn_dir).expect("failed to create spawn dir");

        let registry = root.join("registry.toml");
        let store = Arc::new(FileDescriptorStore::new(&registry));
        let options = HostOptions {
            root_dir: root,
            handshake_timeout,
            restart_delay: Duration::from_millis(10),
            ..HostOptions::default()
        };
        Self {
            manager: PluginManager::with_process_launcher(store, options),
            spawn_dir,
            registry,
            _dir: dir,
        }
    }

    /// A package for `key` whose binary runs the stub in `mode`.
    pub fn package(&self, key: &str, version: &str, mode: &str, extra_manifest: &str) -> Vec<u8> {
        self.package_named(key, key, version, mode, extra_manifest)
    }

    /// [`Self::package`] with a plugin name different from the key.
    pub fn package_named(
        &self,
        key: &str,
        name: &str,
        version: &str,
        mode: &str,
        extra_manifest: &str,
    ) -> Vec<u8> {
        let manifest = format!(
            "key: {key}\nname: {name}\nversion: {version}\nmagicCookieValue: x\n{extra_manifest}"
        );
        let script = format!(
            "#!/bin/sh\nSTUB_MODE={mode} STUB_SPAWN_DIR='{}' exec '{}' \"$@\"\n",
            self.spawn_dir.display(),
            env!("CARGO_BIN_EXE_stub-plugin"),
        );
        zip_bytes(&[
            ("plugin-config.yaml", manifest.as_bytes()),
            ("stub", script.as_bytes()),
            ("README.md", b"test package"),
        ])
    }

    /// Process ids the stub recorded, in no particular order.
    pub fn spawned_pids(&self) -> Vec<u32> {
        std::fs::read_dir(&self.spawn_dir)
            .expect("failed to read spawn dir")
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect()
    }

    /// Number of stub processes started so far.
    pub fn spawn_count(&self) -> usize {
        self.spawned_pids().len()
    }
}

/// Poll until the descriptor reports `status`.
#[allow(dead_code)]
pub async fn wait_for_status(
    manager: &PluginManager,
    id: DescriptorId,
    status: PluginStatus,
) -> PluginDescriptor {
    let poll = async {
        loop {
            let descriptor = manager.get(id).await.expect("descriptor vanished");
            if descriptor.status == status {
                return descriptor;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(SETTLE, poll)
        .await
        .unwrap_or_else(|_| panic!("plugin {id} never reached {status}"))
}

/// SIGKILL `pid` without going through the host.
#[allow(dead_code)]
pub fn kill_out_of_band(pid: u32) {
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .expect("failed to run kill");
    assert!(status.success(), "kill -9 {pid} failed");
}

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().unix_permissions(0o644);
    for (name, contents) in entries {
        writer.start_file(*name, options).expect("failed to start entry");
        writer.write_all(contents).expect("failed to write entry");
    }
    writer.finish().expect("failed to finish zip").into_inner()
}
