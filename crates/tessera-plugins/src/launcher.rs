//! Spawn a plugin process, perform the handshake, dispense capabilities.
//!
//! The launcher is the one primitive shared by the loader and the
//! supervisor. Both only see the [`PluginLauncher`] and [`PluginConnection`]
//! traits, so tests can swap in scripted fakes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tessera_plugin_protocol::{
    CORE_PROTOCOL_VERSION, CapabilityKind, DISPENSE_METHOD, DispenseParams, DispenseResult,
    HandshakeLine, PROTOCOL_VERSION_ENV,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::capability::Capability;
use crate::descriptor::{HandshakeToken, PluginDescriptor};
use crate::error::{PluginError, PluginResult};
use crate::rpc::{RpcClient, RpcTransport};

/// Everything needed to start one plugin process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Plugin key, used for logging and errors.
    pub plugin: String,
    /// Executable to run.
    pub binary: PathBuf,
    /// Handshake parameters.
    pub handshake: HandshakeToken,
    /// Working directory. Defaults to the binary's directory.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Spec for `descriptor`, running `binary`.
    #[must_use]
    pub fn for_descriptor(descriptor: &PluginDescriptor, binary: impl Into<PathBuf>) -> Self {
        Self {
            plugin: descriptor.key.to_string(),
            binary: binary.into(),
            handshake: descriptor.handshake.clone(),
            working_dir: None,
            env: Vec::new(),
        }
    }
}

/// A connected plugin process.
#[async_trait]
pub trait PluginConnection: Send + Sync {
    /// Ask the plugin for a capability and wrap it in its typed handle.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Dispense`] if the plugin does not provide it.
    async fn dispense(&self, kind: CapabilityKind) -> PluginResult<Capability>;

    /// Whether the process is known to have exited. Never blocks.
    fn has_exited(&self) -> bool;

    /// Kill the process and reap it. Safe to call repeatedly and on a
    /// process that already died.
    async fn kill(&self);

    /// OS process id, if still known.
    fn pid(&self) -> Option<u32>;
}

/// Starts plugin processes.
#[async_trait]
pub trait PluginLauncher: Send + Sync {
    /// Spawn the process and complete the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Spawn`] or [`PluginError::Handshake`]. The
    /// process is gone when an error is returned.
    async fn launch(&self, spec: LaunchSpec) -> PluginResult<Arc<dyn PluginConnection>>;
}

/// Launches real OS processes speaking JSON lines over stdio.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Create a launcher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&spec.binary);
        let working_dir = spec
            .working_dir
            .clone()
            .or_else(|| spec.binary.parent().map(Path::to_path_buf));
        if let Some(dir) = working_dir.filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        cmd.env(&spec.handshake.cookie_key, &spec.handshake.cookie_value)
            .env(PROTOCOL_VERSION_ENV, spec.handshake.protocol_version.to_string())
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl PluginLauncher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> PluginResult<Arc<dyn PluginConnection>> {
        let mut child = Self::command(&spec).spawn().map_err(|e| PluginError::Spawn {
            plugin: spec.plugin.clone(),
            message: format!("{}: {e}", spec.binary.display()),
        })?;
        let pid = child.id();
        debug!(plugin = %spec.plugin, pid, binary = %spec.binary.display(), "Spawned plugin process");

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            reap(&spec.plugin, &mut child).await;
            return Err(PluginError::Spawn {
                plugin: spec.plugin,
                message: "child stdio was not captured".into(),
            });
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(spec.plugin.clone(), stderr));
        }

        let mut lines = BufReader::new(stdout).lines();
        let negotiated = match lines.next_line().await {
            Ok(Some(line)) => check_handshake(&line, &spec.handshake),
            Ok(None) => Err("plugin exited before completing the handshake".to_string()),
            Err(e) => Err(format!("failed to read handshake: {e}")),
        };
        if let Err(message) = negotiated {
            reap(&spec.plugin, &mut child).await;
            return Err(PluginError::Handshake {
                plugin: spec.plugin,
                message,
            });
        }

        info!(plugin = %spec.plugin, pid, "Plugin handshake complete");
        let client = Arc::new(RpcClient::start(spec.plugin.clone(), lines, stdin));
        Ok(Arc::new(PluginProcess {
            plugin: spec.plugin,
            pid,
            child: Mutex::new(Some(child)),
            client,
        }))
    }
}

/// Verify the plugin's handshake line against what the host expects.
fn check_handshake(line: &str, expected: &HandshakeToken) -> Result<(), String> {
    let parsed = HandshakeLine::parse(line).map_err(|e| e.to_string())?;
    if parsed.core_version != CORE_PROTOCOL_VERSION {
        return Err(format!(
            "incompatible core protocol version {} (host speaks {CORE_PROTOCOL_VERSION})",
            parsed.core_version
        ));
    }
    if parsed.app_version != expected.protocol_version {
        return Err(format!(
            "incompatible protocol version {} (expected {})",
            parsed.app_version, expected.protocol_version
        ));
    }
    if !parsed.transport_supported() {
        return Err(format!(
            "unsupported transport {}/{}",
            parsed.network, parsed.encoding
        ));
    }
    Ok(())
}

async fn forward_stderr(plugin: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(plugin = %plugin, "{line}");
    }
}

async fn reap(plugin: &str, child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(plugin = %plugin, error = %e, "Kill after failed launch");
    }
}

/// A live child process with its RPC channel.
pub struct PluginProcess {
    plugin: String,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    client: Arc<RpcClient>,
}

impl std::fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcess")
            .field("plugin", &self.plugin)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PluginConnection for PluginProcess {
    async fn dispense(&self, kind: CapabilityKind) -> PluginResult<Capability> {
        let dispense_error = |message: String| PluginError::Dispense {
            plugin: self.plugin.clone(),
            capability: kind.to_string(),
            message,
        };

        let params = serde_json::to_value(DispenseParams {
            name: kind.as_str().to_string(),
        })
        .map_err(|e| PluginError::Rpc(e.to_string()))?;
        let value = self
            .client
            .call(DISPENSE_METHOD, params)
            .await
            .map_err(|e| match e {
                PluginError::ProcessExited(_) => e,
                other => dispense_error(other.to_string()),
            })?;
        let result: DispenseResult = serde_json::from_value(value)
            .map_err(|e| dispense_error(format!("malformed dispense result: {e}")))?;
        if result.name != kind.as_str() {
            return Err(dispense_error(format!(
                "plugin dispensed '{}' instead",
                result.name
            )));
        }

        let transport: Arc<dyn RpcTransport> = self.client.clone();
        Ok(Capability::new(kind, self.plugin.clone(), transport))
    }

    fn has_exited(&self) -> bool {
        if self.client.is_closed() {
            return true;
        }
        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            None => true,
            Some(child) => !matches!(child.try_wait(), Ok(None)),
        }
    }

    async fn kill(&self) {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut child) = child else {
            return;
        };
        match child.kill().await {
            Ok(()) => debug!(plugin = %self.plugin, pid = self.pid, "Plugin process killed"),
            Err(e) => warn!(plugin = %self.plugin, pid = self.pid, error = %e, "Failed to kill plugin process"),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(version: u32) -> HandshakeToken {
        HandshakeToken {
            protocol_version: version,
            cookie_key: "TESSERA_PLUGIN".into(),
            cookie_value: "x".into(),
        }
    }

    #[test]
    fn test_check_handshake_accepts_matching_line() {
        assert!(check_handshake("1|1|stdio|jsonl", &token(1)).is_ok());
    }

    #[test]
    fn test_check_handshake_rejects_app_version() {
        let err = check_handshake("1|99|stdio|jsonl", &token(1)).unwrap_err();
        assert!(err.contains("incompatible protocol version 99"));
    }

    #[test]
    fn test_check_handshake_rejects_core_version() {
        let err = check_handshake("2|1|stdio|jsonl", &token(1)).unwrap_err();
        assert!(err.contains("core protocol version"));
    }

    #[test]
    fn test_check_handshake_rejects_transport() {
        let err = check_handshake("1|1|tcp|grpc", &token(1)).unwrap_err();
        assert!(err.contains("unsupported transport"));
    }

    #[test]
    fn test_check_handshake_rejects_garbage() {
        assert!(check_handshake("hello world", &token(1)).is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let spec = LaunchSpec {
            plugin: "ghost".into(),
            binary: PathBuf::from("/nonexistent/tessera/ghost"),
            handshake: token(1),
            working_dir: Some(std::env::temp_dir()),
            env: Vec::new(),
        };
        let err = ProcessLauncher::new().launch(spec).await.err().unwrap();
        assert!(matches!(err, PluginError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_eof() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("quits");
        std::fs::write(&script, "#!/bin/sh\necho refusing >&2\nexit 1\n").unwrap();
        crate::archive::mark_executable(&script).unwrap();

        let spec = LaunchSpec {
            plugin: "quits".into(),
            binary: script,
            handshake: token(1),
            working_dir: None,
            env: Vec::new(),
        };
        let err = ProcessLauncher::new().launch(spec).await.err().unwrap();
        assert!(matches!(err, PluginError::Handshake { ref message, .. } if message.contains("exited before")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_line_from_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("talker");
        // Prints the line, then echoes every request back as a dispense result.
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             [ \"$TESSERA_PLUGIN\" = \"x\" ] || exit 1\n\
             echo \"1|$TESSERA_PLUGIN_PROTOCOL_VERSION|stdio|jsonl\"\n\
             read line\n\
             echo '{\"id\":1,\"result\":{\"name\":\"basic\",\"methods\":[\"Ping\",\"Close\"]}}'\n\
             read line\n",
        )
        .unwrap();
        crate::archive::mark_executable(&script).unwrap();

        let spec = LaunchSpec {
            plugin: "talker".into(),
            binary: script,
            handshake: token(3),
            working_dir: None,
            env: Vec::new(),
        };
        let conn = ProcessLauncher::new().launch(spec).await.unwrap();
        assert!(!conn.has_exited());
        assert!(conn.pid().is_some());

        let cap = conn.dispense(CapabilityKind::Basic).await.unwrap();
        assert_eq!(cap.kind(), CapabilityKind::Basic);

        conn.kill().await;
        assert!(conn.has_exited());
        conn.kill().await;
    }
}
