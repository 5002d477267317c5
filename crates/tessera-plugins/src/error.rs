//! Plugin host error types.

use std::path::PathBuf;

use crate::descriptor::{DescriptorId, PluginKey};

/// Errors from installing, loading and supervising plugins.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    // Validation
    /// The uploaded archive is not a well-formed plugin package.
    #[error("malformed plugin package: {0}")]
    MalformedPackage(String),

    /// The package manifest could not be parsed.
    #[error("manifest parse error: {message}")]
    ManifestParse {
        /// Parser message.
        message: String,
    },

    /// A plugin key failed validation.
    #[error("invalid plugin key: {0}")]
    InvalidKey(String),

    /// A descriptor with this key is already registered.
    #[error("plugin key already registered: {0}")]
    DuplicateKey(PluginKey),

    /// A declared dependency is not registered.
    #[error("plugin {plugin} depends on unknown plugin {dependency}")]
    UnresolvedDependency {
        /// The plugin declaring the dependency.
        plugin: PluginKey,
        /// The missing dependency key.
        dependency: PluginKey,
    },

    /// A version string is not valid semver.
    #[error("invalid version '{version}': {message}")]
    InvalidVersion {
        /// The rejected version string.
        version: String,
        /// Parser message.
        message: String,
    },

    // Preconditions
    /// The plugin is disabled.
    #[error("plugin is disabled: {0}")]
    Disabled(PluginKey),

    /// The plugin binary does not exist on disk.
    #[error("plugin binary missing for {plugin}: {}", path.display())]
    BinaryMissing {
        /// The plugin whose binary is missing.
        plugin: PluginKey,
        /// Where the binary was expected.
        path: PathBuf,
    },

    /// A declared dependency exists but is not running.
    #[error("dependency not running: {plugin} requires {dependency}")]
    DependencyNotRunning {
        /// The plugin being started.
        plugin: PluginKey,
        /// The dependency that is not running.
        dependency: PluginKey,
    },

    /// The plugin already has a live process.
    #[error("plugin already running: {0}")]
    AlreadyRunning(PluginKey),

    /// A start of the plugin is still in flight.
    #[error("plugin is already starting: {0}")]
    StartInProgress(DescriptorId),

    /// The plugin has no live process.
    #[error("plugin not running: {0}")]
    NotRunning(DescriptorId),

    /// No matching descriptor exists.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// More than one enabled descriptor matches a `(name, version)` pair.
    #[error("ambiguous plugin {name}@{version}: {count} enabled descriptors match")]
    AmbiguousPlugin {
        /// Requested name.
        name: String,
        /// Requested version.
        version: String,
        /// Number of matches.
        count: usize,
    },

    /// The supervisor is shutting down and accepts no new starts.
    #[error("plugin host is shutting down")]
    ShuttingDown,

    // Runtime
    /// The plugin process could not be spawned.
    #[error("failed to spawn plugin {plugin}: {message}")]
    Spawn {
        /// Plugin key.
        plugin: String,
        /// Failure reason.
        message: String,
    },

    /// The handshake with the plugin process failed.
    #[error("handshake with plugin {plugin} failed: {message}")]
    Handshake {
        /// Plugin key.
        plugin: String,
        /// Failure reason.
        message: String,
    },

    /// The plugin refused or failed to dispense a capability.
    #[error("failed to dispense '{capability}' from plugin {plugin}: {message}")]
    Dispense {
        /// Plugin key.
        plugin: String,
        /// Requested capability name.
        capability: String,
        /// Failure reason.
        message: String,
    },

    /// A capability was cast to the wrong concrete type.
    #[error("capability mismatch: expected {expected}, got {actual}")]
    CapabilityMismatch {
        /// Expected capability name.
        expected: String,
        /// Actual capability name.
        actual: String,
    },

    /// A call could not be encoded, sent or decoded.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// The plugin answered a call with an error.
    #[error("plugin returned error {code}: {message}")]
    Remote {
        /// Error code from the plugin.
        code: i64,
        /// Error message from the plugin.
        message: String,
    },

    /// The plugin process exited while a call was outstanding, or before it.
    #[error("plugin process exited: {0}")]
    ProcessExited(String),

    /// An operation did not complete in time.
    #[error("timed out after {seconds:.1}s: {operation}")]
    Timeout {
        /// What timed out.
        operation: String,
        /// Configured limit in seconds.
        seconds: f64,
    },

    /// The plugin rejected its `Init` call.
    #[error("plugin {plugin} failed to initialize: {message}")]
    InitFailed {
        /// Plugin key.
        plugin: String,
        /// Failure reason.
        message: String,
    },

    // I/O
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive extraction failure.
    #[error("extraction error: {message}")]
    Extraction {
        /// Description of the extraction failure.
        message: String,
    },

    /// Path traversal detected in an archive entry.
    #[error("path traversal detected: {path}")]
    PathTraversal {
        /// The offending path.
        path: String,
    },

    /// Unsafe entry type in archive (symlink or special file).
    #[error("unsafe archive entry '{path}': {reason}")]
    UnsafeEntry {
        /// The path of the entry.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Archive exceeds a size limit.
    #[error("package too large: {size} bytes (limit: {limit} bytes)")]
    PackageTooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        limit: u64,
    },

    /// The descriptor store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<zip::result::ZipError> for PluginError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Extraction {
            message: e.to_string(),
        }
    }
}

impl From<tessera_plugin_protocol::ProtocolError> for PluginError {
    fn from(e: tessera_plugin_protocol::ProtocolError) -> Self {
        Self::Rpc(e.to_string())
    }
}

impl PluginError {
    /// Whether this error means the plugin process is gone.
    #[must_use]
    pub fn is_process_exit(&self) -> bool {
        matches!(self, Self::ProcessExited(_))
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;
