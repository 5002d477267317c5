//! Persisted plugin metadata.
//!
//! A [`PluginDescriptor`] is created by the installer and owned by a
//! [`DescriptorStore`](crate::store::DescriptorStore). The supervisor only
//! touches the status fields through [`StatusUpdate`]; administrators only
//! touch the flags through [`FlagsUpdate`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_plugin_protocol::CapabilityKind;
use uuid::Uuid;

use crate::error::{PluginError, PluginResult};

/// Stable plugin identifier chosen by the package author.
///
/// Keys name a directory on disk, so they are restricted to lowercase
/// ASCII letters, digits, `-`, `_` and `.`, and must start and end with a
/// letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PluginKey(String);

/// Deserialize with validation so a hand-edited registry file cannot smuggle
/// a path into a key.
impl<'de> Deserialize<'de> for PluginKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl PluginKey {
    /// Create a new `PluginKey`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidKey`] if the key is empty or contains
    /// characters outside the allowed set.
    pub fn new(key: impl Into<String>) -> PluginResult<Self> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    /// Create a `PluginKey` without validation (for tests and internal use).
    #[must_use]
    pub fn from_static(key: &str) -> Self {
        Self(key.to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(key: &str) -> PluginResult<()> {
        if key.is_empty() {
            return Err(PluginError::InvalidKey("plugin key must not be empty".into()));
        }
        if !key.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')
        }) {
            return Err(PluginError::InvalidKey(format!(
                "plugin key must contain only lowercase alphanumeric characters, '-', '_' or '.', got: {key}"
            )));
        }
        let is_separator = |c: char| matches!(c, '-' | '_' | '.');
        if key.starts_with(is_separator) || key.ends_with(is_separator) {
            return Err(PluginError::InvalidKey(format!(
                "plugin key must start and end with a letter or digit, got: {key}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque, immutable descriptor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DescriptorId(Uuid);

impl DescriptorId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DescriptorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DescriptorId {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| PluginError::NotFound(format!("invalid descriptor id '{s}': {e}")))
    }
}

/// What the host and the plugin must agree on before any call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeToken {
    /// Application protocol version.
    pub protocol_version: u32,
    /// Name of the cookie environment variable.
    pub cookie_key: String,
    /// Expected cookie value.
    pub cookie_value: String,
}

/// Reported lifecycle state of a supervised plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// No process.
    #[default]
    Stopped,
    /// A start is in flight.
    Loading,
    /// Handshake and dispense succeeded; a live handle exists.
    Running,
    /// The last start failed or the process died.
    Error,
}

impl PluginStatus {
    /// Lowercase name as persisted.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Loading => "loading",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginStatus {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "loading" => Ok(Self::Loading),
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            other => Err(PluginError::Storage(format!("unknown plugin status: {other}"))),
        }
    }
}

/// Metadata for one installed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique id.
    pub id: DescriptorId,
    /// Unique key; names the install directory.
    pub key: PluginKey,
    /// Human name.
    pub name: String,
    /// Human version.
    pub version: String,
    /// Free-form description from the manifest.
    #[serde(default)]
    pub description: String,
    /// Absolute path of the executable in the install directory.
    pub binary_path: PathBuf,
    /// Executable path relative to the package root.
    pub binary_entry: PathBuf,
    /// Copy of the installed archive, used for versioned extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    /// Capability dispensed after the handshake.
    pub capability: CapabilityKind,
    /// Opaque configuration string passed to `Init`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// Keys that must be running before this plugin starts.
    #[serde(default)]
    pub dependencies: Vec<PluginKey>,
    /// Whether the plugin may be started.
    pub enabled: bool,
    /// Whether the plugin is started at host boot.
    pub auto_start: bool,
    /// Reported status.
    pub status: PluginStatus,
    /// Message of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the last start began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
    /// When the plugin last stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stopped_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Handshake parameters. Kept last so TOML emits it after plain values.
    pub handshake: HandshakeToken,
}

impl PluginDescriptor {
    /// Key of the loader's live-handle cache for this descriptor.
    #[must_use]
    pub fn loader_key(&self) -> String {
        loader_key(&self.name, &self.version)
    }

    /// Apply a status transition and bump `updated_at`.
    pub fn apply_status(&mut self, update: &StatusUpdate) {
        self.status = update.status;
        self.last_error.clone_from(&update.last_error);
        if let Some(at) = update.started_at {
            self.last_started_at = Some(at);
        }
        if let Some(at) = update.stopped_at {
            self.last_stopped_at = Some(at);
        }
        self.updated_at = Utc::now();
    }

    /// Apply a flags change and bump `updated_at`.
    pub fn apply_flags(&mut self, flags: &FlagsUpdate) {
        if let Some(enabled) = flags.enabled {
            self.enabled = enabled;
        }
        if let Some(auto_start) = flags.auto_start {
            self.auto_start = auto_start;
        }
        self.updated_at = Utc::now();
    }
}

/// Cache key used by the loader: `name_version`.
#[must_use]
pub fn loader_key(name: &str, version: &str) -> String {
    format!("{name}_{version}")
}

/// Parse a version string as semver, accepting a leading `v`.
///
/// # Errors
///
/// Returns [`PluginError::InvalidVersion`] when the string is not semver.
pub fn parse_version(version: &str) -> PluginResult<semver::Version> {
    let trimmed = version.trim();
    let stripped = trimmed.strip_prefix('v').unwrap_or(trimmed);
    semver::Version::parse(stripped).map_err(|e| PluginError::InvalidVersion {
        version: version.to_string(),
        message: e.to_string(),
    })
}

/// Whether a stored version string denotes `wanted`.
///
/// Compares as semver when the stored string parses, otherwise as text.
#[must_use]
pub fn version_matches(stored: &str, wanted: &str) -> bool {
    match (parse_version(stored), parse_version(wanted)) {
        (Ok(a), Ok(b)) => a == b,
        _ => stored == wanted,
    }
}

/// A status transition written by the supervisor.
///
/// `last_error` always replaces the stored value; timestamps are only
/// written when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// New status.
    pub status: PluginStatus,
    /// New `last_error`.
    pub last_error: Option<String>,
    /// New `last_started_at`.
    pub started_at: Option<DateTime<Utc>>,
    /// New `last_stopped_at`.
    pub stopped_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// A start has begun.
    #[must_use]
    pub fn loading() -> Self {
        Self {
            status: PluginStatus::Loading,
            last_error: None,
            started_at: Some(Utc::now()),
            stopped_at: None,
        }
    }

    /// Handshake and dispense succeeded.
    #[must_use]
    pub fn running() -> Self {
        Self {
            status: PluginStatus::Running,
            last_error: None,
            started_at: None,
            stopped_at: None,
        }
    }

    /// The plugin failed or died.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: PluginStatus::Error,
            last_error: Some(message.into()),
            started_at: None,
            stopped_at: None,
        }
    }

    /// The plugin was stopped.
    #[must_use]
    pub fn stopped() -> Self {
        Self {
            status: PluginStatus::Stopped,
            last_error: None,
            started_at: None,
            stopped_at: Some(Utc::now()),
        }
    }
}

/// An administrative flags change. `None` leaves a flag untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagsUpdate {
    /// New `enabled` flag.
    pub enabled: Option<bool>,
    /// New `auto_start` flag.
    pub auto_start: Option<bool>,
}

/// Criteria for [`DescriptorStore::list`](crate::store::DescriptorStore::list).
/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorFilter {
    /// Exact name.
    pub name: Option<String>,
    /// Version, compared with [`version_matches`].
    pub version: Option<String>,
    /// `enabled` flag.
    pub enabled: Option<bool>,
    /// `auto_start` flag.
    pub auto_start: Option<bool>,
    /// Reported status.
    pub status: Option<PluginStatus>,
}

impl DescriptorFilter {
    /// Match this name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Match this version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Match this `enabled` flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Match this `auto_start` flag.
    #[must_use]
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = Some(auto_start);
        self
    }

    /// Match this status.
    #[must_use]
    pub fn with_status(mut self, status: PluginStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether `descriptor` satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, descriptor: &PluginDescriptor) -> bool {
        self.name.as_ref().is_none_or(|n| *n == descriptor.name)
            && self
                .version
                .as_ref()
                .is_none_or(|v| version_matches(&descriptor.version, v))
            && self.enabled.is_none_or(|e| e == descriptor.enabled)
            && self.auto_start.is_none_or(|a| a == descriptor.auto_start)
            && self.status.is_none_or(|s| s == descriptor.status)
    }
}
