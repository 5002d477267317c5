//! Capability names, method names and their payloads.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// The capability sets a plugin can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Full plugin contract: identity, lifecycle and static resources.
    PluginStore,
    /// Liveness only.
    Basic,
}

impl CapabilityKind {
    /// Wire name used in `dispense` and as method prefix.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PluginStore => "plugin_store",
            Self::Basic => "basic",
        }
    }

    /// Methods a plugin must answer for this capability.
    #[must_use]
    pub fn methods(self) -> &'static [&'static str] {
        match self {
            Self::PluginStore => &[
                store::INFO,
                store::VERSION,
                store::INIT,
                store::DESTROY,
                store::HEALTH,
                store::GET_STATIC_RESOURCE,
            ],
            Self::Basic => &[basic::PING, basic::CLOSE],
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plugin_store" => Ok(Self::PluginStore),
            "basic" => Ok(Self::Basic),
            other => Err(ProtocolError::UnknownCapability(other.to_string())),
        }
    }
}

/// Method names of the `plugin_store` capability.
pub mod store {
    /// Returns [`PluginBasicInfo`](super::PluginBasicInfo).
    pub const INFO: &str = "Info";
    /// Returns [`VersionResult`](super::VersionResult).
    pub const VERSION: &str = "Version";
    /// Takes [`InitParams`](super::InitParams).
    pub const INIT: &str = "Init";
    /// Releases plugin resources before shutdown.
    pub const DESTROY: &str = "Destroy";
    /// Returns [`HealthResult`](super::HealthResult).
    pub const HEALTH: &str = "Health";
    /// Takes [`StaticResourceParams`](super::StaticResourceParams),
    /// returns [`StaticResource`](super::StaticResource).
    pub const GET_STATIC_RESOURCE: &str = "GetStaticResource";
}

/// Method names of the `basic` capability.
pub mod basic {
    /// Liveness probe. Returns `"pong"`.
    pub const PING: &str = "Ping";
    /// Ask the plugin to close gracefully.
    pub const CLOSE: &str = "Close";
}

/// Parameters of `dispense`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseParams {
    /// Capability name.
    pub name: String,
}

/// Result of `dispense`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseResult {
    /// Capability name, echoed.
    pub name: String,
    /// Methods the plugin serves under this capability.
    #[serde(default)]
    pub methods: Vec<String>,
}

/// Identity a plugin reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginBasicInfo {
    /// Machine name.
    pub name: String,
    /// Name shown to administrators.
    #[serde(default)]
    pub display_name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Author or vendor.
    #[serde(default)]
    pub author: String,
}

/// Result of `Version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResult {
    /// Version string reported by the plugin.
    pub version: String,
}

/// Parameters of `Init`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitParams {
    /// Plugin name from the descriptor.
    pub plugin_name: String,
    /// Version from the descriptor.
    pub version: String,
    /// Opaque configuration string from the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// Extra host-provided values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Result of `Health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResult {
    /// Whether the plugin considers itself healthy.
    pub healthy: bool,
    /// Optional detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthResult {
    /// A healthy result with no message.
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
        }
    }
}

/// Parameters of `GetStaticResource`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticResourceParams {
    /// Resource path relative to the plugin's static root.
    pub path: String,
}

/// Result of `GetStaticResource`. `data` is base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticResource {
    /// Base64 (standard alphabet) encoded bytes.
    pub data: String,
    /// MIME type.
    pub content_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_names_round_trip() {
        for kind in [CapabilityKind::PluginStore, CapabilityKind::Basic] {
            assert_eq!(kind.as_str().parse::<CapabilityKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_capability_rejected() {
        let err = "kv".parse::<CapabilityKind>().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCapability(name) if name == "kv"));
    }

    #[test]
    fn test_store_methods_listed() {
        let methods = CapabilityKind::PluginStore.methods();
        assert!(methods.contains(&store::GET_STATIC_RESOURCE));
        assert_eq!(CapabilityKind::Basic.methods(), &[basic::PING, basic::CLOSE]);
    }

    #[test]
    fn test_init_params_skip_empty_optional_fields() {
        let params = InitParams {
            plugin_name: "demo".into(),
            version: "1.0.0".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"plugin_name": "demo", "version": "1.0.0"})
        );
    }

    #[test]
    fn test_basic_info_tolerates_missing_fields() {
        let info: PluginBasicInfo = serde_json::from_str(r#"{"name":"demo"}"#).unwrap();
        assert_eq!(info.name, "demo");
        assert!(info.author.is_empty());
    }
}
