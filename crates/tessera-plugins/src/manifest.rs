//! Package manifest (`plugin-config.yaml`).
//!
//! ```yaml
//! key: demo
//! name: Demo
//! version: 1.0.0
//! description: Example plugin
//! protocol_version: "1"
//! magic_cookie_key: TESSERA_PLUGIN
//! magic_cookie_value: x
//! capability: plugin_store
//! config: '{"greeting": "hi"}'
//! dependencies: [base]
//! auto_start: false
//! ```

use serde::{Deserialize, Deserializer};
use tessera_plugin_protocol::{CapabilityKind, DEFAULT_PROTOCOL_VERSION};

use crate::descriptor::PluginKey;
use crate::error::{PluginError, PluginResult};

/// File name of the manifest at the package root.
pub const MANIFEST_FILE_NAME: &str = "plugin-config.yaml";

/// Parsed package manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin key.
    #[serde(default)]
    pub key: String,
    /// Human name.
    #[serde(default)]
    pub name: String,
    /// Human version.
    #[serde(default, deserialize_with = "scalar_string")]
    pub version: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Application protocol version. Unparsable values read as unset.
    #[serde(
        default,
        alias = "protocolVersion",
        deserialize_with = "lenient_protocol_version"
    )]
    pub protocol_version: Option<u32>,
    /// Cookie variable name.
    #[serde(default, alias = "magicCookieKey")]
    pub magic_cookie_key: Option<String>,
    /// Cookie value the plugin expects.
    #[serde(default, alias = "magicCookieValue", deserialize_with = "scalar_string")]
    pub magic_cookie_value: String,
    /// Capability to dispense after the handshake.
    #[serde(default)]
    pub capability: Option<String>,
    /// Opaque configuration passed to `Init`.
    #[serde(default)]
    pub config: Option<String>,
    /// Keys that must be running first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Start at host boot.
    #[serde(default, alias = "autoStart")]
    pub auto_start: bool,
}

impl PluginManifest {
    /// Parse manifest YAML.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestParse`] if the document is not valid
    /// YAML or a field has the wrong type.
    pub fn parse(bytes: &[u8]) -> PluginResult<Self> {
        serde_yaml::from_slice(bytes).map_err(|e| PluginError::ManifestParse {
            message: e.to_string(),
        })
    }

    /// Check that every required field is present.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MalformedPackage`] naming the first missing
    /// field, or an unknown capability.
    pub fn validate(&self) -> PluginResult<()> {
        let required = [
            ("key", &self.key),
            ("name", &self.name),
            ("version", &self.version),
            ("magic_cookie_value", &self.magic_cookie_value),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(PluginError::MalformedPackage(format!(
                    "manifest field '{field}' is required"
                )));
            }
        }
        self.capability_kind()?;
        Ok(())
    }

    /// The validated plugin key.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidKey`] if the key is malformed.
    pub fn plugin_key(&self) -> PluginResult<PluginKey> {
        PluginKey::new(self.key.trim())
    }

    /// Validated dependency keys, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidKey`] for the first malformed key.
    pub fn dependency_keys(&self) -> PluginResult<Vec<PluginKey>> {
        self.dependencies
            .iter()
            .map(|d| PluginKey::new(d.trim()))
            .collect()
    }

    /// Capability named by the manifest, `plugin_store` when unset.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MalformedPackage`] for an unknown name.
    pub fn capability_kind(&self) -> PluginResult<CapabilityKind> {
        match self.capability.as_deref().map(str::trim) {
            None | Some("") => Ok(CapabilityKind::PluginStore),
            Some(name) => name
                .parse()
                .map_err(|e| PluginError::MalformedPackage(format!("manifest {e}"))),
        }
    }

    /// Protocol version, falling back to the default.
    #[must_use]
    pub fn protocol_version_or_default(&self) -> u32 {
        self.protocol_version.unwrap_or(DEFAULT_PROTOCOL_VERSION)
    }

    /// Cookie key, falling back to `default_key`.
    #[must_use]
    pub fn cookie_key_or(&self, default_key: &str) -> String {
        self.magic_cookie_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .unwrap_or(default_key)
            .to_string()
    }
}

/// Accept a number or a string; anything that does not parse as `u32`
/// becomes `None`.
fn lenient_protocol_version<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_yaml::Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(serde_yaml::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Accept any YAML scalar as a string, so `version: 1.0` and
/// `magic_cookie_value: 42` keep their text.
fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(String::new()),
        Some(serde_yaml::Value::String(s)) => Ok(s),
        Some(serde_yaml::Value::Number(n)) => Ok(n.to_string()),
        Some(serde_yaml::Value::Bool(b)) => Ok(b.to_string()),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a scalar, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
key: demo
name: Demo
version: 1.0.0
description: Example
protocol_version: "2"
magic_cookie_key: DEMO_COOKIE
magic_cookie_value: x
capability: basic
config: '{"greeting": "hi"}'
dependencies: [base, util]
auto_start: true
"#;

    #[test]
    fn test_parse_full_manifest() {
        let m = PluginManifest::parse(FULL.as_bytes()).unwrap();
        m.validate().unwrap();
        assert_eq!(m.plugin_key().unwrap().as_str(), "demo");
        assert_eq!(m.protocol_version_or_default(), 2);
        assert_eq!(m.cookie_key_or("TESSERA_PLUGIN"), "DEMO_COOKIE");
        assert_eq!(m.capability_kind().unwrap(), CapabilityKind::Basic);
        assert_eq!(m.config.as_deref(), Some(r#"{"greeting": "hi"}"#));
        assert_eq!(m.dependency_keys().unwrap().len(), 2);
        assert!(m.auto_start);
    }

    #[test]
    fn test_defaults() {
        let m = PluginManifest::parse(
            b"key: demo\nname: Demo\nversion: 1.0.0\nmagic_cookie_value: x\n",
        )
        .unwrap();
        m.validate().unwrap();
        assert_eq!(m.protocol_version_or_default(), 1);
        assert_eq!(m.cookie_key_or("TESSERA_PLUGIN"), "TESSERA_PLUGIN");
        assert_eq!(m.capability_kind().unwrap(), CapabilityKind::PluginStore);
        assert!(!m.auto_start);
        assert!(m.dependencies.is_empty());
    }

    #[test]
    fn test_camel_case_aliases() {
        let m = PluginManifest::parse(
            b"key: demo\nname: Demo\nversion: 1.0.0\nmagicCookieValue: x\nautoStart: true\n",
        )
        .unwrap();
        assert_eq!(m.magic_cookie_value, "x");
        assert!(m.auto_start);
    }

    #[test]
    fn test_unparsable_protocol_version_falls_back() {
        let m = PluginManifest::parse(
            b"key: demo\nname: Demo\nversion: 1.0.0\nmagic_cookie_value: x\nprotocol_version: abc\n",
        )
        .unwrap();
        assert_eq!(m.protocol_version, None);
        assert_eq!(m.protocol_version_or_default(), 1);
    }

    #[test]
    fn test_numeric_scalars_kept_as_text() {
        let m = PluginManifest::parse(
            b"key: demo\nname: Demo\nversion: 2\nmagic_cookie_value: 42\nprotocol_version: 3\n",
        )
        .unwrap();
        assert_eq!(m.version, "2");
        assert_eq!(m.magic_cookie_value, "42");
        assert_eq!(m.protocol_version, Some(3));
    }

    #[test]
    fn test_missing_required_field() {
        let m = PluginManifest::parse(b"key: demo\nname: Demo\nversion: 1.0.0\n").unwrap();
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("magic_cookie_value"));
    }

    #[test]
    fn test_unknown_capability() {
        let m = PluginManifest::parse(
            b"key: demo\nname: Demo\nversion: 1.0.0\nmagic_cookie_value: x\ncapability: kv\n",
        )
        .unwrap();
        assert!(matches!(m.validate(), Err(PluginError::MalformedPackage(_))));
    }

    #[test]
    fn test_invalid_yaml() {
        let err = PluginManifest::parse(b"key: [unterminated").unwrap_err();
        assert!(matches!(err, PluginError::ManifestParse { .. }));
    }

    #[test]
    fn test_invalid_dependency_key() {
        let m = PluginManifest {
            dependencies: vec!["../x".into()],
            ..Default::default()
        };
        assert!(matches!(m.dependency_keys(), Err(PluginError::InvalidKey(_))));
    }
}
