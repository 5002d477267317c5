//! Typed capability handles.
//!
//! A plugin dispenses a capability by name; the host wraps it in a variant
//! of [`Capability`] and callers cast to the concrete handle they need with
//! [`Capability::into_store`] or [`Capability::into_basic`].

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tessera_plugin_protocol::capability::{basic, store};
use tessera_plugin_protocol::{
    CapabilityKind, HealthResult, InitParams, PluginBasicInfo, StaticResource,
    StaticResourceParams, VersionResult, qualified_method,
};

use crate::error::{PluginError, PluginResult};
use crate::rpc::RpcTransport;

/// A dispensed capability.
#[derive(Clone)]
pub enum Capability {
    /// `plugin_store`.
    Store(StoreCapability),
    /// `basic`.
    Basic(BasicCapability),
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("kind", &self.kind())
            .field("plugin", &self.plugin())
            .finish()
    }
}

impl Capability {
    /// Wrap `transport` in the handle for `kind`.
    #[must_use]
    pub fn new(
        kind: CapabilityKind,
        plugin: impl Into<String>,
        transport: Arc<dyn RpcTransport>,
    ) -> Self {
        let channel = Channel {
            plugin: plugin.into(),
            transport,
        };
        match kind {
            CapabilityKind::PluginStore => Self::Store(StoreCapability { channel }),
            CapabilityKind::Basic => Self::Basic(BasicCapability { channel }),
        }
    }

    /// Which capability this is.
    #[must_use]
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Store(_) => CapabilityKind::PluginStore,
            Self::Basic(_) => CapabilityKind::Basic,
        }
    }

    /// Key of the plugin that dispensed it.
    #[must_use]
    pub fn plugin(&self) -> &str {
        match self {
            Self::Store(c) => &c.channel.plugin,
            Self::Basic(c) => &c.channel.plugin,
        }
    }

    /// Cast to the store handle.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CapabilityMismatch`] for any other variant.
    pub fn into_store(self) -> PluginResult<StoreCapability> {
        match self {
            Self::Store(c) => Ok(c),
            other => Err(mismatch(CapabilityKind::PluginStore, other.kind())),
        }
    }

    /// Cast to the basic handle.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CapabilityMismatch`] for any other variant.
    pub fn into_basic(self) -> PluginResult<BasicCapability> {
        match self {
            Self::Basic(c) => Ok(c),
            other => Err(mismatch(CapabilityKind::Basic, other.kind())),
        }
    }

    /// Liveness probe through whichever capability this is: `Health` for
    /// the store, `Ping` for basic.
    ///
    /// # Errors
    ///
    /// Propagates the underlying call error.
    pub async fn probe(&self) -> PluginResult<HealthResult> {
        match self {
            Self::Store(c) => c.health().await,
            Self::Basic(c) => c.ping().await.map(|()| HealthResult::healthy()),
        }
    }
}

fn mismatch(expected: CapabilityKind, actual: CapabilityKind) -> PluginError {
    PluginError::CapabilityMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

#[derive(Clone)]
struct Channel {
    plugin: String,
    transport: Arc<dyn RpcTransport>,
}

impl Channel {
    async fn invoke<P, T>(&self, kind: CapabilityKind, method: &str, params: &P) -> PluginResult<T>
    where
        P: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(|e| PluginError::Rpc(e.to_string()))?;
        let value = self
            .transport
            .call(&qualified_method(kind.as_str(), method), params)
            .await?;
        serde_json::from_value(value).map_err(|e| {
            PluginError::Rpc(format!(
                "malformed result of {method} from plugin {}: {e}",
                self.plugin
            ))
        })
    }
}

/// Decoded result of `GetStaticResource`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticResourceData {
    /// Raw bytes.
    pub bytes: Vec<u8>,
    /// MIME type reported by the plugin.
    pub content_type: String,
}

/// Handle to a plugin's `plugin_store` capability.
#[derive(Clone)]
pub struct StoreCapability {
    channel: Channel,
}

impl std::fmt::Debug for StoreCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCapability")
            .field("plugin", &self.channel.plugin)
            .finish_non_exhaustive()
    }
}

impl StoreCapability {
    const KIND: CapabilityKind = CapabilityKind::PluginStore;

    /// Key of the plugin behind this handle.
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.channel.plugin
    }

    /// Plugin identity.
    ///
    /// # Errors
    ///
    /// Propagates RPC failures.
    pub async fn info(&self) -> PluginResult<PluginBasicInfo> {
        self.channel.invoke(Self::KIND, store::INFO, &Value::Null).await
    }

    /// Version string reported by the plugin.
    ///
    /// # Errors
    ///
    /// Propagates RPC failures.
    pub async fn version(&self) -> PluginResult<String> {
        let result: VersionResult = self
            .channel
            .invoke(Self::KIND, store::VERSION, &Value::Null)
            .await?;
        Ok(result.version)
    }

    /// Initialize the plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InitFailed`] if the plugin rejects the call,
    /// and other RPC failures unchanged.
    pub async fn init(&self, params: &InitParams) -> PluginResult<()> {
        let _: Value = self
            .channel
            .invoke(Self::KIND, store::INIT, params)
            .await
            .map_err(|e| match e {
                PluginError::Remote { message, .. } => PluginError::InitFailed {
                    plugin: self.channel.plugin.clone(),
                    message,
                },
                other => other,
            })?;
        Ok(())
    }

    /// Ask the plugin to release its resources.
    ///
    /// # Errors
    ///
    /// Propagates RPC failures.
    pub async fn destroy(&self) -> PluginResult<()> {
        let _: Value = self
            .channel
            .invoke(Self::KIND, store::DESTROY, &Value::Null)
            .await?;
        Ok(())
    }

    /// Health as reported by the plugin.
    ///
    /// # Errors
    ///
    /// Propagates RPC failures.
    pub async fn health(&self) -> PluginResult<HealthResult> {
        self.channel
            .invoke(Self::KIND, store::HEALTH, &Value::Null)
            .await
    }

    /// Fetch a static resource by path.
    ///
    /// # Errors
    ///
    /// Propagates RPC failures; [`PluginError::Rpc`] if the payload is not
    /// valid base64.
    pub async fn get_static_resource(&self, path: &str) -> PluginResult<StaticResourceData> {
        let params = StaticResourceParams {
            path: path.to_string(),
        };
        let resource: StaticResource = self
            .channel
            .invoke(Self::KIND, store::GET_STATIC_RESOURCE, &params)
            .await?;
        let bytes = BASE64
            .decode(resource.data.as_bytes())
            .map_err(|e| PluginError::Rpc(format!("invalid base64 in static resource {path}: {e}")))?;
        Ok(StaticResourceData {
            bytes,
            content_type: resource.content_type,
        })
    }
}

/// Handle to a plugin's `basic` capability.
#[derive(Clone)]
pub struct BasicCapability {
    channel: Channel,
}

impl std::fmt::Debug for BasicCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCapability")
            .field("plugin", &self.channel.plugin)
            .finish_non_exhaustive()
    }
}

impl BasicCapability {
    const KIND: CapabilityKind = CapabilityKind::Basic;

    /// Key of the plugin behind this handle.
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.channel.plugin
    }

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Propagates RPC failures.
    pub async fn ping(&self) -> PluginResult<()> {
        let _: Value = self
            .channel
            .invoke(Self::KIND, basic::PING, &Value::Null)
            .await?;
        Ok(())
    }

    /// Ask the plugin to shut down gracefully.
    ///
    /// # Errors
    ///
    /// Propagates RPC failures.
    pub async fn close(&self) -> PluginResult<()> {
        let _: Value = self
            .channel
            .invoke(Self::KIND, basic::CLOSE, &Value::Null)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use serde_json::json;

    fn store(transport: Arc<ScriptedTransport>) -> StoreCapability {
        Capability::new(CapabilityKind::PluginStore, "demo", transport)
            .into_store()
            .unwrap()
    }

    #[test]
    fn test_casts() {
        let transport: Arc<dyn RpcTransport> = Arc::new(ScriptedTransport::new());
        let basic = Capability::new(CapabilityKind::Basic, "demo", Arc::clone(&transport));
        assert_eq!(basic.kind(), CapabilityKind::Basic);
        let err = basic.clone().into_store().unwrap_err();
        assert!(matches!(
            err,
            PluginError::CapabilityMismatch { ref expected, ref actual }
                if expected == "plugin_store" && actual == "basic"
        ));
        assert!(basic.into_basic().is_ok());

        let store = Capability::new(CapabilityKind::PluginStore, "demo", transport);
        assert!(store.into_basic().is_err());
    }

    #[tokio::test]
    async fn test_methods_are_qualified() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("plugin_store.Info", json!({"name": "demo", "author": "me"}));
        transport.respond("plugin_store.Version", json!({"version": "1.0.0"}));

        let cap = store(Arc::clone(&transport));
        assert_eq!(cap.info().await.unwrap().author, "me");
        assert_eq!(cap.version().await.unwrap(), "1.0.0");
        assert_eq!(
            transport.calls(),
            vec!["plugin_store.Info".to_string(), "plugin_store.Version".to_string()]
        );
    }

    #[tokio::test]
    async fn test_static_resource_decodes_base64() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            "plugin_store.GetStaticResource",
            json!({"data": BASE64.encode(b"<svg/>"), "content_type": "image/svg+xml"}),
        );
        let data = store(transport).get_static_resource("logo.svg").await.unwrap();
        assert_eq!(data.bytes, b"<svg/>");
        assert_eq!(data.content_type, "image/svg+xml");
    }

    #[tokio::test]
    async fn test_invalid_base64() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            "plugin_store.GetStaticResource",
            json!({"data": "%%%", "content_type": "text/plain"}),
        );
        let err = store(transport).get_static_resource("x").await.unwrap_err();
        assert!(matches!(err, PluginError::Rpc(_)));
    }

    #[tokio::test]
    async fn test_init_rejection_maps_to_init_failed() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail("plugin_store.Init", -32603, "bad config");
        let err = store(transport)
            .init(&InitParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::InitFailed { ref message, .. } if message == "bad config"));
    }

    #[tokio::test]
    async fn test_probe_uses_ping_for_basic() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("basic.Ping", json!("pong"));
        let cap = Capability::new(CapabilityKind::Basic, "demo", transport.clone());
        assert!(cap.probe().await.unwrap().healthy);
        assert_eq!(transport.calls(), vec!["basic.Ping".to_string()]);
    }
}
