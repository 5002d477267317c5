//! The trait a plugin implements.

use async_trait::async_trait;
use tessera_plugin_protocol::{HealthResult, InitParams, PluginBasicInfo};

use crate::error::CallError;

/// A static resource served by a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Raw bytes.
    pub bytes: Vec<u8>,
    /// MIME type.
    pub content_type: String,
}

impl Resource {
    /// Create a resource.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }
}

/// The `plugin_store` capability, implemented by the plugin author.
///
/// Calls may arrive concurrently; implementations synchronize their own
/// state.
#[async_trait]
pub trait StorePlugin: Send + Sync + 'static {
    /// Identity reported by `Info`.
    fn info(&self) -> PluginBasicInfo;

    /// Version reported by `Version`.
    fn version(&self) -> String;

    /// Called once by the host before any other business call.
    async fn init(&self, params: InitParams) -> Result<(), CallError>;

    /// Called before the host kills the process.
    async fn destroy(&self) -> Result<(), CallError> {
        Ok(())
    }

    /// Liveness as seen by the plugin itself.
    async fn health(&self) -> HealthResult {
        HealthResult::healthy()
    }

    /// Serve a static resource. The default has none.
    async fn get_static_resource(&self, path: &str) -> Result<Resource, CallError> {
        Err(CallError::not_found(path))
    }
}
