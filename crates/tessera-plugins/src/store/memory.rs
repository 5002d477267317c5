//! In-memory descriptor store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DescriptorStore, sort_by_creation};
use crate::descriptor::{
    DescriptorFilter, DescriptorId, FlagsUpdate, PluginDescriptor, PluginKey, StatusUpdate,
};
use crate::error::{PluginError, PluginResult};

/// Descriptor store backed by a `HashMap`. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryDescriptorStore {
    descriptors: RwLock<HashMap<DescriptorId, PluginDescriptor>>,
}

impl MemoryDescriptorStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DescriptorStore for MemoryDescriptorStore {
    async fn get_by_id(&self, id: DescriptorId) -> PluginResult<Option<PluginDescriptor>> {
        Ok(self.descriptors.read().await.get(&id).cloned())
    }

    async fn get_by_key(&self, key: &PluginKey) -> PluginResult<Option<PluginDescriptor>> {
        Ok(self
            .descriptors
            .read()
            .await
            .values()
            .find(|d| d.key == *key)
            .cloned())
    }

    async fn list(&self, filter: &DescriptorFilter) -> PluginResult<Vec<PluginDescriptor>> {
        let mut found: Vec<PluginDescriptor> = self
            .descriptors
            .read()
            .await
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        sort_by_creation(&mut found);
        Ok(found)
    }

    async fn update_status(
        &self,
        id: DescriptorId,
        update: StatusUpdate,
    ) -> PluginResult<PluginDescriptor> {
        let mut descriptors = self.descriptors.write().await;
        let descriptor = descriptors
            .get_mut(&id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        descriptor.apply_status(&update);
        Ok(descriptor.clone())
    }

    async fn update_flags(
        &self,
        id: DescriptorId,
        flags: FlagsUpdate,
    ) -> PluginResult<PluginDescriptor> {
        let mut descriptors = self.descriptors.write().await;
        let descriptor = descriptors
            .get_mut(&id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        descriptor.apply_flags(&flags);
        Ok(descriptor.clone())
    }

    async fn create(&self, descriptor: PluginDescriptor) -> PluginResult<()> {
        let mut descriptors = self.descriptors.write().await;
        if descriptors.values().any(|d| d.key == descriptor.key) {
            return Err(PluginError::DuplicateKey(descriptor.key));
        }
        descriptors.insert(descriptor.id, descriptor);
        Ok(())
    }

    async fn delete(&self, id: DescriptorId) -> PluginResult<bool> {
        Ok(self.descriptors.write().await.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PluginStatus;
    use crate::descriptor::fixtures::descriptor;

    #[tokio::test]
    async fn test_create_and_lookup() {
        let store = MemoryDescriptorStore::new();
        let d = descriptor("demo", "Demo", "1.0.0");
        let id = d.id;
        store.create(d).await.unwrap();

        assert_eq!(store.get_by_id(id).await.unwrap().unwrap().name, "Demo");
        assert!(
            store
                .get_by_key(&PluginKey::from_static("demo"))
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            store
                .get_by_key(&PluginKey::from_static("other"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let store = MemoryDescriptorStore::new();
        store.create(descriptor("demo", "Demo", "1.0.0")).await.unwrap();
        let err = store
            .create(descriptor("demo", "Demo", "2.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::DuplicateKey(k) if k.as_str() == "demo"));
    }

    #[tokio::test]
    async fn test_find_by_name_version_only_enabled() {
        let store = MemoryDescriptorStore::new();
        let mut disabled = descriptor("demo-a", "Demo", "1.0.0");
        disabled.enabled = false;
        store.create(disabled).await.unwrap();
        store.create(descriptor("demo-b", "Demo", "1.0.0")).await.unwrap();
        store.create(descriptor("demo-c", "Demo", "2.0.0")).await.unwrap();

        let found = store.find_by_name_version("Demo", "v1.0.0").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key.as_str(), "demo-b");
    }

    #[tokio::test]
    async fn test_list_auto_start() {
        let store = MemoryDescriptorStore::new();
        let mut auto = descriptor("auto", "Auto", "1.0.0");
        auto.auto_start = true;
        let mut auto_disabled = descriptor("auto-off", "Auto", "1.0.0");
        auto_disabled.auto_start = true;
        auto_disabled.enabled = false;
        store.create(auto).await.unwrap();
        store.create(auto_disabled).await.unwrap();
        store.create(descriptor("manual", "Manual", "1.0.0")).await.unwrap();

        let found = store.list_auto_start().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key.as_str(), "auto");
    }

    #[tokio::test]
    async fn test_update_status_unknown_id() {
        let store = MemoryDescriptorStore::new();
        let err = store
            .update_status(DescriptorId::new(), StatusUpdate::running())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = MemoryDescriptorStore::new();
        let d = descriptor("demo", "Demo", "1.0.0");
        let id = d.id;
        store.create(d).await.unwrap();

        let updated = store
            .update_status(id, StatusUpdate::failed("exit 1"))
            .await
            .unwrap();
        assert_eq!(updated.status, PluginStatus::Error);

        let flagged = store
            .update_flags(
                id,
                FlagsUpdate {
                    enabled: Some(false),
                    auto_start: None,
                },
            )
            .await
            .unwrap();
        assert!(!flagged.enabled);

        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
    }
}
