//! Descriptor persistence contract.
//!
//! The host does not own a database. It consumes a [`DescriptorStore`] and
//! ships two implementations:
//!
//! - [`MemoryDescriptorStore`]: process-local, for tests and embedding.
//! - [`FileDescriptorStore`]: a TOML registry file guarded by an advisory
//!   lock and replaced atomically on every write.

mod file;
mod memory;

pub use file::{FileDescriptorStore, REGISTRY_FILE_NAME};
pub use memory::MemoryDescriptorStore;

use async_trait::async_trait;

use crate::descriptor::{
    DescriptorFilter, DescriptorId, FlagsUpdate, PluginDescriptor, PluginKey, StatusUpdate,
};
use crate::error::PluginResult;

/// Storage for [`PluginDescriptor`]s.
///
/// Implementations provide their own consistency; callers never hold a
/// descriptor reference across calls.
#[async_trait]
pub trait DescriptorStore: Send + Sync {
    /// Load a descriptor by id.
    async fn get_by_id(&self, id: DescriptorId) -> PluginResult<Option<PluginDescriptor>>;

    /// Load a descriptor by key.
    async fn get_by_key(&self, key: &PluginKey) -> PluginResult<Option<PluginDescriptor>>;

    /// All descriptors satisfying `filter`, ordered by creation time.
    async fn list(&self, filter: &DescriptorFilter) -> PluginResult<Vec<PluginDescriptor>>;

    /// Apply a status transition.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`](crate::PluginError::NotFound) if
    /// the descriptor does not exist.
    async fn update_status(
        &self,
        id: DescriptorId,
        update: StatusUpdate,
    ) -> PluginResult<PluginDescriptor>;

    /// Apply a flags change.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`](crate::PluginError::NotFound) if
    /// the descriptor does not exist.
    async fn update_flags(&self, id: DescriptorId, flags: FlagsUpdate)
    -> PluginResult<PluginDescriptor>;

    /// Insert a new descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::DuplicateKey`](crate::PluginError::DuplicateKey)
    /// if the key is taken.
    async fn create(&self, descriptor: PluginDescriptor) -> PluginResult<()>;

    /// Remove a descriptor. Returns `true` if it existed.
    async fn delete(&self, id: DescriptorId) -> PluginResult<bool>;

    /// Enabled descriptors with this name and version.
    async fn find_by_name_version(
        &self,
        name: &str,
        version: &str,
    ) -> PluginResult<Vec<PluginDescriptor>> {
        let filter = DescriptorFilter::default()
            .with_name(name)
            .with_version(version)
            .with_enabled(true);
        self.list(&filter).await
    }

    /// Enabled descriptors flagged for autostart.
    async fn list_auto_start(&self) -> PluginResult<Vec<PluginDescriptor>> {
        let filter = DescriptorFilter::default()
            .with_enabled(true)
            .with_auto_start(true);
        self.list(&filter).await
    }
}

/// Sort helper shared by the implementations.
pub(crate) fn sort_by_creation(descriptors: &mut [PluginDescriptor]) {
    descriptors.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.key.cmp(&b.key))
    });
}
