//! Out-of-process plugin host for Tessera.
//!
//! Plugins ship as zip packages containing a `plugin-config.yaml` manifest
//! and exactly one executable. The host runs each plugin as a child process
//! and talks to it over JSON lines on stdio after a cookie-and-version
//! handshake (see `tessera-plugin-protocol`).
//!
//! - [`PackageInstaller`]: validates a package and registers a
//!   [`PluginDescriptor`] in `stopped` state
//! - [`PluginSupervisor`]: start / stop / restart / autostart by descriptor
//!   id, reporting status through the [`DescriptorStore`]
//! - [`PluginLoader`]: resolves `(name, version)` to a live
//!   [`StoreCapability`], starting the plugin on demand
//! - [`HeartbeatRegistry`]: external plugins that register themselves
//! - [`PluginManager`]: wires the above to one store and directory tree
//!
//! # Layout on disk
//!
//! ```text
//! <root>/plugins/<key>/...              installed package (supervisor)
//! <root>/plugins/.archives/<key>-<v>.zip copy of the uploaded archive
//! <root>/versions/<key>/<version>/...   per-version extraction (loader)
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod archive;
pub mod capability;
pub mod descriptor;
pub mod error;
pub mod heartbeat;
pub mod installer;
mod keyed;
pub mod launcher;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod paths;
pub mod rpc;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use capability::{BasicCapability, Capability, StaticResourceData, StoreCapability};
pub use descriptor::{
    DescriptorFilter, DescriptorId, FlagsUpdate, HandshakeToken, PluginDescriptor, PluginKey,
    PluginStatus, StatusUpdate,
};
pub use error::{PluginError, PluginResult};
pub use heartbeat::{HeartbeatRegistry, PluginRegistration, RegisteredPlugin};
pub use installer::{InstallDefaults, PackageInstaller};
pub use launcher::{LaunchSpec, PluginConnection, PluginLauncher, ProcessLauncher};
pub use loader::PluginLoader;
pub use manager::{HostOptions, PluginManager};
pub use manifest::{MANIFEST_FILE_NAME, PluginManifest};
pub use paths::PluginPaths;
pub use rpc::{RpcClient, RpcTransport};
pub use store::{DescriptorStore, FileDescriptorStore, MemoryDescriptorStore};
pub use supervisor::{PluginSupervisor, SupervisorConfig};
