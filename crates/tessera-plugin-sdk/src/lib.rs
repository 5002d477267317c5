//! Write Tessera plugins in Rust.
//!
//! Implement [`StorePlugin`] and hand it to [`serve`] from `main`. The SDK
//! checks the magic cookie, prints the handshake line and answers the
//! host's requests on stdin/stdout until the host hangs up.
//!
//! ```no_run
//! use async_trait::async_trait;
//! use tessera_plugin_sdk::protocol::{InitParams, PluginBasicInfo};
//! use tessera_plugin_sdk::{CallError, ServeOptions, StorePlugin};
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl StorePlugin for Hello {
//!     fn info(&self) -> PluginBasicInfo {
//!         PluginBasicInfo {
//!             name: "hello".into(),
//!             ..PluginBasicInfo::default()
//!         }
//!     }
//!
//!     fn version(&self) -> String {
//!         "0.1.0".into()
//!     }
//!
//!     async fn init(&self, _params: InitParams) -> Result<(), CallError> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> tessera_plugin_sdk::SdkResult<()> {
//!     tessera_plugin_sdk::serve_or_exit(Hello, ServeOptions::new("hello-cookie")).await
//! }
//! ```
//!
//! Logging goes through `tracing`; a plugin that installs a subscriber must
//! write to stderr, stdout belongs to the protocol.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod plugin;
mod serve;

pub use error::{CallError, SdkError, SdkResult};
pub use plugin::{Resource, StorePlugin};
pub use serve::{ServeOptions, serve, serve_on, serve_or_exit};

pub use tessera_plugin_protocol as protocol;
