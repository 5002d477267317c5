#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Configuration for the Tessera plugin host.
//!
//! # Usage
//!
//! ```rust,no_run
//! let resolved = tessera_config::load(None, None).unwrap();
//! println!("plugins live in {}", resolved.plugin_root().display());
//! ```
//!
//! # Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Environment** (`TESSERA_*`)
//! 2. **Explicit file** (`--config <path>`)
//! 3. **User** (`~/.tessera/config.toml`)
//! 4. **System** (`/etc/tessera/config.toml`)
//! 5. **Embedded defaults** (`defaults.toml`)
//!
//! This crate has no dependencies on other tessera crates; the CLI converts
//! the sections into host and logging options.

/// Environment variable overrides.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ResolvedConfig, load, load_file};
pub use types::{Config, HeartbeatSection, LoggingSection, PluginsSection};
