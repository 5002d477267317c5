//! Handshake line format and environment conventions.
//!
//! The host launches the plugin with two extra environment variables:
//!
//! - `<cookie_key>=<cookie_value>`: the magic cookie. A plugin binary that
//!   does not find the cookie it expects must refuse to start.
//! - [`PROTOCOL_VERSION_ENV`]: the application protocol version the host
//!   wants to speak.
//!
//! The plugin answers with one line on stdout:
//!
//! ```text
//! CORE|APP|stdio|jsonl
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, ProtocolResult};

/// Version of the handshake and framing layer itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Application protocol version used when a manifest does not declare one.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;

/// Cookie variable name used when a manifest does not declare one.
pub const DEFAULT_COOKIE_KEY: &str = "TESSERA_PLUGIN";

/// Environment variable carrying the application protocol version.
pub const PROTOCOL_VERSION_ENV: &str = "TESSERA_PLUGIN_PROTOCOL_VERSION";

/// The only transport currently spoken: the child's stdin/stdout.
pub const TRANSPORT_NETWORK: &str = "stdio";

/// The only frame encoding currently spoken: one JSON document per line.
pub const TRANSPORT_ENCODING: &str = "jsonl";

/// The line a plugin prints once it accepted the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    /// Core protocol version the plugin speaks.
    pub core_version: u32,
    /// Application protocol version the plugin speaks.
    pub app_version: u32,
    /// Transport network (`stdio`).
    pub network: String,
    /// Frame encoding (`jsonl`).
    pub encoding: String,
}

impl HandshakeLine {
    /// Build the line a plugin speaking `app_version` should print.
    #[must_use]
    pub fn new(app_version: u32) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version,
            network: TRANSPORT_NETWORK.to_string(),
            encoding: TRANSPORT_ENCODING.to_string(),
        }
    }

    /// Parse a handshake line as printed by a plugin.
    ///
    /// Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedHandshake`] if the line does not
    /// have exactly four `|`-separated fields or a version is not an
    /// unsigned integer.
    pub fn parse(line: &str) -> ProtocolResult<Self> {
        let trimmed = line.trim();
        let malformed = |reason: &str| ProtocolError::MalformedHandshake {
            line: trimmed.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = trimmed.split('|').collect();
        let [core, app, network, encoding] = parts.as_slice() else {
            return Err(malformed("expected 4 fields separated by '|'"));
        };

        let core_version = core
            .parse::<u32>()
            .map_err(|_| malformed("core protocol version is not an integer"))?;
        let app_version = app
            .parse::<u32>()
            .map_err(|_| malformed("app protocol version is not an integer"))?;

        Ok(Self {
            core_version,
            app_version,
            network: (*network).to_string(),
            encoding: (*encoding).to_string(),
        })
    }

    /// Whether the transport fields name something this crate can speak.
    #[must_use]
    pub fn transport_supported(&self) -> bool {
        self.network == TRANSPORT_NETWORK && self.encoding == TRANSPORT_ENCODING
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.encoding
        )
    }
}

impl FromStr for HandshakeLine {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
