//! Wire protocol shared by the Tessera plugin host and plugin processes.
//!
//! A plugin is an ordinary executable spawned by the host. Before any
//! capability method is invoked both sides agree on:
//!
//! - a core protocol version ([`CORE_PROTOCOL_VERSION`]),
//! - an application protocol version (per plugin, declared in its manifest),
//! - a magic cookie (`key=value` environment variable).
//!
//! The plugin proves it understood the handshake by printing a single
//! [`HandshakeLine`] on stdout. After that, stdin/stdout carry
//! newline-delimited JSON [`Request`]/[`Response`] frames.
//!
//! This crate performs no I/O. It only defines the types and the text
//! formats both sides parse.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod capability;
pub mod error;
pub mod frame;
pub mod handshake;

pub use capability::{
    CapabilityKind, DispenseParams, DispenseResult, HealthResult, InitParams, PluginBasicInfo,
    StaticResource, StaticResourceParams, VersionResult,
};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    DISPENSE_METHOD, Request, Response, RpcErrorBody, error_codes, qualified_method, split_method,
};
pub use handshake::{
    CORE_PROTOCOL_VERSION, DEFAULT_COOKIE_KEY, DEFAULT_PROTOCOL_VERSION, HandshakeLine,
    PROTOCOL_VERSION_ENV, TRANSPORT_ENCODING, TRANSPORT_NETWORK,
};
