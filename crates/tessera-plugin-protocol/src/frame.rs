//! JSON-RPC style frames exchanged after the handshake.
//!
//! Each frame is one JSON object on its own line. Requests carry a
//! host-assigned `id`; the plugin echoes it on the matching response so
//! several calls can be in flight over one pipe.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolResult;

/// Method used to obtain a named capability from the plugin.
pub const DISPENSE_METHOD: &str = "dispense";

/// Numeric error codes carried in [`RpcErrorBody::code`].
pub mod error_codes {
    /// The frame could not be parsed.
    pub const PARSE_ERROR: i64 = -32700;
    /// The method does not exist on this plugin.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Parameters did not match the method signature.
    pub const INVALID_PARAMS: i64 = -32602;
    /// The plugin hit an internal error while serving the call.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The requested capability is not provided by this plugin.
    pub const UNKNOWN_CAPABILITY: i64 = -32001;
    /// A static resource does not exist.
    pub const RESOURCE_NOT_FOUND: i64 = -32004;
}

/// A call from host to plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique per connection.
    pub id: u64,
    /// Method name, e.g. `plugin_store.Info`.
    pub method: String,
    /// Method parameters. `null` when the method takes none.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Build a request.
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Encode as a single JSON line (without the trailing newline).
    ///
    /// # Errors
    ///
    /// Returns an error if the params cannot be serialized.
    pub fn to_line(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one line.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not a valid request object.
    pub fn from_line(line: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Error payload of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// One of [`error_codes`], or a plugin-defined code.
    pub code: i64,
    /// Human readable description.
    pub message: String,
}

impl RpcErrorBody {
    /// Build an error body.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A reply from plugin to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers.
    pub id: u64,
    /// Successful result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl Response {
    /// Successful response.
    #[must_use]
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn err(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcErrorBody::new(code, message)),
        }
    }

    /// Collapse into a `Result`. A response with neither field set is
    /// treated as a `null` result.
    ///
    /// # Errors
    ///
    /// Returns the error body when the call failed.
    pub fn into_result(self) -> Result<Value, RpcErrorBody> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    /// Encode as a single JSON line (without the trailing newline).
    ///
    /// # Errors
    ///
    /// Returns an error if the result cannot be serialized.
    pub fn to_line(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one line.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not a valid response object.
    pub fn from_line(line: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Join a capability name and a method into the wire method name.
#[must_use]
pub fn qualified_method(capability: &str, method: &str) -> String {
    format!("{capability}.{method}")
}

/// Split a wire method name into `(capability, method)`.
///
/// Returns `None` for unqualified names such as [`DISPENSE_METHOD`].
#[must_use]
pub fn split_method(method: &str) -> Option<(&str, &str)> {
    method.split_once('.')
}
