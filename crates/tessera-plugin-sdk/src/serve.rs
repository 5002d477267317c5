//! Guest side of the handshake and the request loop.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use tessera_plugin_protocol::capability::{basic, store};
use tessera_plugin_protocol::{
    CapabilityKind, DEFAULT_COOKIE_KEY, DEFAULT_PROTOCOL_VERSION, DISPENSE_METHOD, DispenseParams,
    DispenseResult, HandshakeLine, InitParams, Request, Response, StaticResource,
    StaticResourceParams, VersionResult, error_codes, split_method,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{CallError, SdkError, SdkResult};
use crate::plugin::StorePlugin;

/// Handshake parameters the plugin expects from its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeOptions {
    /// Name of the cookie variable.
    pub cookie_key: String,
    /// Value the cookie must hold.
    pub cookie_value: String,
    /// Application protocol version printed in the handshake.
    pub protocol_version: u32,
}

impl ServeOptions {
    /// Options with the default cookie key and protocol version.
    #[must_use]
    pub fn new(cookie_value: impl Into<String>) -> Self {
        Self {
            cookie_key: DEFAULT_COOKIE_KEY.to_string(),
            cookie_value: cookie_value.into(),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
        }
    }

    /// Override the cookie variable name.
    #[must_use]
    pub fn with_cookie_key(mut self, key: impl Into<String>) -> Self {
        self.cookie_key = key.into();
        self
    }

    /// Override the application protocol version.
    #[must_use]
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Compare the cookie against `found`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::CookieMismatch`] when it is missing or differs.
    pub fn check_cookie(&self, found: Option<&str>) -> SdkResult<()> {
        if found == Some(self.cookie_value.as_str()) {
            Ok(())
        } else {
            Err(SdkError::CookieMismatch {
                key: self.cookie_key.clone(),
            })
        }
    }
}

/// Run `plugin` on stdin/stdout until the host closes stdin or sends
/// `basic.Close`.
///
/// # Errors
///
/// Returns [`SdkError::CookieMismatch`] before printing anything if the
/// process was not started by a host with the expected cookie, and I/O
/// errors from the pipes.
pub async fn serve<P: StorePlugin>(plugin: P, options: ServeOptions) -> SdkResult<()> {
    let cookie = std::env::var(&options.cookie_key).ok();
    options.check_cookie(cookie.as_deref())?;
    serve_on(
        Arc::new(plugin),
        &options,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await
}

/// [`serve`], exiting the process with status 1 on a cookie mismatch.
///
/// # Errors
///
/// Returns I/O errors from the pipes.
pub async fn serve_or_exit<P: StorePlugin>(plugin: P, options: ServeOptions) -> SdkResult<()> {
    match serve(plugin, options).await {
        Err(e @ SdkError::CookieMismatch { .. }) => {
            eprintln!("{e}");
            std::process::exit(1);
        },
        other => other,
    }
}

/// Run the handshake and request loop over arbitrary streams. The cookie is
/// not checked here.
///
/// # Errors
///
/// Returns I/O errors from `reader` or `writer`.
pub async fn serve_on<P, R, W>(
    plugin: Arc<P>,
    options: &ServeOptions,
    reader: R,
    mut writer: W,
) -> SdkResult<()>
where
    P: StorePlugin,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let handshake = format!("{}\n", HandshakeLine::new(options.protocol_version));
    writer.write_all(handshake.as_bytes()).await?;
    writer.flush().await?;

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request = match Request::from_line(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed request");
                continue;
            },
        };

        let closing = request.method == close_method();
        let plugin = Arc::clone(&plugin);
        let tx = tx.clone();
        let task = tokio::spawn(async move {
            let response = dispatch(plugin.as_ref(), request).await;
            match response.to_line() {
                Ok(line) => {
                    let _ = tx.send(line).await;
                },
                Err(e) => warn!(error = %e, "Failed to encode response"),
            }
        });
        if closing {
            let _ = task.await;
            debug!("Close requested");
            break;
        }
    }

    drop(tx);
    match writer_task.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "Writer task failed"),
    }
    Ok(())
}

fn close_method() -> String {
    tessera_plugin_protocol::qualified_method(CapabilityKind::Basic.as_str(), basic::CLOSE)
}

async fn dispatch<P: StorePlugin + ?Sized>(plugin: &P, request: Request) -> Response {
    let id = request.id;
    match handle(plugin, &request.method, request.params).await {
        Ok(value) => Response::ok(id, value),
        Err(e) => Response::err(id, e.code, e.message),
    }
}

async fn handle<P: StorePlugin + ?Sized>(
    plugin: &P,
    method: &str,
    params: Value,
) -> Result<Value, CallError> {
    if method == DISPENSE_METHOD {
        let params: DispenseParams = decode(params)?;
        let kind = params.name.parse::<CapabilityKind>().map_err(|e| {
            CallError::new(error_codes::UNKNOWN_CAPABILITY, e.to_string())
        })?;
        return encode(&DispenseResult {
            name: kind.as_str().to_string(),
            methods: kind.methods().iter().map(ToString::to_string).collect(),
        });
    }

    let not_found = || CallError::new(error_codes::METHOD_NOT_FOUND, format!("unknown method {method}"));
    let (capability, name) = split_method(method).ok_or_else(not_found)?;
    let kind = capability.parse::<CapabilityKind>().map_err(|_| not_found())?;

    match (kind, name) {
        (CapabilityKind::PluginStore, store::INFO) => encode(&plugin.info()),
        (CapabilityKind::PluginStore, store::VERSION) => encode(&VersionResult {
            version: plugin.version(),
        }),
        (CapabilityKind::PluginStore, store::INIT) => {
            let params: InitParams = decode(params)?;
            plugin.init(params).await?;
            Ok(Value::Null)
        },
        (CapabilityKind::PluginStore, store::DESTROY) => {
            plugin.destroy().await?;
            Ok(Value::Null)
        },
        (CapabilityKind::PluginStore, store::HEALTH) => encode(&plugin.health().await),
        (CapabilityKind::PluginStore, store::GET_STATIC_RESOURCE) => {
            let params: StaticResourceParams = decode(params)?;
            let resource = plugin.get_static_resource(&params.path).await?;
            encode(&StaticResource {
                data: BASE64.encode(&resource.bytes),
                content_type: resource.content_type,
            })
        },
        (CapabilityKind::Basic, basic::PING) => Ok(Value::String("pong".to_string())),
        (CapabilityKind::Basic, basic::CLOSE) => Ok(Value::Null),
        _ => Err(not_found()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, CallError> {
    serde_json::from_value(params)
        .map_err(|e| CallError::new(error_codes::INVALID_PARAMS, e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, CallError> {
    serde_json::to_value(value).map_err(|e| CallError::internal(e.to_string()))
}
