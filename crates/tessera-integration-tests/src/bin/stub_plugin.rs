//! Plugin binary used by the integration tests.
//!
//! Behaviour is selected with `STUB_MODE`:
//!
//! - `ok` (default): handshake immediately and serve
//! - `slow`: wait 300 ms before the handshake
//! - `hang`: never handshake
//! - `fail-init`: reject `Init`
//! - `bad-protocol`: announce application protocol 99
//!
//! When `STUB_SPAWN_DIR` is set, an empty file named after the process id
//! is created there on startup so tests can count spawns.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]

use std::time::Duration;

use async_trait::async_trait;
use tessera_plugin_sdk::protocol::{InitParams, PluginBasicInfo};
use tessera_plugin_sdk::{CallError, Resource, ServeOptions, StorePlugin, serve_or_exit};

const COOKIE_VALUE: &str = "x";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Ok,
    Slow,
    Hang,
    FailInit,
    BadProtocol,
}

impl Mode {
    fn from_env() -> Self {
        match std::env::var("STUB_MODE").as_deref() {
            Ok("slow") => Self::Slow,
            Ok("hang") => Self::Hang,
            Ok("fail-init") => Self::FailInit,
            Ok("bad-protocol") => Self::BadProtocol,
            _ => Self::Ok,
        }
    }
}

struct Stub {
    mode: Mode,
}

#[async_trait]
impl StorePlugin for Stub {
    fn info(&self) -> PluginBasicInfo {
        PluginBasicInfo {
            name: "stub".into(),
            display_name: "Stub".into(),
            description: "integration test plugin".into(),
            author: "tessera".into(),
        }
    }

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").into()
    }

    async fn init(&self, params: InitParams) -> Result<(), CallError> {
        if self.mode == Mode::FailInit {
            return Err(CallError::internal(format!(
                "init refused for {}",
                params.plugin_name
            )));
        }
        Ok(())
    }

    async fn get_static_resource(&self, path: &str) -> Result<Resource, CallError> {
        match path {
            "hello.txt" => Ok(Resource::new(
                format!("hello from {}", std::process::id()),
                "text/plain",
            )),
            other => Err(CallError::not_found(other)),
        }
    }
}

fn record_spawn() {
    if let Some(dir) = std::env::var_os("STUB_SPAWN_DIR") {
        let path = std::path::Path::new(&dir).join(std::process::id().to_string());
        if let Err(e) = std::fs::write(&path, b"") {
            eprintln!("stub: failed to record spawn at {}: {e}", path.display());
        }
    }
}

#[tokio::main]
async fn main() -> tessera_plugin_sdk::SdkResult<()> {
    let mode = Mode::from_env();
    let mut options = ServeOptions::new(COOKIE_VALUE);
    let cookie = std::env::var(&options.cookie_key).ok();
    if let Err(e) = options.check_cookie(cookie.as_deref()) {
        eprintln!("{e}");
        std::process::exit(1);
    }
    record_spawn();

    match mode {
        Mode::Hang => loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        },
        Mode::Slow => tokio::time::sleep(Duration::from_millis(300)).await,
        Mode::BadProtocol => options = options.with_protocol_version(99),
        Mode::Ok | Mode::FailInit => {},
    }

    serve_or_exit(Stub { mode }, options).await
}
