//! Scripted fakes for the launcher seam.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tessera_plugin_protocol::CapabilityKind;

use crate::capability::Capability;
use crate::error::{PluginError, PluginResult};
use crate::launcher::{LaunchSpec, PluginConnection, PluginLauncher};
use crate::rpc::RpcTransport;

#[derive(Debug, Clone)]
enum Reply {
    Ok(Value),
    Err(i64, String),
}

/// Transport answering from a method -> reply table. Unscripted methods
/// return `null`.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with_replies(replies: HashMap<String, Reply>) -> Self {
        Self {
            replies: Mutex::new(replies),
            ..Self::default()
        }
    }

    pub(crate) fn respond(&self, method: &str, value: Value) {
        self.replies
            .lock()
            .unwrap()
            .insert(method.to_string(), Reply::Ok(value));
    }

    pub(crate) fn fail(&self, method: &str, code: i64, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(method.to_string(), Reply::Err(code, message.to_string()));
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RpcTransport for ScriptedTransport {
    async fn call(&self, method: &str, _params: Value) -> PluginResult<Value> {
        self.calls.lock().unwrap().push(method.to_string());
        if self.closed.load(Ordering::SeqCst) {
            return Err(PluginError::ProcessExited("scripted".into()));
        }
        match self.replies.lock().unwrap().get(method).cloned() {
            Some(Reply::Ok(v)) => Ok(v),
            Some(Reply::Err(code, message)) => Err(PluginError::Remote { code, message }),
            None => Ok(Value::Null),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// How the next launches behave.
#[derive(Debug, Clone)]
pub(crate) enum LaunchBehaviour {
    Succeed,
    Fail(String),
    Hang,
    Delay(Duration),
}

/// Launcher producing [`MockConnection`]s.
#[derive(Debug)]
pub(crate) struct MockLauncher {
    behaviour: Mutex<LaunchBehaviour>,
    fail_dispense: AtomicBool,
    replies: Mutex<HashMap<String, Reply>>,
    specs: Mutex<Vec<LaunchSpec>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockLauncher {
    pub(crate) fn new() -> Self {
        let launcher = Self {
            behaviour: Mutex::new(LaunchBehaviour::Succeed),
            fail_dispense: AtomicBool::new(false),
            replies: Mutex::new(HashMap::new()),
            specs: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        };
        launcher.respond("plugin_store.Health", serde_json::json!({"healthy": true}));
        launcher
    }

    pub(crate) fn set_behaviour(&self, behaviour: LaunchBehaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub(crate) fn fail_dispense(&self, fail: bool) {
        self.fail_dispense.store(fail, Ordering::SeqCst);
    }

    /// Script a reply for connections launched from now on.
    pub(crate) fn respond(&self, method: &str, value: Value) {
        self.replies
            .lock()
            .unwrap()
            .insert(method.to_string(), Reply::Ok(value));
    }

    pub(crate) fn fail(&self, method: &str, code: i64, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(method.to_string(), Reply::Err(code, message.to_string()));
    }

    pub(crate) fn launch_count(&self) -> usize {
        self.specs.lock().unwrap().len()
    }

    pub(crate) fn specs(&self) -> Vec<LaunchSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub(crate) fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PluginLauncher for MockLauncher {
    async fn launch(&self, spec: LaunchSpec) -> PluginResult<Arc<dyn PluginConnection>> {
        self.specs.lock().unwrap().push(spec.clone());
        let behaviour = self.behaviour.lock().unwrap().clone();
        match behaviour {
            LaunchBehaviour::Succeed => {},
            LaunchBehaviour::Fail(message) => {
                return Err(PluginError::Handshake {
                    plugin: spec.plugin,
                    message,
                });
            },
            LaunchBehaviour::Hang => {
                std::future::pending::<()>().await;
            },
            LaunchBehaviour::Delay(d) => tokio::time::sleep(d).await,
        }

        let transport = ScriptedTransport::with_replies(self.replies.lock().unwrap().clone());
        let connection = Arc::new(MockConnection {
            plugin: spec.plugin,
            transport: Arc::new(transport),
            exited: AtomicBool::new(false),
            kills: AtomicUsize::new(0),
            fail_dispense: self.fail_dispense.load(Ordering::SeqCst),
        });
        self.connections.lock().unwrap().push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// A fake plugin process.
#[derive(Debug)]
pub(crate) struct MockConnection {
    plugin: String,
    transport: Arc<ScriptedTransport>,
    exited: AtomicBool,
    kills: AtomicUsize,
    fail_dispense: bool,
}

impl MockConnection {
    /// Simulate the process dying out-of-band.
    pub(crate) fn crash(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.transport.close();
    }

    pub(crate) fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub(crate) fn transport(&self) -> &ScriptedTransport {
        &self.transport
    }
}

#[async_trait]
impl PluginConnection for MockConnection {
    async fn dispense(&self, kind: CapabilityKind) -> PluginResult<Capability> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(PluginError::ProcessExited(self.plugin.clone()));
        }
        if self.fail_dispense {
            return Err(PluginError::Dispense {
                plugin: self.plugin.clone(),
                capability: kind.to_string(),
                message: "unknown capability".into(),
            });
        }
        let transport: Arc<dyn RpcTransport> = self.transport.clone();
        Ok(Capability::new(kind, self.plugin.clone(), transport))
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    async fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.crash();
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }
}
