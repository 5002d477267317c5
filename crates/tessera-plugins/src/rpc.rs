//! Multiplexed JSON-lines RPC client.
//!
//! One writer task drains an mpsc channel into the child's stdin. One reader
//! task parses responses from the child's stdout and completes the matching
//! pending call by `id`. When stdout closes, every pending call fails with
//! [`PluginError::ProcessExited`] and later calls fail immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tessera_plugin_protocol::{Request, Response};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{PluginError, PluginResult};

/// Calls methods on a connected plugin.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Invoke `method` and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Remote`] when the plugin answers with an
    /// error, and [`PluginError::ProcessExited`] when the connection is
    /// gone.
    async fn call(&self, method: &str, params: Value) -> PluginResult<Value>;

    /// Whether the connection has been closed by the peer.
    fn is_closed(&self) -> bool;
}

type PendingMap = HashMap<u64, oneshot::Sender<PluginResult<Value>>>;

/// RPC client over a line-oriented byte stream pair.
pub struct RpcClient {
    plugin: String,
    writer_tx: mpsc::Sender<String>,
    pending: Arc<Mutex<PendingMap>>,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("plugin", &self.plugin)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Start the reader and writer tasks.
    ///
    /// `lines` must be positioned after the handshake line.
    #[must_use]
    pub fn start<R, W>(plugin: impl Into<String>, lines: Lines<R>, writer: W) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let plugin = plugin.into();
        let (writer_tx, writer_rx) = mpsc::channel::<String>(64);
        let pending: Arc<Mutex<PendingMap>> = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));

        let writer_handle = tokio::spawn(writer_loop(plugin.clone(), writer, writer_rx));
        let reader_handle = tokio::spawn(reader_loop(
            plugin.clone(),
            lines,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            plugin,
            writer_tx,
            pending,
            closed,
            next_id: AtomicU64::new(1),
            reader_handle,
            writer_handle,
        }
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn exited(&self) -> PluginError {
        PluginError::ProcessExited(self.plugin.clone())
    }

    /// Calls still waiting for a response.
    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Removes a call's pending entry when the caller stops waiting, whether
/// it got an answer or was dropped mid-call.
struct PendingCall<'a> {
    client: &'a RpcClient,
    id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.client.forget(self.id);
    }
}

#[async_trait]
impl RpcTransport for RpcClient {
    async fn call(&self, method: &str, params: Value) -> PluginResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = Request::new(id, method, params).to_line()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            // Checked under the lock so the reader's final drain cannot miss us.
            if self.closed.load(Ordering::Acquire) {
                return Err(self.exited());
            }
            pending.insert(id, tx);
        }
        let _pending = PendingCall { client: self, id };

        trace!(plugin = %self.plugin, id, method, "Sending request");
        if self.writer_tx.send(line).await.is_err() {
            return Err(self.exited());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.exited()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

async fn writer_loop<W>(plugin: String, mut writer: W, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            debug!(plugin = %plugin, error = %e, "Plugin stdin closed");
            break;
        }
    }
}

async fn reader_loop<R>(
    plugin: String,
    mut lines: Lines<R>,
    pending: Arc<Mutex<PendingMap>>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(plugin = %plugin, "Plugin stdout reached EOF");
                break;
            },
            Err(e) => {
                warn!(plugin = %plugin, error = %e, "Failed to read from plugin stdout");
                break;
            },
        };

        if line.trim().is_empty() {
            continue;
        }

        let response = match Response::from_line(&line) {
            Ok(response) => response,
            Err(e) => {
                warn!(plugin = %plugin, error = %e, "Ignoring unparsable line from plugin");
                continue;
            },
        };

        let sender = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&response.id);
        let Some(sender) = sender else {
            warn!(plugin = %plugin, id = response.id, "Response for unknown request id");
            continue;
        };

        let result = response
            .into_result()
            .map_err(|e| PluginError::Remote {
                code: e.code,
                message: e.message,
            });
        // The caller may have given up (timeout); that is fine.
        let _ = sender.send(result);
    }

    let drained: Vec<_> = {
        let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
        closed.store(true, Ordering::Release);
        pending.drain().map(|(_, tx)| tx).collect()
    };
    for tx in drained {
        let _ = tx.send(Err(PluginError::ProcessExited(plugin.clone())));
    }
}
