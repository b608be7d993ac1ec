use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use super::{RequestContext, Transport, TransportKind};
use crate::mcp::config::expand_env_map;
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};

/// How long `close` waits for the child to exit on its own before killing it.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

#[derive(Debug)]
struct Session {
    tx: mpsc::UnboundedSender<String>,
    child: Child,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// Line-delimited JSON-RPC over a child process's standard streams.
///
/// A writer task drains an unbounded queue into stdin; a reader task routes
/// responses from stdout to the waiting request by id. The process can be
/// respawned with `connect` after `close`.
#[derive(Debug)]
pub struct StdioTransport {
    server_name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    session: Mutex<Option<Session>>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
}

/// Removes the pending entry when the request future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl StdioTransport {
    pub fn new(
        server_name: String,
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            server_name,
            command,
            args,
            env,
            session: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(true)),
        }
    }

    fn sender(&self) -> McpResult<mpsc::UnboundedSender<String>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.tx.clone())
            .ok_or(McpError::Closed)
    }

    fn write_line(&self, message: &JsonRpcRequest) -> McpResult<()> {
        let line = serde_json::to_string(message).map_err(McpError::protocol)?;
        self.sender()?
            .send(line)
            .map_err(|e| McpError::Connection(format!("stdio writer task ended: {e}")))
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn spawn_reader(&self, stdout: tokio::process::ChildStdout) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        let closed = Arc::clone(&self.closed);
        let server = self.server_name.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "Failed reading MCP server stdout");
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let parsed: JsonRpcResponse = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "Skipping malformed line from MCP server");
                        continue;
                    }
                };

                match parsed.id_u64() {
                    Some(id) => {
                        let waiter = pending
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(parsed);
                            }
                            None => {
                                tracing::debug!(server = %server, id, "Response for unknown or abandoned request");
                            }
                        }
                    }
                    None => {
                        tracing::debug!(server = %server, "Ignoring server-initiated message");
                    }
                }
            }

            // Dropping the senders wakes every waiter with a receive error.
            closed.store(true, Ordering::SeqCst);
            pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            tracing::info!(server = %server, "MCP server stdout closed");
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self) -> McpResult<()> {
        if self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
            && !self.closed.load(Ordering::SeqCst)
        {
            return Ok(());
        }
        // A session whose child already exited is replaced.
        if let Err(e) = self.close().await {
            tracing::debug!(server = %self.server_name, error = %e, "Discarding stale session");
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(expand_env_map(&self.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            McpError::Connection(format!("failed to spawn '{}': {e}", self.command))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Connection("missing stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Connection("missing stdout".into()))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let server = self.server_name.clone();

        // Each JSON-RPC message is a single line; stdin closes when the queue ends.
        let writer = tokio::spawn(async move {
            let mut w = stdin;
            while let Some(line) = rx.recv().await {
                let line = line.replace('\n', "");
                let written = async {
                    w.write_all(line.as_bytes()).await?;
                    w.write_all(b"\n").await?;
                    w.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::warn!(server = %server, error = %e, "Failed writing to MCP server stdin");
                    break;
                }
            }
        });

        let reader = self.spawn_reader(stdout);

        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(Session {
            tx,
            child,
            writer,
            reader,
        });
        self.closed.store(false, Ordering::SeqCst);

        tracing::info!(
            server = %self.server_name,
            command = %self.command,
            "Spawned MCP server process"
        );
        Ok(())
    }

    async fn send(&self, message: JsonRpcRequest) -> McpResult<()> {
        self.write_line(&message)
    }

    async fn request(
        &self,
        message: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> McpResult<JsonRpcResponse> {
        let id = message
            .id
            .ok_or_else(|| McpError::Protocol("request without id".into()))?;

        let line = serde_json::to_string(&message).map_err(McpError::protocol)?;
        let writer = self.sender()?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // The reader flags `closed` before clearing the pending map, so an
        // entry inserted after that sweep is caught here.
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Connection(format!(
                "server '{}' is no longer running",
                self.server_name
            )));
        }

        writer
            .send(line)
            .map_err(|e| McpError::Connection(format!("stdio writer task ended: {e}")))?;
        drop(writer);

        match tokio::time::timeout(ctx.timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(McpError::Connection(format!(
                "server '{}' exited before responding",
                self.server_name
            ))),
            Err(_) => Err(McpError::Timeout(ctx.timeout)),
        }
    }

    async fn close(&self) -> McpResult<()> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Session {
            tx,
            mut child,
            writer,
            reader,
        }) = session
        else {
            return Ok(());
        };

        self.closed.store(true, Ordering::SeqCst);
        drop(tx);

        let exited = tokio::time::timeout(CLOSE_GRACE, async {
            let _ = writer.await;
            child.wait().await
        })
        .await;

        let result = match exited {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_name, %status, "MCP server exited");
                Ok(())
            }
            Ok(Err(e)) => Err(McpError::Connection(format!("failed waiting for child: {e}"))),
            Err(_) => {
                tracing::warn!(
                    server = %self.server_name,
                    grace_ms = CLOSE_GRACE.as_millis() as u64,
                    "MCP server did not exit after stdin closed, killing"
                );
                child
                    .kill()
                    .await
                    .map_err(|e| McpError::Connection(format!("failed to kill child: {e}")))
            }
        };

        reader.abort();
        let _ = reader.await;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        result
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
