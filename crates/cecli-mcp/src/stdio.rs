//! Stdio transport: a child process speaking newline-delimited JSON-RPC.

use crate::error::{McpError, McpResult};
use crate::protocol::{
    reply_to_server_request, IncomingMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse,
};
use crate::server::ServerConfig;
use crate::transport::Transport;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Transport over a spawned MCP server's stdin/stdout.
pub struct StdioTransport {
    name: String,
    stdin: Arc<Mutex<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: Pending,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl StdioTransport {
    /// Spawn the server process.
    ///
    /// The child inherits the current environment overlaid with the
    /// config's `env`; its stderr is appended to `stderr_log`.
    pub async fn spawn(
        config: &ServerConfig,
        stderr_log: &Path,
        request_timeout: Duration,
    ) -> McpResult<Self> {
        let stderr = open_stderr_log(stderr_log).await;
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            McpError::connection_failed(format!(
                "Failed to spawn MCP server '{}' ({}): {e}",
                config.name, config.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::ProcessError("Unable to retrieve stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::ProcessError("Unable to retrieve stdout".to_string()))?;

        info!(server = %config.name, command = %config.command, pid = ?child.id(), "Spawned MCP server");

        let stdin = Arc::new(Mutex::new(stdin));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader = spawn_stdout_reader(
            config.name.clone(),
            stdout,
            stdin.clone(),
            pending.clone(),
            connected.clone(),
        );

        Ok(Self {
            name: config.name.clone(),
            stdin,
            child: Mutex::new(Some(child)),
            pending,
            reader: Mutex::new(Some(reader)),
            connected,
            request_timeout,
        })
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> McpResult<()> {
        write_line(&self.stdin, message).await
    }
}

/// Open the stderr log for appending, falling back to discarding stderr.
async fn open_stderr_log(path: &Path) -> Stdio {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(path = ?parent, error = %e, "Failed to create MCP log directory");
                return Stdio::null();
            }
        }
    }

    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(file) => Stdio::from(file.into_std().await),
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to open MCP stderr log");
            Stdio::null()
        }
    }
}

async fn write_line<T: Serialize>(stdin: &Mutex<ChildStdin>, message: &T) -> McpResult<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    let mut stdin = stdin.lock().await;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

fn spawn_stdout_reader(
    name: String,
    stdout: ChildStdout,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: Pending,
    connected: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(server = %name, error = %e, "Error reading MCP server stdout");
                    break;
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(e) => {
                    debug!(server = %name, error = %e, "Ignoring non-JSON line from MCP server");
                    continue;
                }
            };

            match IncomingMessage::classify(value) {
                Some(IncomingMessage::Response(response)) => {
                    if let Some(tx) = pending.lock().await.remove(&response.id) {
                        let _ = tx.send(response);
                    } else {
                        debug!(server = %name, id = response.id, "Response for unknown request");
                    }
                }
                Some(IncomingMessage::Request { id, method }) => {
                    trace!(server = %name, method = %method, "Server request");
                    let reply = reply_to_server_request(&id, &method);
                    if let Err(e) = write_line(&stdin, &reply).await {
                        debug!(server = %name, error = %e, "Failed to answer server request");
                    }
                }
                Some(IncomingMessage::Notification { method }) => {
                    trace!(server = %name, method = %method, "Server notification");
                }
                None => {
                    debug!(server = %name, "Ignoring unrecognized message from MCP server");
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        // Dropping the senders fails every in-flight request.
        pending.lock().await.clear();
        debug!(server = %name, "MCP server stdout closed");
    })
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let id = request
            .id
            .ok_or_else(|| McpError::protocol_error("Request without id"))?;

        if !self.is_connected() {
            return Err(McpError::connection_failed(format!(
                "MCP server '{}' is not running",
                self.name
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        debug!(server = %self.name, id, method = %request.method, "Sending stdio request");
        if let Err(e) = self.write_message(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::connection_failed(format!(
                "MCP server '{}' closed the connection",
                self.name
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout)
            }
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        debug!(server = %self.name, method = %notification.method, "Sending stdio notification");
        self.write_message(&notification).await
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(server = %self.name, error = %e, "MCP server already exited");
            }
        }

        self.pending.lock().await.clear();
        debug!(server = %self.name, "Closed stdio transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
