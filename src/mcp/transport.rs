//! Transport sessions for tool servers.
//!
//! A transport wraps one bidirectional channel to a tool server: either the
//! stdio pipe pair of a spawned subprocess, or an HTTP request channel paired
//! with a server-to-client event stream. Both perform the same handshake and
//! expose the same list-tools/call-tool primitives.
//!
//! Transports never retry. Reconnect and retry policy lives in
//! [`ClientHandle`](super::handle::ClientHandle).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult, RequestId,
    ToolDescriptor,
};
use crate::config::TransportConfig;

/// How long a connect (spawn/stream open + handshake + tool discovery) may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-call timeout for tool invocations.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn server process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("tool call timed out after {0:?}")]
    CallTimeout(Duration),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json-rpc error: {0}")]
    Rpc(#[from] JsonRpcError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether the failure indicates a dead session that a reconnect can fix,
    /// as opposed to an application-level answer from a live server.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CallTimeout(_) | Self::ChannelClosed(_) | Self::Io(_) | Self::Http(_)
        )
    }
}

/// One bidirectional session with a tool server.
#[async_trait]
pub trait Transport: Send {
    /// Open the channel, run the handshake and discover tools.
    ///
    /// Implementations release every resource they acquired (processes,
    /// streams, background tasks) before returning an error.
    async fn connect(&mut self) -> Result<Vec<ToolDescriptor>, TransportError>;

    /// Invoke one tool, bounded by `wait`.
    async fn call_tool(
        &mut self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        wait: Duration,
    ) -> Result<CallToolResult, TransportError>;

    /// Tear the session down. Idempotent.
    async fn close(&mut self);

    /// Transport kind label for logs.
    fn kind(&self) -> &'static str;
}

/// Build the transport matching a descriptor's configuration.
pub fn build_transport(server_id: &str, config: &TransportConfig) -> Box<dyn Transport + Send> {
    match config {
        TransportConfig::Stdio { command, args, env, cwd } => Box::new(StdioTransport::new(
            server_id,
            command.clone(),
            args.clone(),
            env.clone(),
            cwd.clone(),
        )),
        TransportConfig::Http { base_url, headers } => {
            Box::new(HttpTransport::new(server_id, base_url.clone(), headers.clone()))
        }
    }
}

// ============================================================================
// Stdio
// ============================================================================

/// Subprocess session speaking line-delimited JSON-RPC over its stdio pair.
pub struct StdioTransport {
    server_id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr_task: Option<JoinHandle<()>>,
    next_id: i64,
}

impl StdioTransport {
    /// Create a transport for the given command line. Nothing is spawned
    /// until [`Transport::connect`].
    pub fn new(
        server_id: &str,
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            command,
            args,
            env,
            cwd,
            child: None,
            stdin: None,
            stdout: None,
            stderr_task: None,
            next_id: 1,
        }
    }

    fn spawn(&mut self) -> Result<(), TransportError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);

        for (key, value) in &self.env {
            // Values may reference host environment variables.
            let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
            cmd.env(key, expanded.as_ref());
        }

        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(TransportError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Handshake("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Handshake("failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let server_id = self.server_id.clone();
            self.stderr_task = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server_id, "stderr: {line}");
                }
            }));
        }

        self.stdin = Some(stdin);
        self.stdout = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        Ok(())
    }

    async fn write_json(&mut self, payload: &impl serde::Serialize) -> Result<(), TransportError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| TransportError::ChannelClosed("stdin not open".to_string()))?;
        let mut line = serde_json::to_string(payload)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Send one request and read lines until its response arrives.
    /// Server-initiated notifications on stdout are skipped.
    async fn roundtrip(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = JsonRpcRequest::new(id, method, params);
        tracing::debug!(server = %self.server_id, method, id, "stdio request");
        self.write_json(&request).await?;

        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| TransportError::ChannelClosed("stdout not open".to_string()))?;

        loop {
            let line = stdout
                .next_line()
                .await?
                .ok_or_else(|| TransportError::ChannelClosed("server closed stdout".to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(&line) {
                Ok(response) if response.id == RequestId::Number(id) => {
                    tracing::debug!(server = %self.server_id, id, "stdio response");
                    return Ok(response);
                }
                Ok(_) => continue,
                Err(_) => {
                    tracing::debug!(server = %self.server_id, "skipping non-response line");
                }
            }
        }
    }

    async fn handshake(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let init: InitializeResult = self.roundtrip("initialize", Some(params)).await?.into_result()?;
        tracing::debug!(
            server = %self.server_id,
            remote = %init.server_info.name,
            protocol = %init.protocol_version,
            "initialized"
        );

        self.write_json(&JsonRpcNotification::new("notifications/initialized")).await?;

        let tools: ListToolsResult = self.roundtrip("tools/list", None).await?.into_result()?;
        Ok(tools.tools)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
        self.spawn()?;

        match timeout(CONNECT_TIMEOUT, self.handshake()).await {
            Ok(Ok(tools)) => Ok(tools),
            Ok(Err(e)) => {
                // The child must not outlive a failed handshake.
                self.close().await;
                Err(e)
            }
            Err(_) => {
                self.close().await;
                Err(TransportError::ConnectTimeout(CONNECT_TIMEOUT))
            }
        }
    }

    async fn call_tool(
        &mut self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        wait: Duration,
    ) -> Result<CallToolResult, TransportError> {
        let params = CallToolParams { name: name.to_string(), arguments };
        let params = serde_json::to_value(&params)?;

        match timeout(wait, self.roundtrip("tools/call", Some(params))).await {
            Ok(Ok(response)) => Ok(response.into_result()?),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::CallTimeout(wait)),
        }
    }

    async fn close(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        // Dropping stdin signals EOF before the kill.
        self.stdin = None;
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // kill_on_drop covers the child; the stderr task must not linger.
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// HTTP + event stream
// ============================================================================

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// HTTP session: requests posted to the endpoint the event stream announces,
/// responses matched back by request id.
pub struct HttpTransport {
    server_id: String,
    base_url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    endpoint: Option<String>,
    pending: PendingMap,
    reader_task: Option<JoinHandle<()>>,
    next_id: i64,
}

impl HttpTransport {
    /// Create a transport for the given event-stream URL. Nothing is opened
    /// until [`Transport::connect`].
    pub fn new(server_id: &str, base_url: String, headers: HashMap<String, String>) -> Self {
        Self {
            server_id: server_id.to_string(),
            base_url,
            headers,
            client: reqwest::Client::new(),
            endpoint: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            reader_task: None,
            next_id: 1,
        }
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        request
    }

    async fn open_and_handshake(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let request = self
            .apply_headers(self.client.get(&self.base_url))
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TransportError::Handshake(format!(
                "event stream returned {}",
                response.status()
            )));
        }

        let mut stream = Box::pin(response.bytes_stream());
        let mut parser = SseParser::new();

        // The server announces its request endpoint before anything else.
        let endpoint = 'outer: loop {
            let chunk = stream.next().await.ok_or_else(|| {
                TransportError::Handshake(
                    "event stream closed before endpoint announcement".to_string(),
                )
            })??;
            for event in parser.push(&chunk) {
                if event.name == "endpoint" {
                    break 'outer resolve_endpoint(&self.base_url, event.data.trim());
                }
            }
        };
        tracing::debug!(server = %self.server_id, endpoint = %endpoint, "request endpoint");
        self.endpoint = Some(endpoint);

        // Everything after the announcement is responses (and notifications
        // we do not consume); route them to their waiting callers.
        let pending = Arc::clone(&self.pending);
        let server_id = self.server_id.clone();
        self.reader_task = Some(tokio::spawn(async move {
            read_event_stream(stream, parser, pending, server_id).await;
        }));

        let params = serde_json::to_value(InitializeParams::default())?;
        let init: InitializeResult =
            self.request("initialize", Some(params), CONNECT_TIMEOUT).await?.into_result()?;
        tracing::debug!(
            server = %self.server_id,
            remote = %init.server_info.name,
            protocol = %init.protocol_version,
            "initialized"
        );

        self.notify("notifications/initialized").await?;

        let tools: ListToolsResult =
            self.request("tools/list", None, CONNECT_TIMEOUT).await?.into_result()?;
        Ok(tools.tools)
    }

    async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| TransportError::ChannelClosed("no request endpoint".to_string()))?;
        let request = self
            .apply_headers(self.client.post(&endpoint))
            .json(&JsonRpcNotification::new(method));
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TransportError::ChannelClosed(format!(
                "request channel returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
        wait: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| TransportError::ChannelClosed("no request endpoint".to_string()))?;

        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        tracing::debug!(server = %self.server_id, method, id, "http request");
        let send = self
            .apply_headers(self.client.post(&endpoint))
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(&request)
            .send()
            .await;

        let response = match send {
            Ok(response) => response,
            Err(e) => {
                self.pending.lock().await.remove(&id);
                return Err(e.into());
            }
        };

        if !response.status().is_success() {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::ChannelClosed(format!(
                "request channel returned {}",
                response.status()
            )));
        }

        // Some servers answer the POST directly instead of over the stream.
        if let Some(direct) = direct_response(response, id).await {
            self.pending.lock().await.remove(&id);
            return Ok(direct);
        }

        match timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ChannelClosed(
                "event stream closed while awaiting response".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(TransportError::CallTimeout(wait))
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
        match timeout(CONNECT_TIMEOUT, self.open_and_handshake()).await {
            Ok(Ok(tools)) => Ok(tools),
            Ok(Err(e)) => {
                self.close().await;
                Err(e)
            }
            Err(_) => {
                self.close().await;
                Err(TransportError::ConnectTimeout(CONNECT_TIMEOUT))
            }
        }
    }

    async fn call_tool(
        &mut self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        wait: Duration,
    ) -> Result<CallToolResult, TransportError> {
        let params = CallToolParams { name: name.to_string(), arguments };
        let params = serde_json::to_value(&params)?;
        Ok(self.request("tools/call", Some(params), wait).await?.into_result()?)
    }

    async fn close(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.endpoint = None;
        self.pending.lock().await.clear();
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Extract a JSON-RPC response from a POST reply body, if the server chose
/// to answer there. Accepts plain JSON and single-event stream bodies.
async fn direct_response(response: reqwest::Response, id: i64) -> Option<JsonRpcResponse> {
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = response.bytes().await.ok()?;
    if body.is_empty() {
        return None;
    }

    let parsed = if content_type.starts_with("text/event-stream") {
        let text = String::from_utf8_lossy(&body);
        let data = text.lines().find_map(|line| line.strip_prefix("data:"))?.trim().to_string();
        serde_json::from_str::<JsonRpcResponse>(&data).ok()?
    } else {
        serde_json::from_slice::<JsonRpcResponse>(&body).ok()?
    };

    (parsed.id == RequestId::Number(id)).then_some(parsed)
}

async fn read_event_stream<B: AsRef<[u8]>>(
    mut stream: impl futures::Stream<Item = Result<B, reqwest::Error>> + Unpin,
    mut parser: SseParser,
    pending: PendingMap,
    server_id: String,
) {
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(server = %server_id, error = %e, "event stream error");
                break;
            }
        };
        for event in parser.push(chunk.as_ref()) {
            if event.data.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                Ok(response) => {
                    let id = match response.id {
                        RequestId::Number(id) => id,
                        RequestId::String(_) => continue,
                    };
                    if let Some(tx) = pending.lock().await.remove(&id) {
                        let _ = tx.send(response);
                    }
                }
                // Server-initiated notification; this client does not consume any.
                Err(_) => {}
            }
        }
    }
    tracing::debug!(server = %server_id, "event stream ended");
    // Wake every waiter with a closed channel.
    pending.lock().await.clear();
}

/// Resolve the announced endpoint against the stream URL.
fn resolve_endpoint(base_url: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    if endpoint.starts_with('/') {
        let origin = base_url
            .find("://")
            .and_then(|scheme| {
                base_url[scheme + 3..].find('/').map(|slash| &base_url[..scheme + 3 + slash])
            })
            .unwrap_or(base_url);
        return format!("{origin}{endpoint}");
    }
    format!("{}/{}", base_url.trim_end_matches('/'), endpoint)
}

// ============================================================================
// Event-stream parsing
// ============================================================================

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SseEvent {
    /// Event name ("message" when the server sends none)
    name: String,
    /// Data lines joined with newlines
    data: String,
}

/// Incremental server-sent-event parser over arbitrary byte chunks.
#[derive(Default)]
struct SseParser {
    buf: String,
    event: String,
    data: Vec<String>,
}

impl SseParser {
    fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every event completed by it.
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if !self.data.is_empty() || !self.event.is_empty() {
                    let name = if self.event.is_empty() {
                        "message".to_string()
                    } else {
                        std::mem::take(&mut self.event)
                    };
                    events.push(SseEvent { name, data: self.data.join("\n") });
                    self.event.clear();
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = value.to_string(),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        events
    }
}
