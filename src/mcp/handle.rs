//! Per-server connection handle and its state machine.
//!
//! A [`ClientHandle`] owns at most one live transport session for one
//! configured server. Every operation on the session is serialized by the
//! handle's own mutex, so concurrent callers cannot race on the underlying
//! channel and the state transitions below hold:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected | Error
//! ```
//!
//! Transport faults during a tool call (timeouts, broken pipes, closed
//! streams) are absorbed here: the stale session is torn down and rebuilt up
//! to a fixed retry budget before a typed failure surfaces.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::catalog::ToolCatalog;
use super::protocol::{CallToolResult, ToolDescriptor};
use super::transport::{build_transport, Transport, TransportError, CALL_TIMEOUT};
use crate::config::ServerDescriptor;

/// Attempts per tool call before a transport fault is surfaced.
pub const RETRY_BUDGET: usize = 3;

/// Connection lifecycle of one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live session
    Disconnected,
    /// Session being established
    Connecting,
    /// Handshake done, catalog populated
    Connected,
    /// Last attempt failed
    Error,
}

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to '{server}' after {attempts} attempt(s): {source}")]
    Connect {
        server: String,
        attempts: usize,
        #[source]
        source: TransportError,
    },

    #[error("tool '{tool}' timed out after {attempts} attempt(s)")]
    ToolTimeout { tool: String, attempts: usize },

    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("unknown tool '{tool}' on server '{server}'")]
    UnknownTool { server: String, tool: String },
}

/// Builds a fresh transport session for a descriptor. Injected so tests can
/// substitute an in-process fake.
pub type TransportFactory =
    Arc<dyn Fn(&ServerDescriptor) -> Box<dyn Transport + Send> + Send + Sync>;

/// Default factory: real stdio/http transports per the descriptor.
pub fn default_transport_factory() -> TransportFactory {
    Arc::new(|descriptor| build_transport(&descriptor.id, &descriptor.transport))
}

struct Inner {
    state: ConnectionState,
    transport: Option<Box<dyn Transport + Send>>,
    catalog: ToolCatalog,
}

/// One server's connection: transport session + tool catalog + state machine
/// behind a single mutex. The unit of reconnect and retry.
pub struct ClientHandle {
    descriptor: ServerDescriptor,
    factory: TransportFactory,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.descriptor.id)
            .finish_non_exhaustive()
    }
}

impl ClientHandle {
    /// Create a disconnected handle for a descriptor.
    pub fn new(descriptor: ServerDescriptor) -> Self {
        Self::with_factory(descriptor, default_transport_factory())
    }

    /// Create a handle with a custom transport factory.
    pub fn with_factory(descriptor: ServerDescriptor, factory: TransportFactory) -> Self {
        Self {
            descriptor,
            factory,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                transport: None,
                catalog: ToolCatalog::new(),
            }),
        }
    }

    /// The descriptor this handle serves.
    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    /// Server id shorthand.
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Whether the handle currently holds a live session.
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.state == ConnectionState::Connected
    }

    /// Cached tool descriptors (empty unless Connected).
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.inner.lock().await.catalog.descriptors().to_vec()
    }

    /// One cached tool descriptor by name.
    pub async fn tool_descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.inner.lock().await.catalog.get(name).cloned()
    }

    /// Cached tools in completion-service function format.
    pub async fn function_specs(&self) -> Vec<Value> {
        self.inner.lock().await.catalog.function_specs()
    }

    /// Connect if not already Connected. A failure leaves the handle
    /// Disconnected so a later call can retry from scratch.
    pub async fn ensure_connected(&self) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await.map_err(|source| ClientError::Connect {
            server: self.descriptor.id.clone(),
            attempts: 1,
            source,
        })
    }

    async fn connect_locked(&self, inner: &mut Inner) -> Result<(), TransportError> {
        if inner.state == ConnectionState::Connected {
            return Ok(());
        }

        inner.state = ConnectionState::Connecting;
        let mut transport = (self.factory)(&self.descriptor);
        tracing::debug!(server = %self.descriptor.id, kind = transport.kind(), "connecting");

        match transport.connect().await {
            Ok(tools) => {
                tracing::info!(
                    server = %self.descriptor.id,
                    tools = tools.len(),
                    "connected"
                );
                inner.catalog.replace(tools);
                inner.transport = Some(transport);
                inner.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(server = %self.descriptor.id, error = %e, "connect failed");
                inner.state = ConnectionState::Error;
                transport.close().await;
                inner.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn teardown_locked(inner: &mut Inner) {
        if let Some(mut transport) = inner.transport.take() {
            transport.close().await;
        }
        inner.catalog.clear();
        inner.state = ConnectionState::Disconnected;
    }

    /// Invoke one tool. Transport faults are absorbed by tearing the session
    /// down, reconnecting and retrying up to [`RETRY_BUDGET`] attempts;
    /// tool-reported failures and bad arguments surface immediately.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, ClientError> {
        let mut inner = self.inner.lock().await;
        let mut attempts = 0;
        let mut last_error: Option<TransportError> = None;

        while attempts < RETRY_BUDGET {
            attempts += 1;

            if inner.state != ConnectionState::Connected {
                match self.connect_locked(&mut inner).await {
                    Ok(()) => {}
                    Err(e) => {
                        last_error = Some(e);
                        continue;
                    }
                }
            }

            if !inner.catalog.has(name) {
                return Err(ClientError::UnknownTool {
                    server: self.descriptor.id.clone(),
                    tool: name.to_string(),
                });
            }

            let Some(transport) = inner.transport.as_mut() else {
                // State said Connected but the session is gone; rebuild.
                inner.state = ConnectionState::Disconnected;
                continue;
            };

            match transport.call_tool(name, arguments.clone(), CALL_TIMEOUT).await {
                Ok(result) => {
                    if result.is_error.unwrap_or(false) {
                        return Err(ClientError::ToolExecution {
                            tool: name.to_string(),
                            message: result.text(),
                        });
                    }
                    return Ok(result);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        server = %self.descriptor.id,
                        tool = name,
                        attempt = attempts,
                        error = %e,
                        "transport fault, resetting session"
                    );
                    Self::teardown_locked(&mut inner).await;
                    last_error = Some(e);
                }
                Err(e) => {
                    // The server answered; this is not a dead session.
                    return Err(ClientError::ToolExecution {
                        tool: name.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        match last_error {
            Some(TransportError::CallTimeout(_)) => {
                Err(ClientError::ToolTimeout { tool: name.to_string(), attempts })
            }
            Some(source) => Err(ClientError::Connect {
                server: self.descriptor.id.clone(),
                attempts,
                source,
            }),
            None => Err(ClientError::ToolTimeout { tool: name.to_string(), attempts }),
        }
    }

    /// Tear down the session and release its resources. Idempotent; the
    /// handle always ends Disconnected.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        Self::teardown_locked(&mut inner).await;
        tracing::debug!(server = %self.descriptor.id, "closed");
    }
}
