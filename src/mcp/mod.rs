//! Tool-server connection management.
//!
//! This module maintains connections to independent tool servers and routes
//! tool invocations to them, tolerating transport failures mid-conversation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 ClientRegistry                   │
//! │  • one handle per configured server             │
//! │  • single-flight create, start/stop/restart     │
//! └─────────────────────────────────────────────────┘
//!                        │
//!        ┌───────────────┼───────────────┐
//!        ▼               ▼               ▼
//!   ClientHandle    ClientHandle    ClientHandle
//!   state machine   state machine   state machine
//!   + ToolCatalog   + ToolCatalog   + ToolCatalog
//!        │               │               │
//!        ▼               ▼               ▼
//!   StdioTransport  HttpTransport   StdioTransport
//!   (subprocess)    (event stream)  (subprocess)
//! ```
//!
//! Transports never retry; the handle absorbs transient faults by resetting
//! and reconnecting up to a fixed budget. The registry serializes handle
//! creation so concurrent lookups for one server never open two sessions.

mod catalog;
mod handle;
mod protocol;
mod registry;
mod transport;

pub use catalog::ToolCatalog;
pub use handle::{
    default_transport_factory, ClientError, ClientHandle, ConnectionState, TransportFactory,
    RETRY_BUDGET,
};
pub use protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, ClientInfo, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, RequestId, ServerCapabilities, ServerInfo, ToolContent, ToolDescriptor,
    ToolInputSchema, PROTOCOL_VERSION,
};
pub use registry::{ClientRegistry, RegistryError, HTTP_SETTLE, STDIO_SETTLE};
pub use transport::{
    build_transport, HttpTransport, StdioTransport, Transport, TransportError, CALL_TIMEOUT,
    CONNECT_TIMEOUT,
};
