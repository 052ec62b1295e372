//! # Toolbridge
//!
//! Client-side connection layer and agentic tool-call loop for MCP tool
//! servers.
//!
//! Toolbridge maintains a registry of independently configured tool servers,
//! reachable over a subprocess stdio pipe or an HTTP event-stream channel,
//! and drives a bounded completion/tool-execution loop against whichever
//! server a query needs.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use toolbridge::{ClientRegistry, FileStore, OpenAIProvider, ToolCallLoop};
//!
//! let store = Arc::new(FileStore::load_default()?);
//! let registry = ClientRegistry::new(store);
//!
//! let handle = registry.get("database", true).await?;
//! let provider = Arc::new(OpenAIProvider::new()?);
//!
//! let mut events = ToolCallLoop::new(provider, handle).run("show me the tables", Vec::new());
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::similar_names)]

pub mod ai;
pub mod config;
pub mod mcp;

pub use ai::{
    AgentEvent, AiError, ChatMessage, CompletionProvider, CompletionRequest, CompletionResponse,
    OpenAIProvider, ServerSelector, ServerSummary, ToolCallLoop, ToolCallRequest, MAX_ROUNDS,
};
pub use config::{
    ConfigError, DescriptorStore, FileStore, MemoryStore, ServerDescriptor, ServerStatus,
    TransportConfig,
};
pub use mcp::{
    ClientError, ClientHandle, ClientRegistry, ConnectionState, RegistryError, ToolCatalog,
    ToolDescriptor, Transport, TransportError,
};
