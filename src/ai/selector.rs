//! Server selection for free-text queries.
//!
//! Best effort: with several servers running, one completion call picks the
//! most plausible target. Callers needing deterministic routing should skip
//! this and address a server id directly.

use std::sync::Arc;

use crate::mcp::ClientHandle;

use super::{ChatMessage, CompletionProvider, CompletionRequest};

/// Short description of one running server, fed to the routing prompt.
#[derive(Debug, Clone)]
pub struct ServerSummary {
    /// Server id
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Names of the tools it currently exposes
    pub tools: Vec<String>,
}

impl ServerSummary {
    /// Build a summary from a live handle's descriptor and catalog.
    pub async fn from_handle(handle: &ClientHandle) -> Self {
        let descriptor = handle.descriptor();
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            tools: handle.tools().await.into_iter().map(|t| t.name).collect(),
        }
    }
}

/// Picks one server id for a free-text query.
pub struct ServerSelector {
    provider: Arc<dyn CompletionProvider>,
}

impl ServerSelector {
    /// Create a selector over a completion provider.
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }

    /// Select a server for the query.
    ///
    /// Zero running servers yields None. Exactly one is returned without a
    /// completion call. With several, the completion service picks; an
    /// unrecognized answer falls back to the first running server.
    pub async fn select(&self, query: &str, servers: &[ServerSummary]) -> Option<String> {
        match servers {
            [] => None,
            [only] => Some(only.id.clone()),
            _ => Some(self.route(query, servers).await),
        }
    }

    async fn route(&self, query: &str, servers: &[ServerSummary]) -> String {
        let mut listing = String::new();
        for server in servers {
            listing.push_str(&format!("- id: {} ({})", server.id, server.name));
            if !server.tools.is_empty() {
                listing.push_str(&format!(", tools: {}", server.tools.join(", ")));
            }
            listing.push('\n');
        }

        let system = format!(
            r"You route user requests to tool servers.
Pick the single most suitable server for the request.

Available servers:
{listing}
Reply with the server id only, nothing else."
        );

        let request = CompletionRequest::text_only(vec![
            ChatMessage::system(system),
            ChatMessage::user(query),
        ]);

        let answer = match self.provider.complete(&request).await {
            Ok(response) => response.content.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "routing call failed, falling back");
                String::new()
            }
        };

        let answer = answer.trim();
        if let Some(server) = servers.iter().find(|s| s.id == answer) {
            return server.id.clone();
        }
        // Lenient second pass: the id mentioned anywhere in the reply.
        if let Some(server) = servers.iter().find(|s| answer.contains(&s.id)) {
            tracing::debug!(answer, chosen = %server.id, "routing answer matched loosely");
            return server.id.clone();
        }

        tracing::warn!(answer, "unrecognized routing answer, using first running server");
        servers[0].id.clone()
    }
}
