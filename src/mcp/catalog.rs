//! Per-session tool catalog.

use serde_json::Value;

use super::protocol::ToolDescriptor;

/// Cache of the tools one connected server exposes, plus their translation
/// into the completion service's function-calling format.
///
/// Populated after a successful connect, cleared on disconnect.
#[derive(Debug, Default, Clone)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
}

impl ToolCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached descriptors after a fresh discovery.
    pub fn replace(&mut self, tools: Vec<ToolDescriptor>) {
        self.tools = tools;
    }

    /// Drop every cached descriptor.
    pub fn clear(&mut self) {
        self.tools.clear();
    }

    /// All cached descriptors.
    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Look up one tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Whether a tool with this name is cached.
    pub fn has(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    /// Names of every cached tool.
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Translate the cached descriptors into completion-service function
    /// specifications.
    pub fn function_specs(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect()
    }
}
