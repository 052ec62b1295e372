//! The agentic tool-call loop.
//!
//! One run drives a single conversation: completion call, then the requested
//! tool invocations in request order, results appended in that same order,
//! and around again until the service stops asking for tools or the round
//! bound is hit. Progress streams out as [`AgentEvent`]s; `done` or the
//! aborting `error` is always the last event.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::mcp::{ClientHandle, ToolDescriptor};

use super::{ChatMessage, CompletionProvider, CompletionRequest, CompletionResponse};

/// Completion rounds per run before the loop aborts.
pub const MAX_ROUNDS: usize = 5;

const EVENT_BUFFER: usize = 32;

/// One event emitted by a loop run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Progress note
    Status { message: String },

    /// Assistant text from the completion service
    #[serde(rename = "llm_response")]
    LlmResponse { content: String },

    /// A tool invocation is about to run
    ToolCall { id: String, name: String, arguments: Value },

    /// A tool invocation finished
    ToolResult { id: String, name: String, output: String, elapsed_ms: u64 },

    /// A failure that did not necessarily end the run
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
    },

    /// The run finished normally
    Done {
        rounds: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
}

/// Driver alternating completion calls with tool executions through one
/// server handle.
pub struct ToolCallLoop {
    provider: Arc<dyn CompletionProvider>,
    handle: Arc<ClientHandle>,
    max_rounds: usize,
    preamble: Option<String>,
}

impl ToolCallLoop {
    /// Create a loop over a provider and a connected (or connectable) handle.
    pub fn new(provider: Arc<dyn CompletionProvider>, handle: Arc<ClientHandle>) -> Self {
        Self { provider, handle, max_rounds: MAX_ROUNDS, preamble: None }
    }

    /// Override the round bound.
    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Override the system preamble.
    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    /// Run the loop. Returns the event stream; the run itself proceeds in a
    /// background task and stops early if the receiver is dropped.
    ///
    /// The returned sequence is finite and not restartable. `history` is
    /// spliced in between the system preamble and the query.
    pub fn run(self, query: &str, history: Vec<ChatMessage>) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let query = query.to_string();
        tokio::spawn(async move {
            self.drive(&query, history, tx).await;
        });
        rx
    }

    async fn drive(self, query: &str, history: Vec<ChatMessage>, tx: mpsc::Sender<AgentEvent>) {
        // A send failure means the caller abandoned the run.
        macro_rules! emit {
            ($event:expr) => {
                if tx.send($event).await.is_err() {
                    tracing::debug!(server = %self.handle.id(), "event receiver dropped, abandoning run");
                    return;
                }
            };
        }

        emit!(AgentEvent::Status {
            message: format!("connecting to {}", self.handle.id()),
        });
        if let Err(e) = self.handle.ensure_connected().await {
            emit!(AgentEvent::Error { message: e.to_string(), tool_call_id: None });
            return;
        }

        let tools = self.handle.function_specs().await;
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(
            self.preamble.clone().unwrap_or_else(|| default_preamble(self.handle.id())),
        ));
        messages.extend(history);
        messages.push(ChatMessage::user(query));

        for round in 1..=self.max_rounds {
            tracing::debug!(server = %self.handle.id(), round, "completion round");
            emit!(AgentEvent::Status { message: format!("thinking (round {round})") });

            let request = CompletionRequest::new(messages.clone(), tools.clone());
            let response: CompletionResponse = match self.provider.complete(&request).await {
                Ok(response) => response,
                Err(e) => {
                    emit!(AgentEvent::Error {
                        message: format!("completion service failed: {e}"),
                        tool_call_id: None,
                    });
                    return;
                }
            };

            if let Some(content) = response.content.as_deref() {
                if !content.is_empty() {
                    emit!(AgentEvent::LlmResponse { content: content.to_string() });
                }
            }

            // Backfill ids the service omitted so tool messages always pair
            // with the assistant message that requested them.
            let mut tool_calls = response.tool_calls;
            for call in &mut tool_calls {
                if call.id.is_empty() {
                    call.id = uuid::Uuid::new_v4().to_string();
                }
            }

            messages.push(ChatMessage::Assistant {
                content: response.content.clone(),
                tool_calls: (!tool_calls.is_empty()).then(|| tool_calls.clone()),
            });

            if tool_calls.is_empty() {
                emit!(AgentEvent::Done { rounds: round, content: response.content });
                return;
            }

            // Execute in request order; append each result, bound to its
            // call id, before the next completion round.
            for call in tool_calls {
                let call_id = call.id.clone();

                let arguments = match parse_arguments(&call.arguments_json) {
                    Ok(arguments) => arguments,
                    Err(message) => {
                        let text = format!("Invalid arguments for {}: {message}", call.name);
                        emit!(AgentEvent::Error {
                            message: text.clone(),
                            tool_call_id: Some(call_id.clone()),
                        });
                        messages.push(ChatMessage::Tool { tool_call_id: call_id, content: text });
                        continue;
                    }
                };

                emit!(AgentEvent::ToolCall {
                    id: call_id.clone(),
                    name: call.name.clone(),
                    arguments: Value::Object(arguments.clone()),
                });

                let descriptor = self.handle.tool_descriptor(&call.name).await;
                if let Some(message) =
                    descriptor.as_ref().and_then(|d| missing_required(d, &arguments))
                {
                    let text = format!("Invalid arguments for {}: {message}", call.name);
                    emit!(AgentEvent::Error {
                        message: text.clone(),
                        tool_call_id: Some(call_id.clone()),
                    });
                    messages.push(ChatMessage::Tool { tool_call_id: call_id, content: text });
                    continue;
                }

                let started = Instant::now();
                let outcome = self
                    .handle
                    .call_tool(&call.name, (!arguments.is_empty()).then_some(arguments))
                    .await;
                let elapsed_ms = started.elapsed().as_millis() as u64;

                match outcome {
                    Ok(result) => {
                        let output = result.text();
                        emit!(AgentEvent::ToolResult {
                            id: call_id.clone(),
                            name: call.name.clone(),
                            output: output.clone(),
                            elapsed_ms,
                        });
                        messages.push(ChatMessage::Tool {
                            tool_call_id: call_id,
                            content: if output.is_empty() {
                                "(no output)".to_string()
                            } else {
                                output
                            },
                        });
                    }
                    Err(e) => {
                        // Error-shaped result: the completion service sees
                        // the failure and can adapt; the run continues.
                        let text = format!("Error: {e}");
                        emit!(AgentEvent::Error {
                            message: text.clone(),
                            tool_call_id: Some(call_id.clone()),
                        });
                        messages.push(ChatMessage::Tool { tool_call_id: call_id, content: text });
                    }
                }
            }
        }

        emit!(AgentEvent::Error {
            message: format!("aborted: round bound of {} exceeded", self.max_rounds),
            tool_call_id: None,
        });
    }
}

fn default_preamble(server_id: &str) -> String {
    format!(
        r"You are an assistant with access to the tools of the '{server_id}' tool server.
Use the provided tools to answer the user's request.

Guidelines:
1. Call tools when you need data or to perform actions
2. If a tool fails, adapt or try an alternative
3. When you have what you need, answer directly without further tool calls
4. Be concise"
    )
}

/// Decode the raw arguments string into an object. An empty string counts as
/// an empty object; anything that is not a JSON object is rejected.
fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(e) => Err(e.to_string()),
    }
}

/// Thin pre-dispatch check: every schema-required key must be present.
fn missing_required(descriptor: &ToolDescriptor, arguments: &Map<String, Value>) -> Option<String> {
    let required = descriptor.input_schema.required.as_deref()?;
    let missing: Vec<&str> = required
        .iter()
        .filter(|key| !arguments.contains_key(key.as_str()))
        .map(String::as_str)
        .collect();
    (!missing.is_empty()).then(|| format!("missing required field(s): {}", missing.join(", ")))
}
