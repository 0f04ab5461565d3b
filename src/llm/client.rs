//! OpenAI Responses API client
//!
//! Sends the transcript as `input` items and maps the `output` items of the
//! response back into a [`ModelTurn`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info_span, Instrument};

use super::tool_use::{ConversationMessage, FunctionCall, ModelClient, ModelError, ModelTurn, COMPLETION_TOKEN};
use crate::metrics::{MODEL_CALLS, MODEL_LATENCY};
use crate::tools::ToolDescriptor;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4.1";

/// Client for the `/responses` endpoint with function calling
#[derive(Clone)]
pub struct ResponsesClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl ResponsesClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `api_key` - Bearer token for the provider
    /// * `model` - The model name (e.g., "gpt-4.1")
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        // builder only fails when the TLS backend cannot initialise
        if let Ok(client) = reqwest::Client::builder().timeout(timeout).build() {
            self.client = client;
        }
        self
    }

    /// Request body for one turn
    pub fn build_request(&self, transcript: &[ConversationMessage], tools: &[ToolDescriptor]) -> Value {
        let input: Vec<Value> = transcript.iter().map(to_input_item).collect();
        let mut body = json!({
            "model": self.model,
            "input": input,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl ModelClient for ResponsesClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn respond(
        &self,
        transcript: &[ConversationMessage],
        tools: &[ToolDescriptor],
    ) -> Result<ModelTurn, ModelError> {
        let span = info_span!(
            "model.respond",
            otel.name = "model.respond",
            model = %self.model,
            messages = transcript.len()
        );
        async move {
            let endpoint = format!("{}/responses", self.base_url);
            let body = self.build_request(transcript, tools);

            let started = Instant::now();
            MODEL_CALLS.inc();
            let response = self
                .client
                .post(&endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            let text = response.text().await?;
            MODEL_LATENCY.observe(started.elapsed().as_secs_f64());

            if !status.is_success() {
                return Err(ModelError::Status {
                    status: status.as_u16(),
                    body: text,
                });
            }
            if text.is_empty() {
                return Err(ModelError::EmptyResponse);
            }

            let value: Value = serde_json::from_str(&text)?;
            let turn = parse_response(&value)?;
            debug!(turn = ?turn_kind(&turn), elapsed_ms = started.elapsed().as_millis() as u64, "Model turn");
            Ok(turn)
        }
        .instrument(span)
        .await
    }
}

fn turn_kind(turn: &ModelTurn) -> &'static str {
    match turn {
        ModelTurn::Completion => "completion",
        ModelTurn::FunctionCall(_) => "function_call",
        ModelTurn::Message(_) => "message",
    }
}

/// Map a transcript entry to a Responses API input item
pub fn to_input_item(message: &ConversationMessage) -> Value {
    match message {
        ConversationMessage::User { content } => json!({"role": "user", "content": content}),
        ConversationMessage::Assistant { content } => json!({"role": "assistant", "content": content}),
        ConversationMessage::Developer { content } => json!({"role": "developer", "content": content}),
        ConversationMessage::ToolCall(call) => json!({
            "type": "function_call",
            "call_id": call.call_id,
            "name": call.name,
            "arguments": call.arguments,
        }),
        ConversationMessage::ToolResult { call_id, output } => json!({
            "type": "function_call_output",
            "call_id": call_id,
            "output": output,
        }),
    }
}

/// Map a Responses API body to a model turn
///
/// The completion token wins, then the first function call (any further
/// calls in the same response are ignored), then plain text.
pub fn parse_response(body: &Value) -> Result<ModelTurn, ModelError> {
    let output = body
        .get("output")
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::Malformed("missing `output` array".to_string()))?;

    let text = output_text(output);
    if text.trim() == COMPLETION_TOKEN {
        return Ok(ModelTurn::Completion);
    }

    if let Some(item) = output
        .iter()
        .find(|item| item.get("type").and_then(Value::as_str) == Some("function_call"))
    {
        let field = |name: &str| -> Result<String, ModelError> {
            item.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ModelError::Malformed(format!("function_call without `{}`", name)))
        };
        return Ok(ModelTurn::FunctionCall(FunctionCall {
            call_id: field("call_id")?,
            name: field("name")?,
            arguments: item
                .get("arguments")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }));
    }

    if text.is_empty() {
        return Err(ModelError::EmptyResponse);
    }
    Ok(ModelTurn::Message(text))
}

/// Concatenate every `output_text` part of every message item
fn output_text(output: &[Value]) -> String {
    output
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("output_text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect()
}
