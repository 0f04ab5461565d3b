//! Conversation types and the model adapter contract
//!
//! The agent loop only ever talks to a model through [`ModelClient`], which
//! turns a transcript plus tool descriptors into exactly one [`ModelTurn`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolDescriptor;

/// Literal output that tells the loop the plan is finished
pub const COMPLETION_TOKEN: &str = "done";

/// A structured function call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub call_id: String,
    pub name: String,
    /// Raw JSON text exactly as the model produced it
    pub arguments: String,
}

impl FunctionCall {
    /// Parse the raw argument text as JSON
    pub fn parse_arguments(&self) -> Result<Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// One entry of the agent transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationMessage {
    User { content: String },
    Assistant { content: String },
    Developer { content: String },
    ToolCall(FunctionCall),
    ToolResult { call_id: String, output: String },
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
        }
    }

    pub fn developer(content: impl Into<String>) -> Self {
        Self::Developer {
            content: content.into(),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            output: output.into(),
        }
    }

    /// Short label used in logs and transcript dumps
    pub fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Developer { .. } => "developer",
            Self::ToolCall(_) => "tool_call",
            Self::ToolResult { .. } => "tool_result",
        }
    }

    /// Text body of the message (arguments for a tool call)
    pub fn text(&self) -> &str {
        match self {
            Self::User { content } | Self::Assistant { content } | Self::Developer { content } => content,
            Self::ToolCall(call) => &call.arguments,
            Self::ToolResult { output, .. } => output,
        }
    }
}

/// What the model did on one turn
#[derive(Debug, Clone, PartialEq)]
pub enum ModelTurn {
    /// The model emitted the completion token
    Completion,
    /// The model asked for a tool to be run
    FunctionCall(FunctionCall),
    /// Plain assistant text
    Message(String),
}

/// Error type for model calls
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("malformed model response: {0}")]
    Malformed(String),
    #[error("empty response from model")]
    EmptyResponse,
}

/// A language model that can take one turn of a tool-using conversation
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model identifier, recorded in sessions and logs
    fn model_name(&self) -> &str;

    /// Send the transcript and available tools, get back one turn
    async fn respond(
        &self,
        transcript: &[ConversationMessage],
        tools: &[ToolDescriptor],
    ) -> Result<ModelTurn, ModelError>;
}
