//! Language model integration

pub mod client;
pub mod tool_use;

pub use client::ResponsesClient;
pub use tool_use::{
    ConversationMessage, FunctionCall, ModelClient, ModelError, ModelTurn, COMPLETION_TOKEN,
};
