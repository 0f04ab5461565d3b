//! Tool system: descriptor, trait, registry and implementations
//!
//! A tool never fails the agent turn. [`Tool::execute`] validates the
//! arguments against the tool's descriptor, runs it, and renders any
//! failure as text the model can read and react to.

pub mod apps;
pub mod execute_code;
pub mod schema;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info_span, warn, Instrument};

use crate::integrations::IntegrationError;
use crate::metrics::TOOL_CALLS;
use crate::runtime::RuntimeError;

pub use apps::{GenerateAppTool, ImportAppTool, ListAppsTool};
pub use execute_code::ExecuteCodeTool;

/// Function-tool definition sent to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    #[serde(rename = "type")]
    pub tool_type: String, // Always "function"
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema
    pub strict: bool,
}

impl ToolDescriptor {
    /// Strict function tool whose every property is required
    ///
    /// # Arguments
    /// * `properties` - JSON Schema `properties` object
    pub fn function(name: &str, description: &str, properties: Value) -> Self {
        let required: Vec<String> = properties
            .as_object()
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default();
        Self {
            tool_type: "function".to_string(),
            name: name.to_string(),
            description: description.to_string(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
                "additionalProperties": false,
            }),
            strict: true,
        }
    }
}

/// Error type for tool dispatch and execution
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool Error: {0}")]
    UnknownTool(String),
    #[error("tool `{0}` is already registered")]
    Duplicate(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Integration(#[from] IntegrationError),
    #[error("{0}")]
    Execution(String),
}

/// Trait that all tools implement
#[async_trait]
pub trait Tool: Send + Sync {
    /// Descriptor built once when the tool is constructed
    fn describe(&self) -> &ToolDescriptor;

    /// Run the tool with arguments that already passed validation
    async fn invoke(&self, arguments: Value) -> Result<String, ToolError>;

    /// Validate, run, and render the outcome as text; never fails
    async fn execute(&self, arguments: Value) -> String {
        let descriptor = self.describe();
        let name = descriptor.name.as_str();

        if let Err(e) = schema::validate_arguments(descriptor, &arguments) {
            TOOL_CALLS.with_label_values(&[name, "invalid"]).inc();
            debug!(tool = name, error = %e, "Rejected tool arguments");
            return e.to_string();
        }

        let started = Instant::now();
        match self.invoke(arguments).await {
            Ok(output) => {
                TOOL_CALLS.with_label_values(&[name, "ok"]).inc();
                debug!(tool = name, elapsed_ms = started.elapsed().as_millis() as u64, "Tool finished");
                output
            }
            Err(e) => {
                TOOL_CALLS.with_label_values(&[name, "error"]).inc();
                warn!(tool = name, error = %e, "Tool failed");
                format!("Error: {}", e)
            }
        }
    }
}

/// Registry of available tools, in registration order
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; names must be unique
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.describe().name.clone();
        if self.index.contains_key(&name) {
            return Err(ToolError::Duplicate(name));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&i| Arc::clone(&self.tools[i]))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors of every tool, in registration order
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|t| t.describe().clone()).collect()
    }

    /// Run a tool by name
    ///
    /// Only an unknown name is an error; everything else comes back as text.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let span = info_span!("tool.call", otel.name = "tool.call", tool = name);
        Ok(tool.execute(arguments).instrument(span).await)
    }
}
