//! App tools: `list_apps`, `import_app`, `generate_app`

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{Tool, ToolDescriptor, ToolError};
use crate::integrations::{injection_snippet, render_listing, AppGenerator, IntegrationStore};
use crate::kernel::{render_events, OutputEvent};
use crate::runtime::SharedRuntime;

fn string_arg<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    arguments[key]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("`{}` must be a string", key)))
}

/// Lists the persisted integrations
pub struct ListAppsTool {
    store: IntegrationStore,
    descriptor: ToolDescriptor,
}

impl ListAppsTool {
    pub fn new(store: IntegrationStore) -> Self {
        Self {
            store,
            descriptor: ToolDescriptor::function(
                "list_apps",
                "List the available apps (API wrapper classes) that can be imported into the Python kernel.",
                json!({}),
            ),
        }
    }
}

#[async_trait]
impl Tool for ListAppsTool {
    fn describe(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _arguments: Value) -> Result<String, ToolError> {
        Ok(render_listing(&self.store.list()?))
    }
}

/// Defines an app's class inside the live kernel
pub struct ImportAppTool {
    store: IntegrationStore,
    runtime: SharedRuntime,
    descriptor: ToolDescriptor,
}

impl ImportAppTool {
    pub fn new(store: IntegrationStore, runtime: SharedRuntime) -> Self {
        Self {
            store,
            runtime,
            descriptor: ToolDescriptor::function(
                "import_app",
                "Import an app into the Python kernel by its app_id. Its class becomes available to execute_code.",
                json!({
                    "app_id": {
                        "type": "string",
                        "description": "The app_id shown by list_apps, e.g. 'com.discord'."
                    }
                }),
            ),
        }
    }
}

#[async_trait]
impl Tool for ImportAppTool {
    fn describe(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, arguments: Value) -> Result<String, ToolError> {
        let app_id = string_arg(&arguments, "app_id")?;
        let entry = self.store.find(app_id)?;
        let source = self.store.read_source(&entry)?;
        let snippet = injection_snippet(&entry, &source)?;

        let events = self.runtime.lock().await.execute(&snippet).await?;
        let errors: Vec<OutputEvent> = events.into_iter().filter(OutputEvent::is_error).collect();
        if !errors.is_empty() {
            return Ok(format!(
                "Failed to import app '{}': {}",
                entry.app_id,
                render_events(&errors)
            ));
        }

        info!(app_id = %entry.app_id, class = %entry.class_name, "App imported into kernel");
        Ok(format!(
            "Imported app '{}' as class {}.",
            entry.app_id, entry.class_name
        ))
    }
}

/// Generates and persists a new integration
pub struct GenerateAppTool {
    store: IntegrationStore,
    generator: Arc<dyn AppGenerator>,
    descriptor: ToolDescriptor,
}

impl GenerateAppTool {
    pub fn new(store: IntegrationStore, generator: Arc<dyn AppGenerator>) -> Self {
        Self {
            store,
            generator,
            descriptor: ToolDescriptor::function(
                "generate_app",
                "Generate a new app (a Python class wrapping a service's API) when no existing app fits. Describe the service and the operations needed.",
                json!({
                    "app_name": {
                        "type": "string",
                        "description": "Service name and the operations the app should support, e.g. 'Discord: send a message to a channel'."
                    }
                }),
            ),
        }
    }
}

#[async_trait]
impl Tool for GenerateAppTool {
    fn describe(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, arguments: Value) -> Result<String, ToolError> {
        let app_name = string_arg(&arguments, "app_name")?;
        let app = self.generator.generate(app_name).await?;
        let entry = self.store.save_app(&app)?;
        Ok(format!(
            "Generated app '{}' (class {}): {}. Use import_app to load it.",
            entry.app_id, entry.class_name, entry.description
        ))
    }
}
