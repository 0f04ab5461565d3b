//! `execute_code` - run Python in the shared kernel

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolDescriptor, ToolError};
use crate::kernel::render_events;
use crate::runtime::SharedRuntime;

pub struct ExecuteCodeTool {
    runtime: SharedRuntime,
    descriptor: ToolDescriptor,
}

impl ExecuteCodeTool {
    pub fn new(runtime: SharedRuntime) -> Self {
        Self {
            runtime,
            descriptor: ToolDescriptor::function(
                "execute_code",
                "Execute Python code in a Jupyter kernel. The same kernel is kept across all calls, so variables, imports and imported apps persist.",
                json!({
                    "code": {
                        "type": "string",
                        "description": "Python code to execute."
                    }
                }),
            ),
        }
    }
}

#[async_trait]
impl Tool for ExecuteCodeTool {
    fn describe(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, arguments: Value) -> Result<String, ToolError> {
        let code = arguments["code"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("`code` must be a string".to_string()))?;

        let events = self.runtime.lock().await.execute(code).await?;
        Ok(render_events(&events))
    }
}
