//! Agent facade: wires the runtime, model, integrations and tools together

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info};

use super::controller::{AgentController, AgentError, AgentResult, AgentState};
use super::planner::Planner;
use crate::config::AppConfig;
use crate::integrations::{AppGenerator, IntegrationStore, ModelAppGenerator};
use crate::llm::{ConversationMessage, ModelClient, ResponsesClient};
use crate::runtime::{ExecutionRuntime, SharedRuntime};
use crate::tools::{ExecuteCodeTool, GenerateAppTool, ImportAppTool, ListAppsTool, ToolRegistry};

/// Build the standard tool set: `execute_code`, `generate_app`,
/// `list_apps`, `import_app`
pub fn build_registry(
    runtime: SharedRuntime,
    store: IntegrationStore,
    generator: Arc<dyn AppGenerator>,
) -> Result<ToolRegistry, AgentError> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ExecuteCodeTool::new(runtime.clone())))?;
    registry.register(Arc::new(GenerateAppTool::new(store.clone(), generator)))?;
    registry.register(Arc::new(ListAppsTool::new(store.clone())))?;
    registry.register(Arc::new(ImportAppTool::new(store, runtime)))?;
    Ok(registry)
}

/// A planning + execution agent over one live runtime
pub struct Agent {
    state: AgentState,
    planner: Planner,
    controller: AgentController,
    runtime: Option<SharedRuntime>,
    transcript: Vec<ConversationMessage>,
    model_name: String,
}

impl Agent {
    /// Provision the runtime, start the kernel and register the tools
    ///
    /// Any failure here is terminal for the agent.
    pub async fn start(config: &AppConfig) -> Result<Self, AgentError> {
        let result = Self::try_start(config).await;
        if let Err(e) = &result {
            let state = AgentState::Failed(e.to_string());
            error!(state = ?state, "Agent failed to start");
        }
        result
    }

    async fn try_start(config: &AppConfig) -> Result<Self, AgentError> {
        let api_key = config.api_key()?;
        let timeout = Duration::from_secs(config.model.request_timeout_secs);

        let model: Arc<dyn ModelClient> = Arc::new(
            ResponsesClient::new(api_key, &config.model.model)
                .with_base_url(&config.model.base_url)
                .with_timeout(timeout),
        );
        let generator_model: Arc<dyn ModelClient> = Arc::new(
            ResponsesClient::new(api_key, &config.model.generator_model)
                .with_base_url(&config.model.base_url)
                .with_timeout(timeout),
        );

        let runtime = ExecutionRuntime::start(config.runtime.clone()).await?;
        let runtime: SharedRuntime = Arc::new(Mutex::new(runtime));

        let store = IntegrationStore::new(&config.apps.dir);
        let generator: Arc<dyn AppGenerator> = Arc::new(ModelAppGenerator::new(generator_model));
        let registry = build_registry(runtime.clone(), store, generator)?;

        info!(
            model = %config.model.model,
            tools = registry.len(),
            apps_dir = %config.apps.dir.display(),
            "Agent ready"
        );

        let mut agent = Self::from_parts(model, Arc::new(registry), config.agent.clone());
        agent.runtime = Some(runtime);
        Ok(agent)
    }

    /// Assemble an agent from already-built parts (no runtime attached)
    pub fn from_parts(
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        config: super::AgentConfig,
    ) -> Self {
        let model_name = model.model_name().to_string();
        Self {
            state: AgentState::Planning,
            planner: Planner::new(model.clone()),
            controller: AgentController::new(model, tools, config),
            runtime: None,
            transcript: Vec::new(),
            model_name,
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn plan(&self) -> &str {
        self.planner.plan()
    }

    pub fn runtime(&self) -> Option<&SharedRuntime> {
        self.runtime.as_ref()
    }

    /// Transcript of the latest execution phase
    pub fn transcript(&self) -> &[ConversationMessage] {
        &self.transcript
    }

    pub async fn generate_plan(&mut self, task: &str) -> Result<&str, AgentError> {
        self.state = AgentState::Planning;
        self.planner.generate_plan(task).await
    }

    pub async fn revise_plan(&mut self, feedback: &str) -> Result<&str, AgentError> {
        self.state = AgentState::Planning;
        self.planner.revise_plan(feedback).await
    }

    pub fn set_plan(&mut self, plan: impl Into<String>) {
        self.planner.set_plan(plan);
    }

    /// Execute the current plan until the model signals completion
    pub async fn execute(&mut self) -> Result<AgentResult, AgentError> {
        if self.planner.plan().trim().is_empty() {
            return Err(AgentError::NoPlan);
        }
        self.state = AgentState::Executing;
        self.transcript = AgentController::seed_transcript(self.planner.plan());

        match self.controller.execute(&mut self.transcript).await {
            Ok(result) => {
                self.state = AgentState::Done;
                Ok(result)
            }
            Err(e) => {
                self.state = AgentState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Shut the kernel down; repeated calls are no-ops
    pub async fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.lock().await.shutdown().await;
        }
    }
}
