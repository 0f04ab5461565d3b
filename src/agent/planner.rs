//! Planning phase: produce and revise a free-text plan

use std::sync::Arc;

use tracing::{info, info_span, Instrument};

use super::prompts::{planning_user, revise_plan_user};
use super::AgentError;
use crate::llm::{ConversationMessage, ModelClient, ModelTurn, COMPLETION_TOKEN};

/// Holds the planning conversation and the current plan
pub struct Planner {
    model: Arc<dyn ModelClient>,
    messages: Vec<ConversationMessage>,
    plan: String,
}

impl Planner {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self {
            model,
            messages: Vec::new(),
            plan: String::new(),
        }
    }

    pub fn plan(&self) -> &str {
        &self.plan
    }

    /// Use a plan written elsewhere (e.g. passed on the command line)
    pub fn set_plan(&mut self, plan: impl Into<String>) {
        self.plan = plan.into();
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// Start a fresh planning conversation for `task`
    pub async fn generate_plan(&mut self, task: &str) -> Result<&str, AgentError> {
        self.messages = vec![ConversationMessage::user(planning_user(task))];
        self.ask().instrument(info_span!("agent.plan", otel.name = "agent.plan")).await?;
        info!(plan_len = self.plan.len(), "Plan generated");
        Ok(&self.plan)
    }

    /// Revise the current plan with user feedback
    pub async fn revise_plan(&mut self, feedback: &str) -> Result<&str, AgentError> {
        self.messages
            .push(ConversationMessage::user(revise_plan_user(&self.plan, feedback)));
        self.ask()
            .instrument(info_span!("agent.revise_plan", otel.name = "agent.revise_plan"))
            .await?;
        info!(plan_len = self.plan.len(), "Plan revised");
        Ok(&self.plan)
    }

    async fn ask(&mut self) -> Result<(), AgentError> {
        let text = match self.model.respond(&self.messages, &[]).await? {
            ModelTurn::Message(text) => text,
            ModelTurn::Completion => COMPLETION_TOKEN.to_string(),
            ModelTurn::FunctionCall(call) => {
                return Err(AgentError::UnexpectedTurn(format!(
                    "function call `{}` while planning",
                    call.name
                )))
            }
        };
        self.plan = text;
        self.messages.push(ConversationMessage::assistant(self.plan.clone()));
        Ok(())
    }
}
