//! Agent Controller - the tool-orchestration loop
//!
//! The loop is a small state machine:
//!
//! ```text
//!            ┌──────────── message: append assistant text ───────────┐
//!            │                                                        │
//!            ▼           function call                                │
//!  ──► Executing ─────────────────────────► ToolDispatch ─────────────┤
//!        │   │                               (unknown tool → notice,  │
//!        │   │ model error: diagnostic,       known → call + result)  │
//!        │   └── backoff, retry (bounded) ────────────────────────────┘
//!        │
//!        └── completion token ──► Done
//! ```
//!
//! One model call or tool call is outstanding at a time and the transcript
//! is append-only.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::prompts::{execution_developer, model_failure_user};
use crate::config::ConfigError;
use crate::llm::{ConversationMessage, FunctionCall, ModelClient, ModelError, ModelTurn};
use crate::metrics::{AGENT_ITERATIONS, AGENT_RUNS, MODEL_FAILURES, TOOL_CALLS};
use crate::runtime::RuntimeError;
use crate::tools::{ToolError, ToolRegistry};

/// Configuration for the agent loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Consecutive failed model turns tolerated before giving up
    pub max_model_retries: u32,
    /// Backoff after the first failure, doubled for each further one
    pub retry_base_delay_ms: u64,
    /// Upper bound for the backoff
    pub retry_max_delay_ms: u64,
    /// Cap on model turns per run (unbounded when None)
    pub max_iterations: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_model_retries: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            max_iterations: None,
        }
    }
}

impl AgentConfig {
    /// Backoff before retrying after `failures` consecutive failures
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u64.checked_shl(failures.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

/// Where the agent is in its lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum AgentState {
    Planning,
    Executing,
    ToolDispatch(FunctionCall),
    Done,
    Failed(String),
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Done | AgentState::Failed(_))
    }
}

/// Position of the execution loop; the loop itself never fails into a
/// state, it returns an `AgentError` instead
enum Step {
    Executing,
    ToolDispatch(FunctionCall),
    Done,
}

/// Result of a finished execution phase
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Model turns taken
    pub iterations: usize,
    /// Tool calls dispatched to a registered tool
    pub tool_calls_made: usize,
    /// Last plain assistant message, if any
    pub last_message: Option<String>,
    /// Unique trace ID for this agent run
    pub trace_id: String,
}

/// Error type for agent operations
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("model failed {attempts} times in a row, last error: {last_error}")]
    ModelRetriesExhausted { attempts: u32, last_error: String },
    #[error("maximum iterations reached ({0})")]
    MaxIterationsReached(usize),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("unexpected model turn: {0}")]
    UnexpectedTurn(String),
    #[error("agent failed to start: {0}")]
    Startup(#[from] RuntimeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("tool registration failed: {0}")]
    Tool(#[from] ToolError),
    #[error("no plan to execute")]
    NoPlan,
}

/// Agent Controller driving the model and the tool registry
pub struct AgentController {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    config: AgentConfig,
}

impl AgentController {
    /// Create a new agent controller
    ///
    /// # Arguments
    /// * `model` - Model adapter that takes one turn at a time
    /// * `tools` - Registry the model's function calls are dispatched to
    /// * `config` - Retry and iteration bounds
    pub fn new(model: Arc<dyn ModelClient>, tools: Arc<ToolRegistry>, config: AgentConfig) -> Self {
        Self { model, tools, config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Transcript seeded with the developer instruction for `plan`
    pub fn seed_transcript(plan: &str) -> Vec<ConversationMessage> {
        vec![ConversationMessage::developer(execution_developer(plan))]
    }

    /// Execute an approved plan from a fresh transcript
    pub async fn run(&self, plan: &str) -> Result<(AgentResult, Vec<ConversationMessage>), AgentError> {
        let mut transcript = Self::seed_transcript(plan);
        let result = self.execute(&mut transcript).await?;
        Ok((result, transcript))
    }

    /// Drive the loop until the model signals completion
    ///
    /// Messages are only ever appended to `transcript`, so the caller keeps
    /// a complete record even when this returns an error.
    pub async fn execute(&self, transcript: &mut Vec<ConversationMessage>) -> Result<AgentResult, AgentError> {
        let trace_id = Uuid::now_v7().to_string();
        let root_span = info_span!(
            "agent_task",
            trace_id = %trace_id,
            model = %self.model.model_name(),
            otel.name = "agent_task"
        );

        async {
            info!(trace_id = %trace_id, tools = self.tools.len(), "Starting agent execution");

            let descriptors = self.tools.descriptors();
            let mut state = Step::Executing;
            let mut iterations = 0usize;
            let mut tool_calls_made = 0usize;
            let mut failures = 0u32;
            let mut last_message = None;

            loop {
                state = match state {
                    Step::Executing => {
                        if let Some(max) = self.config.max_iterations {
                            if iterations >= max {
                                warn!(trace_id = %trace_id, iterations, "Max iterations reached");
                                AGENT_RUNS.with_label_values(&["max_iterations"]).inc();
                                return Err(AgentError::MaxIterationsReached(max));
                            }
                        }
                        iterations += 1;
                        AGENT_ITERATIONS.inc();

                        let llm_span = info_span!(
                            "llm_call",
                            trace_id = %trace_id,
                            iteration = iterations,
                            otel.name = "llm_call"
                        );
                        let turn = self
                            .model
                            .respond(transcript, &descriptors)
                            .instrument(llm_span)
                            .await;

                        match turn {
                            Ok(ModelTurn::Completion) => {
                                failures = 0;
                                Step::Done
                            }
                            Ok(ModelTurn::Message(text)) => {
                                failures = 0;
                                debug!(trace_id = %trace_id, len = text.len(), "Assistant message");
                                transcript.push(ConversationMessage::assistant(text.clone()));
                                last_message = Some(text);
                                Step::Executing
                            }
                            // failures reset only once the arguments parse
                            Ok(ModelTurn::FunctionCall(call)) => Step::ToolDispatch(call),
                            Err(e) => {
                                self.record_failure(transcript, &mut failures, e.to_string()).await?;
                                Step::Executing
                            }
                        }
                    }

                    Step::ToolDispatch(call) => {
                        let arguments = match call.parse_arguments() {
                            Ok(arguments) => arguments,
                            Err(e) => {
                                let error = format!("invalid arguments for `{}`: {}", call.name, e);
                                self.record_failure(transcript, &mut failures, error).await?;
                                state = Step::Executing;
                                continue;
                            }
                        };
                        failures = 0;

                        if !self.tools.contains(&call.name) {
                            warn!(trace_id = %trace_id, tool = %call.name, "Model called an unknown tool");
                            TOOL_CALLS.with_label_values(&[call.name.as_str(), "unknown"]).inc();
                            transcript.push(ConversationMessage::user(
                                ToolError::UnknownTool(call.name.clone()).to_string(),
                            ));
                            state = Step::Executing;
                            continue;
                        }

                        tool_calls_made += 1;
                        info!(trace_id = %trace_id, tool = %call.name, call_id = %call.call_id, "Dispatching tool call");
                        transcript.push(ConversationMessage::ToolCall(call.clone()));

                        let output = match self.tools.dispatch(&call.name, arguments).await {
                            Ok(output) => output,
                            Err(e) => e.to_string(),
                        };
                        transcript.push(ConversationMessage::tool_result(call.call_id, output));
                        Step::Executing
                    }

                    Step::Done => {
                        info!(trace_id = %trace_id, iterations, tool_calls = tool_calls_made, "Agent task completed");
                        AGENT_RUNS.with_label_values(&["done"]).inc();
                        return Ok(AgentResult {
                            iterations,
                            tool_calls_made,
                            last_message,
                            trace_id: trace_id.clone(),
                        });
                    }
                };
            }
        }
        .instrument(root_span)
        .await
    }

    /// Note a failed turn in the transcript and back off before retrying
    ///
    /// Returns an error once the retry budget is spent.
    async fn record_failure(
        &self,
        transcript: &mut Vec<ConversationMessage>,
        failures: &mut u32,
        error: String,
    ) -> Result<(), AgentError> {
        *failures += 1;
        MODEL_FAILURES.inc();
        warn!(failures = *failures, error = %error, "Model turn failed");
        transcript.push(ConversationMessage::user(model_failure_user(&error)));

        if *failures > self.config.max_model_retries {
            AGENT_RUNS.with_label_values(&["model_retries_exhausted"]).inc();
            return Err(AgentError::ModelRetriesExhausted {
                attempts: *failures,
                last_error: error,
            });
        }

        let delay = self.config.backoff(*failures);
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
