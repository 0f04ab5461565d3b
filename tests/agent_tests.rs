//! Integration tests for the agent loop
//!
//! The model is scripted and the tools are fakes, so these run without a
//! model provider or a Python interpreter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use cellpilot::agent::{Agent, AgentConfig, AgentController, AgentError, AgentState};
use cellpilot::llm::{ConversationMessage, FunctionCall, ModelClient, ModelError, ModelTurn};
use cellpilot::tools::{Tool, ToolDescriptor, ToolError, ToolRegistry};

/// Model that replays a fixed list of turns and records what it was sent
struct ScriptedModel {
    turns: Mutex<VecDeque<Result<ModelTurn, ModelError>>>,
    seen: Mutex<Vec<Vec<ConversationMessage>>>,
}

impl ScriptedModel {
    fn new(turns: Vec<Result<ModelTurn, ModelError>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn respond(
        &self,
        transcript: &[ConversationMessage],
        _tools: &[ToolDescriptor],
    ) -> Result<ModelTurn, ModelError> {
        self.seen.lock().unwrap().push(transcript.to_vec());
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(ModelTurn::Completion))
    }
}

/// Tool that adds two integers
struct AddTool {
    descriptor: ToolDescriptor,
}

impl AddTool {
    fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::function(
                "add",
                "Add two integers.",
                json!({
                    "a": {"type": "integer", "description": "first"},
                    "b": {"type": "integer", "description": "second"}
                }),
            ),
        }
    }
}

#[async_trait]
impl Tool for AddTool {
    fn describe(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, arguments: Value) -> Result<String, ToolError> {
        let a = arguments["a"].as_i64().unwrap_or_default();
        let b = arguments["b"].as_i64().unwrap_or_default();
        Ok((a + b).to_string())
    }
}

/// Tool that always fails
struct BrokenTool {
    descriptor: ToolDescriptor,
}

#[async_trait]
impl Tool for BrokenTool {
    fn describe(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _arguments: Value) -> Result<String, ToolError> {
        Err(ToolError::Execution("disk on fire".to_string()))
    }
}

fn registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(AddTool::new())).unwrap();
    registry
        .register(Arc::new(BrokenTool {
            descriptor: ToolDescriptor::function("broken", "Always fails.", json!({})),
        }))
        .unwrap();
    Arc::new(registry)
}

fn fast_config() -> AgentConfig {
    AgentConfig {
        max_model_retries: 3,
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
        max_iterations: None,
    }
}

fn call(call_id: &str, name: &str, arguments: &str) -> Result<ModelTurn, ModelError> {
    Ok(ModelTurn::FunctionCall(FunctionCall {
        call_id: call_id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }))
}

#[tokio::test]
async fn test_completion_token_ends_run() {
    let model = ScriptedModel::new(vec![Ok(ModelTurn::Completion)]);
    let controller = AgentController::new(model.clone(), registry(), fast_config());

    let (result, transcript) = controller.run("say hi").await.unwrap();

    assert_eq!(result.iterations, 1);
    assert_eq!(result.tool_calls_made, 0);
    assert_eq!(transcript.len(), 1);
    assert!(matches!(&transcript[0], ConversationMessage::Developer { content } if content.ends_with("\nPlan: say hi")));
}

#[tokio::test]
async fn test_tool_result_correlated_by_call_id() {
    let model = ScriptedModel::new(vec![
        call("call_7", "add", r#"{"a": 2, "b": 3}"#),
        Ok(ModelTurn::Completion),
    ]);
    let controller = AgentController::new(model.clone(), registry(), fast_config());

    let (result, transcript) = controller.run("add numbers").await.unwrap();

    assert_eq!(result.tool_calls_made, 1);
    assert_eq!(transcript.len(), 3);
    assert!(matches!(&transcript[1], ConversationMessage::ToolCall(c) if c.call_id == "call_7" && c.name == "add"));
    assert_eq!(transcript[2], ConversationMessage::tool_result("call_7", "5"));

    // The second model turn saw the tool result
    let seen = model.seen.lock().unwrap();
    assert_eq!(seen[1].len(), 3);
}

#[tokio::test]
async fn test_unknown_tool_is_recoverable() {
    let model = ScriptedModel::new(vec![call("c1", "format_disk", "{}"), Ok(ModelTurn::Completion)]);
    let controller = AgentController::new(model.clone(), registry(), fast_config());

    let (result, transcript) = controller.run("plan").await.unwrap();

    assert_eq!(result.tool_calls_made, 0);
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1], ConversationMessage::user("Unknown tool Error: format_disk"));
    assert_eq!(model.calls(), 2);
}

#[tokio::test]
async fn test_plain_message_appended_as_assistant() {
    let model = ScriptedModel::new(vec![
        Ok(ModelTurn::Message("Working on it".to_string())),
        Ok(ModelTurn::Completion),
    ]);
    let controller = AgentController::new(model, registry(), fast_config());

    let (result, transcript) = controller.run("plan").await.unwrap();

    assert_eq!(transcript[1], ConversationMessage::assistant("Working on it"));
    assert_eq!(result.last_message.as_deref(), Some("Working on it"));
    assert_eq!(result.iterations, 2);
}

#[tokio::test]
async fn test_tool_failure_becomes_result_text() {
    let model = ScriptedModel::new(vec![call("c9", "broken", "{}"), Ok(ModelTurn::Completion)]);
    let controller = AgentController::new(model, registry(), fast_config());

    let (_, transcript) = controller.run("plan").await.unwrap();

    assert_eq!(transcript[2], ConversationMessage::tool_result("c9", "Error: disk on fire"));
}

#[tokio::test]
async fn test_invalid_arguments_rendered_not_raised() {
    let model = ScriptedModel::new(vec![
        call("c1", "add", r#"{"a": "two", "b": 3}"#),
        Ok(ModelTurn::Completion),
    ]);
    let controller = AgentController::new(model, registry(), fast_config());

    let (_, transcript) = controller.run("plan").await.unwrap();

    match &transcript[2] {
        ConversationMessage::ToolResult { call_id, output } => {
            assert_eq!(call_id, "c1");
            assert!(output.starts_with("Invalid arguments:"), "got {output}");
        }
        other => panic!("expected a tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_json_arguments_retry_with_diagnostic() {
    let model = ScriptedModel::new(vec![call("c1", "add", "{not json"), Ok(ModelTurn::Completion)]);
    let controller = AgentController::new(model.clone(), registry(), fast_config());

    let (result, transcript) = controller.run("plan").await.unwrap();

    assert_eq!(result.tool_calls_made, 0);
    assert_eq!(transcript.len(), 2);
    assert!(transcript[1]
        .text()
        .starts_with("An error occurred, please revise your function call and try again."));
    assert_eq!(model.calls(), 2);
}

#[tokio::test]
async fn test_repeated_malformed_arguments_exhaust_retries() {
    let turns = (0..50).map(|i| call(&format!("c{i}"), "add", "{not json")).collect();
    let model = ScriptedModel::new(turns);
    let controller = AgentController::new(model.clone(), registry(), fast_config());

    let err = controller.run("plan").await.unwrap_err();

    match err {
        AgentError::ModelRetriesExhausted { attempts, last_error } => {
            assert_eq!(attempts, 4);
            assert!(last_error.contains("invalid arguments for `add`"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(model.calls(), 4);
}

#[tokio::test]
async fn test_parsed_arguments_reset_failure_count() {
    let model = ScriptedModel::new(vec![
        call("c1", "add", "{not json"),
        call("c2", "add", "{not json"),
        call("c3", "add", "{not json"),
        call("c4", "add", r#"{"a": 1, "b": 1}"#),
        call("c5", "add", "{not json"),
        call("c6", "add", "{not json"),
        call("c7", "add", "{not json"),
        Ok(ModelTurn::Completion),
    ]);
    let controller = AgentController::new(model, registry(), fast_config());

    let (result, transcript) = controller.run("plan").await.unwrap();
    assert_eq!(result.iterations, 8);
    assert_eq!(result.tool_calls_made, 1);
    assert!(transcript.contains(&ConversationMessage::tool_result("c4", "2")));
}

#[tokio::test]
async fn test_model_errors_append_diagnostic_and_retry() {
    let model = ScriptedModel::new(vec![
        Err(ModelError::Malformed("no output".to_string())),
        Ok(ModelTurn::Completion),
    ]);
    let controller = AgentController::new(model.clone(), registry(), fast_config());

    let (result, transcript) = controller.run("plan").await.unwrap();

    assert_eq!(result.iterations, 2);
    assert_eq!(transcript.len(), 2);
    assert!(matches!(&transcript[1], ConversationMessage::User { content } if content.contains("no output")));
}

#[tokio::test]
async fn test_retries_exhausted() {
    let failures = (0..10)
        .map(|i| Err(ModelError::Malformed(format!("failure {i}"))))
        .collect();
    let model = ScriptedModel::new(failures);
    let controller = AgentController::new(model.clone(), registry(), fast_config());

    let mut transcript = AgentController::seed_transcript("plan");
    let err = controller.execute(&mut transcript).await.unwrap_err();

    match err {
        AgentError::ModelRetriesExhausted { attempts, last_error } => {
            assert_eq!(attempts, 4);
            assert!(last_error.contains("failure 3"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // One diagnostic per failed turn, kept even though the run failed
    assert_eq!(transcript.len(), 5);
    assert_eq!(model.calls(), 4);
}

#[tokio::test]
async fn test_success_resets_failure_count() {
    let model = ScriptedModel::new(vec![
        Err(ModelError::EmptyResponse),
        Err(ModelError::EmptyResponse),
        Err(ModelError::EmptyResponse),
        Ok(ModelTurn::Message("ok".to_string())),
        Err(ModelError::EmptyResponse),
        Err(ModelError::EmptyResponse),
        Err(ModelError::EmptyResponse),
        Ok(ModelTurn::Completion),
    ]);
    let controller = AgentController::new(model, registry(), fast_config());

    let (result, _) = controller.run("plan").await.unwrap();
    assert_eq!(result.iterations, 8);
}

#[tokio::test]
async fn test_max_iterations() {
    let turns = (0..10).map(|_| Ok(ModelTurn::Message("still going".to_string()))).collect();
    let config = AgentConfig {
        max_iterations: Some(3),
        ..fast_config()
    };
    let controller = AgentController::new(ScriptedModel::new(turns), registry(), config);

    let err = controller.run("plan").await.unwrap_err();
    assert!(matches!(err, AgentError::MaxIterationsReached(3)));
}

#[tokio::test]
async fn test_agent_plan_then_execute() {
    let model = ScriptedModel::new(vec![
        Ok(ModelTurn::Message("1. add".to_string())),
        Ok(ModelTurn::Message("1. add 2 and 3".to_string())),
        call("c1", "add", r#"{"a": 2, "b": 3}"#),
        Ok(ModelTurn::Completion),
    ]);
    let mut agent = Agent::from_parts(model.clone(), registry(), fast_config());
    assert_eq!(agent.state(), &AgentState::Planning);

    assert_eq!(agent.generate_plan("add numbers").await.unwrap(), "1. add");
    assert_eq!(agent.revise_plan("be specific").await.unwrap(), "1. add 2 and 3");

    let result = agent.execute().await.unwrap();
    assert_eq!(agent.state(), &AgentState::Done);
    assert_eq!(result.tool_calls_made, 1);
    assert!(agent.transcript()[0].text().ends_with("Plan: 1. add 2 and 3"));

    // The revision turn carried the previous plan and the feedback
    let seen = model.seen.lock().unwrap();
    assert_eq!(
        seen[1].last().unwrap().text(),
        "Plan: 1. add\nFeedback: be specific. Directly output the revised plan."
    );
}

#[tokio::test]
async fn test_agent_without_plan_refuses_to_execute() {
    let mut agent = Agent::from_parts(ScriptedModel::new(vec![]), registry(), fast_config());
    assert!(matches!(agent.execute().await, Err(AgentError::NoPlan)));
}

#[tokio::test]
async fn test_agent_failed_state_after_exhausted_retries() {
    let failures = (0..10).map(|_| Err(ModelError::EmptyResponse)).collect();
    let mut agent = Agent::from_parts(ScriptedModel::new(failures), registry(), fast_config());
    agent.set_plan("do it");

    assert!(agent.execute().await.is_err());
    assert!(matches!(agent.state(), AgentState::Failed(_)));
    assert!(agent.state().is_terminal());
}
