//! Integration code generation
//!
//! Asks a model to write a Python class wrapping some service's API. The
//! model answers with a JSON object that is then persisted through the
//! [`IntegrationStore`](super::IntegrationStore).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Instrument};

use super::inject::is_identifier;
use super::IntegrationError;
use crate::llm::{ConversationMessage, ModelClient, ModelTurn};

/// Model used for code generation unless configured otherwise
pub const DEFAULT_GENERATOR_MODEL: &str = "o4-mini";

/// Instructions given to the generating model
pub const GENERATOR_PROMPT: &str = r#"Write a Python class that uses the API of the service the user asks for.

Requirements:
- The class has a class attribute `app_id` holding a reverse-domain identifier, e.g. 'com.discord'.
- In __init__, read the API token and other settings from environment variables named after the app_id
  (e.g. COM_DISCORD_API_KEY). If something is missing, raise a ValueError explaining how to obtain it.
- Add one method per API operation the user asks for (send_message(), create_page(), ...).
- Prefer the Python standard library (urllib, http.client, json); avoid third-party packages.
- Set the headers the API needs (User-Agent, Content-Type, ...) and handle error responses.
- Document every method: parameters, return value and raised errors. Follow PEP 8.
- "Block" is a frontend term; it means the same thing as this class.

Reply with a single JSON object and nothing else:
{"app_id": "...", "class_name": "...", "description": "one sentence", "source": "<complete Python module>"}"#;

/// A generated integration, ready to persist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedApp {
    pub app_id: String,
    pub class_name: String,
    pub description: String,
    pub source: String,
}

impl GeneratedApp {
    /// Check the fields the rest of the system relies on
    pub fn validate(&self) -> Result<(), IntegrationError> {
        if self.app_id.trim().is_empty() {
            return Err(IntegrationError::InvalidApp("empty app_id".to_string()));
        }
        if !is_identifier(&self.class_name) {
            return Err(IntegrationError::InvalidApp(format!(
                "class name `{}` is not a Python identifier",
                self.class_name
            )));
        }
        if !self.source.contains(&format!("class {}", self.class_name)) {
            return Err(IntegrationError::InvalidApp(format!(
                "source does not define class {}",
                self.class_name
            )));
        }
        Ok(())
    }
}

/// Something that can produce an integration from a service name
#[async_trait]
pub trait AppGenerator: Send + Sync {
    async fn generate(&self, app_name: &str) -> Result<GeneratedApp, IntegrationError>;
}

/// Generator backed by any [`ModelClient`]
pub struct ModelAppGenerator {
    model: Arc<dyn ModelClient>,
}

impl ModelAppGenerator {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl AppGenerator for ModelAppGenerator {
    async fn generate(&self, app_name: &str) -> Result<GeneratedApp, IntegrationError> {
        let span = info_span!("app.generate", otel.name = "app.generate", app_name = %app_name);
        async move {
            let transcript = [
                ConversationMessage::developer(GENERATOR_PROMPT),
                ConversationMessage::user(app_name),
            ];
            let text = match self.model.respond(&transcript, &[]).await? {
                ModelTurn::Message(text) => text,
                other => {
                    return Err(IntegrationError::Generation(format!(
                        "expected a JSON reply, got {:?}",
                        other
                    )))
                }
            };

            let app = parse_generated(&text)?;
            app.validate()?;
            info!(app_id = %app.app_id, class = %app.class_name, "App generated");
            Ok(app)
        }
        .instrument(span)
        .await
    }
}

/// Parse the model's reply, tolerating a surrounding ```json fence
pub fn parse_generated(text: &str) -> Result<GeneratedApp, IntegrationError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body)
        .map_err(|e| IntegrationError::Generation(format!("reply is not the expected JSON object: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelError;
    use crate::tools::ToolDescriptor;

    struct CannedModel(String);

    #[async_trait]
    impl ModelClient for CannedModel {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn respond(
            &self,
            _transcript: &[ConversationMessage],
            tools: &[ToolDescriptor],
        ) -> Result<ModelTurn, ModelError> {
            assert!(tools.is_empty());
            Ok(ModelTurn::Message(self.0.clone()))
        }
    }

    #[test]
    fn test_parse_fenced_reply() {
        let reply = "```json\n{\"app_id\": \"com.line\", \"class_name\": \"Line\", \"description\": \"LINE Notify\", \"source\": \"class Line:\\n    pass\\n\"}\n```";
        let app = parse_generated(reply).unwrap();
        assert_eq!(app.class_name, "Line");
        assert!(app.validate().is_ok());
    }

    #[test]
    fn test_source_must_define_class() {
        let app = GeneratedApp {
            app_id: "com.x".into(),
            class_name: "X".into(),
            description: String::new(),
            source: "class Y: pass".into(),
        };
        assert!(matches!(app.validate(), Err(IntegrationError::InvalidApp(_))));
    }

    #[tokio::test]
    async fn test_model_generator() {
        let model = CannedModel(
            r#"{"app_id": "com.discord", "class_name": "Discord", "description": "Send messages", "source": "class Discord:\n    app_id = 'com.discord'\n"}"#
                .to_string(),
        );
        let app = ModelAppGenerator::new(Arc::new(model)).generate("discord").await.unwrap();
        assert_eq!(app.app_id, "com.discord");
    }

    #[tokio::test]
    async fn test_model_generator_rejects_prose() {
        let model = CannedModel("Sure! Here is your class.".to_string());
        let err = ModelAppGenerator::new(Arc::new(model)).generate("discord").await.unwrap_err();
        assert!(matches!(err, IntegrationError::Generation(_)));
    }
}
