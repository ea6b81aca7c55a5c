//! The structured generation capability consumed by the pipeline.
//!
//! A [`GenerationCapability`] turns `(task name, structured input, output
//! schema)` into a raw JSON value. It does not validate the value against the
//! schema; that happens at the stage boundary in [`super::GenerationClient`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::litellm::{GenerationRequest, LlmProvider, Message};
use crate::artifacts::ArtifactKind;
use crate::error::LlmError;
use crate::utils::json_extraction::extract_json_value;

/// One schema-constrained generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationCall {
    /// Name of the task issuing the call, for logs and metrics.
    pub task_name: String,
    /// Task-specific system instructions.
    pub instructions: String,
    /// Structured input. Strings are sent verbatim, anything else as JSON.
    pub input: Value,
    /// Schema the output must conform to.
    pub output: ArtifactKind,
}

impl GenerationCall {
    pub fn new(
        task_name: impl Into<String>,
        instructions: impl Into<String>,
        input: Value,
        output: ArtifactKind,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            instructions: instructions.into(),
            input,
            output,
        }
    }

    /// Renders the input as the user message.
    pub fn render_input(&self) -> String {
        match &self.input {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

/// External generation service.
///
/// Errors must be classified so that [`LlmError::is_transient`] separates
/// retryable failures from terminal ones.
#[async_trait]
pub trait GenerationCapability: Send + Sync {
    async fn generate(&self, call: &GenerationCall) -> Result<Value, LlmError>;
}

/// [`GenerationCapability`] backed by a chat-completions provider.
pub struct LlmGenerationCapability {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: f64,
}

impl LlmGenerationCapability {
    /// Uses the provider's default model.
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            model: String::new(),
            temperature: 0.7,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_request(&self, call: &GenerationCall) -> GenerationRequest {
        let system = format!(
            "{}\n\nRespond with a single JSON object and nothing else. Required shape:\n{}",
            call.instructions.trim(),
            call.output.schema_hint()
        );
        GenerationRequest::new(
            self.model.clone(),
            vec![Message::system(system), Message::user(call.render_input())],
        )
        .with_temperature(self.temperature)
        .with_json_mode()
    }
}

#[async_trait]
impl GenerationCapability for LlmGenerationCapability {
    async fn generate(&self, call: &GenerationCall) -> Result<Value, LlmError> {
        let response = self.provider.generate(self.build_request(call)).await?;

        let content = response
            .first_content()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::ParseError("No content in LLM response".to_string()))?;

        extract_json_value(content).map_err(|e| LlmError::ParseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::litellm::{Choice, GenerationResponse, Usage};
    use serde_json::json;
    use std::sync::Mutex;

    struct MockLlmProvider {
        response: String,
        last_request: Mutex<Option<GenerationRequest>>,
    }

    impl MockLlmProvider {
        fn new(response: impl Into<String>) -> Self {
            Self {
                response: response.into(),
                last_request: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlmProvider {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            *self.last_request.lock().expect("lock poisoned") = Some(request);
            Ok(GenerationResponse {
                id: "test-id".to_string(),
                model: "test-model".to_string(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(self.response.clone()),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_extracts_json_and_sends_schema_hint() {
        let provider = Arc::new(MockLlmProvider::new(
            "```json\n{\"text\": \"The dragon was lonely.\"}\n```",
        ));
        let capability = LlmGenerationCapability::new(provider.clone()).with_temperature(0.2);

        let call = GenerationCall::new(
            "story_guide",
            "Answer questions about the story.",
            json!("Why was the dragon sad?"),
            ArtifactKind::Answer,
        );
        let value = capability.generate(&call).await.expect("generate");
        assert_eq!(value, json!({"text": "The dragon was lonely."}));

        let request = provider
            .last_request
            .lock()
            .expect("lock poisoned")
            .clone()
            .expect("request captured");
        assert!(request.json_mode);
        assert_eq!(request.temperature, Some(0.2));
        assert!(request.messages[0].content.contains(r#"{"text": <string>}"#));
        assert_eq!(request.messages[1].content, "Why was the dragon sad?");
    }

    #[tokio::test]
    async fn test_non_json_reply_is_terminal() {
        let provider = Arc::new(MockLlmProvider::new("APPROVED"));
        let capability = LlmGenerationCapability::new(provider);
        let call = GenerationCall::new("quality_critic", "", json!({}), ArtifactKind::Critique);

        let err = capability.generate(&call).await.expect_err("no json");
        assert!(matches!(err, LlmError::ParseError(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_render_structured_input() {
        let call = GenerationCall::new(
            "worldbuilder",
            "",
            json!({"intent": {"age": 7}}),
            ArtifactKind::World,
        );
        assert!(call.render_input().contains("\"age\": 7"));
    }
}
