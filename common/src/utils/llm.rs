use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::{config::AppConfig, error::GraphRagError, usage::UsageTotals};

/// Typed-output chat agent with a model fallback chain. Every call forces a
/// JSON-schema response format and deserializes straight into the caller's
/// type; when the primary model times out or errors, the next model in the
/// chain is tried before the error surfaces.
pub struct LlmAgent {
    client: Client<OpenAIConfig>,
    models: Vec<String>,
    timeout: Duration,
}

impl LlmAgent {
    pub fn new(client: Client<OpenAIConfig>, models: Vec<String>, timeout: Duration) -> Self {
        Self { client, models, timeout }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_base_url);
        let mut models = vec![config.llm_model.clone()];
        models.extend(config.llm_fallback_models.iter().cloned());
        Self::new(
            Client::with_config(openai_config),
            models,
            Duration::from_secs(config.llm_timeout_secs),
        )
    }

    /// Runs one structured-output completion, walking the model chain on
    /// failure. Parse failures of a model's output count as that model
    /// failing, so a flaky model can be rescued by its fallback.
    pub async fn generate_typed<T: DeserializeOwned>(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<(T, UsageTotals), GraphRagError> {
        let mut usage = UsageTotals::default();
        let mut last_error = GraphRagError::LlmParsing(format!("no models configured for {schema_name}"));

        for model in &self.models {
            match self
                .generate_with_model::<T>(model, system_prompt, user_prompt, schema_name, schema.clone())
                .await
            {
                Ok((value, call_usage)) => {
                    usage += call_usage;
                    return Ok((value, usage));
                }
                Err((err, call_usage)) => {
                    usage += call_usage;
                    warn!(model = %model, schema = schema_name, error = %err, "model failed, trying next in chain");
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    async fn generate_with_model<T: DeserializeOwned>(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<(T, UsageTotals), (GraphRagError, UsageTotals)> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system_prompt)
                    .build()
                    .map_err(|e| (GraphRagError::Llm(e), UsageTotals::default()))?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user_prompt)
                    .build()
                    .map_err(|e| (GraphRagError::Llm(e), UsageTotals::default()))?
                    .into(),
            ])
            .response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    name: schema_name.to_string(),
                    description: None,
                    schema: Some(schema),
                    strict: Some(true),
                },
            })
            .build()
            .map_err(|e| (GraphRagError::Llm(e), UsageTotals::default()))?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| {
                (
                    GraphRagError::LlmParsing(format!("{schema_name}: call timed out after {:?}", self.timeout)),
                    UsageTotals::default(),
                )
            })?
            .map_err(|e| (GraphRagError::Llm(e), UsageTotals::default()))?;

        let call_usage = response
            .usage
            .as_ref()
            .map(|u| UsageTotals::generative(u64::from(u.prompt_tokens), u64::from(u.completion_tokens)))
            .unwrap_or_default();

        let content = match response.choices.first().and_then(|choice| choice.message.content.clone()) {
            Some(content) => content,
            None => {
                return Err((
                    GraphRagError::LlmParsing(format!("{schema_name}: empty response")),
                    call_usage,
                ))
            }
        };

        match serde_json::from_str::<T>(&content) {
            Ok(value) => Ok((value, call_usage)),
            Err(err) => Err((
                GraphRagError::LlmParsing(format!("{schema_name}: {err}")),
                call_usage,
            )),
        }
    }
}
