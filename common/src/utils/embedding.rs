use std::time::Duration;

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;
use tracing::debug;

use crate::{
    config::AppConfig,
    error::GraphRagError,
    usage::UsageTotals,
};

/// Text-to-vector provider. The graph only ever sees this trait, so tests
/// and alternative providers can swap in without touching the pipelines.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds a batch of inputs, preserving order. Returns one vector per
    /// input plus the token usage of the call.
    async fn embed_batch(&self, inputs: &[String]) -> Result<(Vec<Vec<f32>>, UsageTotals), GraphRagError>;

    /// The dimension every returned vector has. Vector indexes are declared
    /// with this value; a mismatch is a configuration error, not something
    /// to truncate around.
    fn dimension(&self) -> usize;

    async fn embed(&self, input: &str) -> Result<(Vec<f32>, UsageTotals), GraphRagError> {
        let (mut vectors, usage) = self.embed_batch(&[input.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| GraphRagError::Embedding("no embedding data received".into()))?;
        Ok((vector, usage))
    }
}

/// OpenAI-compatible embedding provider.
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    dimensions: u32,
    timeout: Duration,
}

impl OpenAiEmbedder {
    pub fn new(client: Client<OpenAIConfig>, model: String, dimensions: u32, timeout: Duration) -> Self {
        Self { client, model, dimensions, timeout }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_base_url);
        Self::new(
            Client::with_config(openai_config),
            config.embedding_model.clone(),
            config.embedding_dimensions,
            Duration::from_secs(config.llm_timeout_secs),
        )
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed_batch(&self, inputs: &[String]) -> Result<(Vec<Vec<f32>>, UsageTotals), GraphRagError> {
        if inputs.is_empty() {
            return Ok((Vec::new(), UsageTotals::default()));
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .dimensions(self.dimensions)
            .input(inputs.to_vec())
            .build()
            .map_err(GraphRagError::Llm)?;

        let response = tokio::time::timeout(self.timeout, self.client.embeddings().create(request))
            .await
            .map_err(|_| GraphRagError::Embedding(format!("embedding call timed out after {:?}", self.timeout)))?
            .map_err(GraphRagError::Llm)?;

        let usage = UsageTotals::embedding(u64::from(response.usage.prompt_tokens));

        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();

        if vectors.len() != inputs.len() {
            return Err(GraphRagError::Embedding(format!(
                "expected {} embeddings, received {}",
                inputs.len(),
                vectors.len()
            )));
        }
        for vector in &vectors {
            if vector.len() != self.dimension() {
                return Err(GraphRagError::Embedding(format!(
                    "embedding dimension {} does not match configured dimension {}",
                    vector.len(),
                    self.dimension()
                )));
            }
        }

        debug!(count = vectors.len(), dimensions = self.dimension(), "generated embeddings");
        Ok((vectors, usage))
    }

    fn dimension(&self) -> usize {
        self.dimensions as usize
    }
}
