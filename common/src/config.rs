use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_fallback_models() -> Vec<String> {
    Vec::new()
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embedding_dimensions() -> u32 {
    1536
}
fn default_similarity_threshold() -> f32 {
    0.85
}
fn default_top_k_candidates() -> usize {
    5
}
fn default_property_sample_limit() -> usize {
    10
}
fn default_namespace() -> String {
    "graphrag".to_string()
}
fn default_database() -> String {
    "graphrag".to_string()
}

/// Application configuration, loaded from an optional `config.toml`/`config.yaml`
/// plus environment overrides. Field names are internal; the `alias`es accept
/// the `NEO4J_*` environment variable names older deployments exported, since
/// the concrete graph store underneath is an implementation detail.
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(alias = "neo4j_uri")]
    pub graph_store_address: String,
    #[serde(alias = "neo4j_user")]
    pub graph_store_username: String,
    #[serde(alias = "neo4j_password")]
    pub graph_store_password: String,
    #[serde(default = "default_namespace")]
    pub graph_store_namespace: String,
    #[serde(alias = "neo4j_database", default = "default_database")]
    pub graph_store_database: String,

    #[serde(alias = "openai_api_key")]
    pub llm_api_key: String,
    #[serde(alias = "openai_base_url", default = "default_llm_base_url")]
    pub llm_base_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    /// Models tried in order after `llm_model` when a generative call times
    /// out or errors.
    #[serde(default = "default_llm_fallback_models")]
    pub llm_fallback_models: Vec<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_top_k_candidates")]
    pub top_k_candidates: usize,
    #[serde(default = "default_property_sample_limit")]
    pub property_value_sample_limit: usize,
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
