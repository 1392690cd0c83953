use serde::{Deserialize, Serialize};

use common::storage::schema::FlaggedPropertiesConfig;

/// How one retrieval method finds candidates for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    /// BM25 full-text over the kind's indexed text fields.
    Keyword,
    /// Vector similarity over the kind's primary embedding.
    Semantic,
    /// Vector similarity over the name embedding (products).
    SemanticName,
    /// Vector similarity over the content embedding (products).
    SemanticContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reranker {
    #[default]
    ReciprocalRankFusion,
    None,
}

/// Per-kind knobs: which methods run, how many candidates each fetches,
/// similarity floors, and how the per-method lists fuse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindSearchConfig {
    pub search_methods: Vec<SearchMethod>,
    pub reranker: Reranker,
    /// Final number of results for this kind, unless `min_results` is
    /// higher and enough candidates exist.
    pub limit: usize,
    pub min_results: usize,
    pub keyword_fetch_limit: usize,
    pub semantic_fetch_limit: usize,
    pub semantic_name_fetch_limit: usize,
    pub semantic_content_fetch_limit: usize,
    pub min_similarity_score: f32,
    pub min_similarity_score_name: f32,
    pub min_similarity_score_content: f32,
    pub rrf_k: u32,
}

impl Default for KindSearchConfig {
    fn default() -> Self {
        Self {
            search_methods: vec![SearchMethod::Keyword, SearchMethod::Semantic],
            reranker: Reranker::ReciprocalRankFusion,
            limit: 10,
            min_results: 0,
            keyword_fetch_limit: 20,
            semantic_fetch_limit: 20,
            semantic_name_fetch_limit: 10,
            semantic_content_fetch_limit: 10,
            min_similarity_score: 0.7,
            min_similarity_score_name: 0.7,
            min_similarity_score_content: 0.65,
            rrf_k: 60,
        }
    }
}

impl KindSearchConfig {
    pub fn for_source() -> Self {
        Self { limit: 5, keyword_fetch_limit: 10, semantic_fetch_limit: 10, ..Self::default() }
    }

    pub fn for_product() -> Self {
        Self {
            search_methods: vec![SearchMethod::Keyword, SearchMethod::SemanticName, SearchMethod::SemanticContent],
            limit: 5,
            keyword_fetch_limit: 10,
            ..Self::default()
        }
    }

    /// The cap the final trimmed list honors for this kind.
    pub fn effective_limit(&self) -> usize {
        self.limit.max(self.min_results)
    }
}

/// Multi-query expansion: paraphrase the user query before fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiQueryConfig {
    pub enabled: bool,
    /// Whether the original query runs alongside the paraphrases.
    pub include_original_query: bool,
    pub max_alternative_questions: usize,
}

impl Default for MultiQueryConfig {
    fn default() -> Self {
        Self { enabled: false, include_original_query: true, max_alternative_questions: 3 }
    }
}

/// Schema-constrained query generation from the user question.
#[derive(Debug, Clone, Default)]
pub struct CypherSearchConfig {
    pub enabled: bool,
    pub flagged_properties: FlaggedPropertiesConfig,
}

/// The full search configuration tree: one optional config per kind (a
/// `None` disables the kind), plus the expansion and generated-query
/// add-ons and the overall cap.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub chunk_config: Option<KindSearchConfig>,
    pub entity_config: Option<KindSearchConfig>,
    pub relationship_config: Option<KindSearchConfig>,
    pub source_config: Option<KindSearchConfig>,
    pub product_config: Option<KindSearchConfig>,
    pub mention_config: Option<KindSearchConfig>,
    pub multi_query_config: Option<MultiQueryConfig>,
    pub cypher_search_config: Option<CypherSearchConfig>,
    pub overall_results_limit: Option<usize>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            chunk_config: Some(KindSearchConfig::default()),
            entity_config: Some(KindSearchConfig::default()),
            relationship_config: Some(KindSearchConfig::default()),
            source_config: Some(KindSearchConfig::for_source()),
            product_config: Some(KindSearchConfig::for_product()),
            mention_config: Some(KindSearchConfig::default()),
            multi_query_config: None,
            cypher_search_config: None,
            overall_results_limit: Some(10),
        }
    }
}

impl SearchConfig {
    pub fn kind_config(&self, kind: crate::kinds::SearchKind) -> Option<&KindSearchConfig> {
        use crate::kinds::SearchKind;
        match kind {
            SearchKind::Chunk => self.chunk_config.as_ref(),
            SearchKind::Entity => self.entity_config.as_ref(),
            SearchKind::Relationship => self.relationship_config.as_ref(),
            SearchKind::Source => self.source_config.as_ref(),
            SearchKind::Product => self.product_config.as_ref(),
            SearchKind::Mention => self.mention_config.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_limit_honors_min_results_override() {
        let config = KindSearchConfig { limit: 3, min_results: 8, ..KindSearchConfig::default() };
        assert_eq!(config.effective_limit(), 8);

        let config = KindSearchConfig { limit: 10, min_results: 2, ..KindSearchConfig::default() };
        assert_eq!(config.effective_limit(), 10);
    }
}
