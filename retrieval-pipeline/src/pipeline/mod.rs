pub mod config;

pub use config::{CypherSearchConfig, KindSearchConfig, MultiQueryConfig, Reranker, SearchConfig, SearchMethod};

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{instrument, warn};

use common::{
    error::GraphRagError,
    storage::{db::SurrealDbClient, schema, types::chunk::Chunk},
    usage::{UsageAccumulator, UsageTotals},
    utils::{embedding::Embedder, llm::LlmAgent},
};

use crate::{
    cypher::{execute_generated_query, CypherGenerator},
    kinds::{fetch_kind_combined, SearchKind, SearchResultItem},
    multi_query::generate_alternative_queries,
    scoring::{reciprocal_rank_fusion, RankedHit},
};

/// Everything one `search` call produces: the fused item list, an assembled
/// textual context, the provenance nodes behind the items, the generated
/// graph query (when enabled), and what the call cost.
#[derive(Debug, Default)]
pub struct CombinedSearchResults {
    pub items: Vec<SearchResultItem>,
    pub query_text: String,
    pub context_snippet: Option<String>,
    pub source_data_references: Vec<SearchResultItem>,
    pub executed_llm_cypher_query: Option<String>,
    pub raw_llm_cypher_query_results: Option<Vec<Value>>,
    pub generative_usage: UsageTotals,
    pub embedding_usage: UsageTotals,
}

/// Hybrid retrieval orchestrator: embeds the query once, fans per-kind
/// fetches out concurrently (optionally across generated sub-queries),
/// fuses with reciprocal rank fusion, and assembles the context window.
pub struct SearchManager {
    db: Arc<SurrealDbClient>,
    embedder: Arc<dyn Embedder>,
    agent: Arc<LlmAgent>,
    cypher_generator: CypherGenerator,
    usage: UsageAccumulator,
}

impl SearchManager {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedder: Arc<dyn Embedder>,
        agent: Arc<LlmAgent>,
        usage: UsageAccumulator,
    ) -> Self {
        let cypher_generator = CypherGenerator::new(Arc::clone(&agent), schema::FlaggedPropertiesConfig::default());
        Self { db, embedder, agent, cypher_generator, usage }
    }

    /// Drops the cached schema description; call after ingestion changes
    /// the property landscape the query generator sees.
    pub async fn invalidate_schema(&self) {
        self.cypher_generator.invalidate_schema().await;
    }

    #[instrument(skip_all, fields(query = query))]
    pub async fn search(&self, query: &str, search_config: &SearchConfig) -> Result<CombinedSearchResults, GraphRagError> {
        let mut results = CombinedSearchResults { query_text: query.to_string(), ..Default::default() };
        if query.trim().is_empty() {
            return Ok(results);
        }

        // 1. Optional multi-query expansion.
        let mut sub_queries = vec![query.to_string()];
        if let Some(mqr) = &search_config.multi_query_config {
            if mqr.enabled {
                let (alternatives, usage) =
                    generate_alternative_queries(&self.agent, query, mqr.max_alternative_questions).await;
                results.generative_usage += usage;
                self.usage.record_generative(usage).await;
                if mqr.include_original_query || alternatives.is_empty() {
                    sub_queries.extend(alternatives);
                } else {
                    sub_queries = alternatives;
                }
            }
        }

        // 2. One embedding call covers every sub-query.
        let (embeddings, usage) = self.embedder.embed_batch(&sub_queries).await?;
        results.embedding_usage += usage;
        self.usage.record_embedding(usage).await;

        // 3. Concurrent fan-out: every (sub-query, kind) pair at once.
        let mut fetches = Vec::new();
        for (sub_query, embedding) in sub_queries.iter().zip(embeddings.iter()) {
            for kind in SearchKind::ALL {
                if let Some(kind_config) = search_config.kind_config(kind) {
                    fetches.push(self.search_kind(kind, kind_config, sub_query.clone(), embedding.clone()));
                }
            }
        }
        let fetched = join_all(fetches).await;

        // 4. Group the per-sub-query ranked lists by kind, then fuse across
        // sub-queries. A single sub-query keeps its method-fused scores.
        let mut per_kind: HashMap<SearchKind, Vec<Vec<SearchResultItem>>> = HashMap::new();
        for (kind, list) in fetched {
            per_kind.entry(kind).or_default().push(list);
        }

        let mut merged: Vec<SearchResultItem> = Vec::new();
        for kind in SearchKind::ALL {
            let Some(lists) = per_kind.remove(&kind) else { continue };
            let Some(kind_config) = search_config.kind_config(kind) else { continue };
            let fused = if lists.len() == 1 {
                lists.into_iter().next().unwrap_or_default()
            } else {
                fuse_ranked_lists(lists, kind_config.rrf_k, kind_config.effective_limit())
            };
            merged.extend(fused);
        }

        // 5. Optional generated graph query over the original question.
        if let Some(cypher_config) = &search_config.cypher_search_config {
            if cypher_config.enabled {
                let schema_string = if cypher_config.flagged_properties.nodes.is_empty() {
                    self.cypher_generator.schema_string(&self.db).await?
                } else {
                    schema::schema_string(&self.db, &cypher_config.flagged_properties).await?
                };
                let (generated, usage) = self.cypher_generator.generate(query, &schema_string).await;
                results.generative_usage += usage;
                self.usage.record_generative(usage).await;

                if let Some(generated) = generated {
                    match execute_generated_query(&self.db, &generated).await {
                        Ok(Some((executed, rows))) => {
                            results.executed_llm_cypher_query = Some(executed);
                            results.raw_llm_cypher_query_results = Some(rows);
                        }
                        Ok(None) => {}
                        Err(err) => warn!(error = %err, "generated query execution failed"),
                    }
                }
            }
        }

        // 6. One list, best first, bounded.
        merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(limit) = search_config.overall_results_limit {
            merged.truncate(limit);
        }

        // 7. Context assembly and provenance.
        results.source_data_references = self.collect_source_references(&merged).await?;
        results.context_snippet = build_context_snippet(&merged);
        results.items = merged;
        Ok(results)
    }

    /// One kind for one sub-query: run all enabled methods in a single
    /// round trip, then fuse or deduplicate per the kind's reranker. Fetch
    /// errors degrade to an empty list so one kind never sinks the search.
    async fn search_kind(
        &self,
        kind: SearchKind,
        kind_config: &KindSearchConfig,
        query_text: String,
        embedding: Vec<f32>,
    ) -> (SearchKind, Vec<SearchResultItem>) {
        let lists = match fetch_kind_combined(&self.db, kind, kind_config, &query_text, &embedding).await {
            Ok(lists) => lists,
            Err(err) => {
                warn!(kind = ?kind, error = %err, "kind fetch failed");
                return (kind, Vec::new());
            }
        };

        let items = match kind_config.reranker {
            Reranker::ReciprocalRankFusion => fuse_ranked_lists(lists, kind_config.rrf_k, kind_config.effective_limit()),
            Reranker::None => {
                let mut best: HashMap<String, SearchResultItem> = HashMap::new();
                for item in lists.into_iter().flatten() {
                    match best.get(&item.uuid) {
                        Some(existing) if existing.score >= item.score => {}
                        _ => {
                            best.insert(item.uuid.clone(), item);
                        }
                    }
                }
                let mut items: Vec<SearchResultItem> = best.into_values().collect();
                items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                items.truncate(kind_config.effective_limit());
                items
            }
        };
        (kind, items)
    }

    /// The unique Source/Chunk/Product nodes behind the final items.
    /// Relationship and mention hits contribute the chunk their fact was
    /// recorded on.
    async fn collect_source_references(
        &self,
        items: &[SearchResultItem],
    ) -> Result<Vec<SearchResultItem>, GraphRagError> {
        let mut references: Vec<SearchResultItem> = Vec::new();
        let mut seen: Vec<String> = Vec::new();

        let mut push_unique = |item: SearchResultItem, seen: &mut Vec<String>, refs: &mut Vec<SearchResultItem>| {
            if !seen.contains(&item.uuid) {
                seen.push(item.uuid.clone());
                refs.push(item);
            }
        };

        for item in items {
            match item.result_type {
                SearchKind::Chunk | SearchKind::Product | SearchKind::Source => {
                    push_unique(item.clone(), &mut seen, &mut references);
                }
                SearchKind::Relationship | SearchKind::Mention => {
                    let chunk_id = match item.result_type {
                        SearchKind::Relationship => item
                            .metadata
                            .get("source_chunk_uuid")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        _ => item.source_node_uuid.clone(),
                    };
                    let Some(chunk_id) = chunk_id else { continue };
                    if seen.contains(&chunk_id) {
                        continue;
                    }
                    let chunk: Option<Chunk> = self.db.get_item(&chunk_id).await?;
                    if let Some(chunk) = chunk {
                        let mut metadata = serde_json::Map::new();
                        metadata.insert("source_description".into(), Value::String(chunk.source_description.clone()));
                        if let Some(number) = chunk.chunk_number {
                            metadata.insert("chunk_number".into(), Value::from(number));
                        }
                        push_unique(
                            SearchResultItem {
                                uuid: chunk.id,
                                result_type: SearchKind::Chunk,
                                score: item.score,
                                name: Some(chunk.name),
                                content: Some(chunk.content),
                                label: None,
                                fact_sentence: None,
                                source_node_uuid: None,
                                target_node_uuid: None,
                                metadata,
                            },
                            &mut seen,
                            &mut references,
                        );
                    }
                }
                SearchKind::Entity => {}
            }
        }
        Ok(references)
    }
}

/// RRF across ranked lists: each list contributes `1 / (k + rank + 1)` for
/// every item it surfaced, the best-scoring appearance supplies the item's
/// fields, and `metadata.original_search_score` preserves that raw score.
fn fuse_ranked_lists(lists: Vec<Vec<SearchResultItem>>, rrf_k: u32, limit: usize) -> Vec<SearchResultItem> {
    let mut hits: Vec<RankedHit> = Vec::new();
    let mut best_by_uuid: HashMap<String, SearchResultItem> = HashMap::new();

    for list in lists {
        for (rank, item) in list.into_iter().enumerate() {
            hits.push(RankedHit { id: item.uuid.clone(), rank, original_score: item.score });
            match best_by_uuid.get(&item.uuid) {
                Some(existing) if existing.score >= item.score => {}
                _ => {
                    best_by_uuid.insert(item.uuid.clone(), item);
                }
            }
        }
    }

    let fused = reciprocal_rank_fusion(hits, rrf_k);
    fused
        .into_iter()
        .take(limit)
        .filter_map(|(uuid, fused_score)| {
            best_by_uuid.remove(&uuid).map(|mut item| {
                item.metadata
                    .insert("original_search_score".into(), Value::from(f64::from(item.score)));
                item.score = fused_score;
                item
            })
        })
        .collect()
}

/// Renders the chosen items into one textual context block, grouped by
/// kind, ready to paste into a generation prompt.
fn build_context_snippet(items: &[SearchResultItem]) -> Option<String> {
    if items.is_empty() {
        return None;
    }

    fn truncate(text: &str, max_chars: usize) -> String {
        if text.chars().count() <= max_chars {
            text.to_string()
        } else {
            let prefix: String = text.chars().take(max_chars).collect();
            format!("{prefix}...")
        }
    }

    let sections: [(SearchKind, &str); 6] = [
        (SearchKind::Source, "Sources"),
        (SearchKind::Chunk, "Chunks"),
        (SearchKind::Product, "Products"),
        (SearchKind::Entity, "Entities"),
        (SearchKind::Relationship, "Relationships"),
        (SearchKind::Mention, "Mentions"),
    ];

    let mut out = String::new();
    for (kind, heading) in sections {
        let of_kind: Vec<&SearchResultItem> = items.iter().filter(|i| i.result_type == kind).collect();
        if of_kind.is_empty() {
            continue;
        }
        out.push_str(&format!("## {heading}\n"));
        for item in of_kind {
            let line = match kind {
                SearchKind::Source => format!(
                    "- {}: {}",
                    item.name.as_deref().unwrap_or("unnamed source"),
                    truncate(item.content.as_deref().unwrap_or(""), 300),
                ),
                SearchKind::Chunk => {
                    let source = item
                        .metadata
                        .get("source_description")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown source");
                    let number = item
                        .metadata
                        .get("chunk_number")
                        .and_then(Value::as_u64)
                        .map(|n| format!(" #{n}"))
                        .unwrap_or_default();
                    format!("- [{source}{number}] {}", truncate(item.content.as_deref().unwrap_or(""), 600))
                }
                SearchKind::Product => format!(
                    "- {}{}: {}",
                    item.name.as_deref().unwrap_or("unnamed product"),
                    item.label.as_deref().map(|l| format!(" ({l})")).unwrap_or_default(),
                    truncate(item.content.as_deref().unwrap_or(""), 300),
                ),
                SearchKind::Entity => format!(
                    "- {}{}",
                    item.name.as_deref().unwrap_or("unnamed entity"),
                    item.label.as_deref().map(|l| format!(" ({l})")).unwrap_or_default(),
                ),
                SearchKind::Relationship | SearchKind::Mention => {
                    format!("- {}", item.fact_sentence.as_deref().unwrap_or(""))
                }
            };
            out.push_str(&line);
            out.push('\n');
        }
        out.push('\n');
    }

    Some(out.trim_end().to_string())
}

#[cfg(test)]
mod snippet_tests {
    use super::*;

    fn item(kind: SearchKind, name: &str, content: Option<&str>) -> SearchResultItem {
        SearchResultItem {
            uuid: name.to_string(),
            result_type: kind,
            score: 1.0,
            name: Some(name.to_string()),
            content: content.map(str::to_string),
            label: None,
            fact_sentence: Some("Pooh ate honey.".into()),
            source_node_uuid: None,
            target_node_uuid: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn snippet_groups_items_by_kind_in_fixed_order() {
        let items = vec![
            item(SearchKind::Entity, "Pooh", None),
            item(SearchKind::Chunk, "c1", Some("Pooh ate honey at Rabbit's house.")),
            item(SearchKind::Relationship, "r1", None),
        ];

        let snippet = build_context_snippet(&items).expect("snippet");
        let chunk_at = snippet.find("## Chunks").expect("chunks section");
        let entities_at = snippet.find("## Entities").expect("entities section");
        let rels_at = snippet.find("## Relationships").expect("relationships section");
        assert!(chunk_at < entities_at && entities_at < rels_at);
        assert!(snippet.contains("Pooh ate honey at Rabbit's house."));
    }

    #[test]
    fn empty_items_yield_no_snippet() {
        assert!(build_context_snippet(&[]).is_none());
    }

    #[test]
    fn fuse_preserves_original_score_in_metadata() {
        let list_a = vec![item(SearchKind::Chunk, "c1", Some("text"))];
        let mut b_item = item(SearchKind::Chunk, "c1", Some("text"));
        b_item.score = 0.4;
        let list_b = vec![b_item];

        let fused = fuse_ranked_lists(vec![list_a, list_b], 60, 10);
        assert_eq!(fused.len(), 1);
        let expected = 2.0 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-6);
        let original = fused[0].metadata.get("original_search_score").and_then(Value::as_f64).expect("score");
        assert!((original - 1.0).abs() < 1e-6);
    }
}
