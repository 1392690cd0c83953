use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use surrealdb::sql::Thing;
use tracing::debug;

use common::{error::GraphRagError, storage::db::SurrealDbClient};

use crate::{
    fts::escape_query_terms,
    pipeline::config::{KindSearchConfig, SearchMethod},
};

/// The node and relationship kinds hybrid search spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchKind {
    Chunk,
    Entity,
    Relationship,
    Source,
    Product,
    Mention,
}

impl SearchKind {
    pub const ALL: [SearchKind; 6] = [
        SearchKind::Chunk,
        SearchKind::Entity,
        SearchKind::Relationship,
        SearchKind::Source,
        SearchKind::Product,
        SearchKind::Mention,
    ];

    fn table(self) -> &'static str {
        match self {
            SearchKind::Chunk => "chunk",
            SearchKind::Entity => "entity",
            SearchKind::Relationship => "relates_to",
            SearchKind::Source => "source",
            SearchKind::Product => "product",
            SearchKind::Mention => "mentions",
        }
    }
}

/// One row of a combined search result, unified across kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub uuid: String,
    pub result_type: SearchKind,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_sentence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_uuid: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

fn deserialize_record_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let thing = Thing::deserialize(deserializer)?;
    Ok(thing.id.to_raw())
}

fn deserialize_optional_record_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let thing = Option::<Thing>::deserialize(deserializer)?;
    Ok(thing.map(|t| t.id.to_raw()))
}

/// Row shape shared by every sub-query; each kind selects the columns it
/// has and the rest default to `None`.
#[derive(Debug, Deserialize)]
struct HitRow {
    #[serde(deserialize_with = "deserialize_record_id")]
    id: String,
    #[serde(default)]
    score: Option<f32>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    fact_sentence: Option<String>,
    #[serde(default)]
    relation_label: Option<String>,
    #[serde(default)]
    source_description: Option<String>,
    #[serde(default)]
    chunk_number: Option<u32>,
    #[serde(default)]
    source_chunk_id: Option<String>,
    #[serde(default, rename = "in", deserialize_with = "deserialize_optional_record_id")]
    in_: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_record_id")]
    out: Option<String>,
}

impl HitRow {
    fn into_item(self, kind: SearchKind, method_source: &str) -> SearchResultItem {
        let score = self.score.unwrap_or(0.0);
        let mut metadata = serde_json::Map::new();
        metadata.insert("method_source".into(), Value::String(method_source.to_string()));
        if let Some(desc) = &self.source_description {
            metadata.insert("source_description".into(), Value::String(desc.clone()));
        }
        if let Some(number) = self.chunk_number {
            metadata.insert("chunk_number".into(), Value::from(number));
        }
        if let Some(category) = &self.category {
            metadata.insert("category".into(), Value::String(category.clone()));
        }
        if let Some(chunk_id) = &self.source_chunk_id {
            metadata.insert("source_chunk_uuid".into(), Value::String(chunk_id.clone()));
        }

        SearchResultItem {
            uuid: self.id,
            result_type: kind,
            score,
            name: self.name.or(self.relation_label),
            content: self.content.or(self.description),
            label: self.label.or(self.category),
            fact_sentence: self.fact_sentence,
            source_node_uuid: self.in_,
            target_node_uuid: self.out,
            metadata,
        }
    }
}

/// Which sub-queries a kind supports, as `(method, method_source tag,
/// statement builder)` entries.
struct MethodQuery {
    method_source: &'static str,
    statement: String,
    min_score: Option<f32>,
}

fn keyword_statement(kind: SearchKind, fetch_limit: usize) -> String {
    let table = kind.table();
    match kind {
        SearchKind::Chunk => format!(
            "SELECT id, name, content, source_description, chunk_number, \
             (IF search::score(0) != NONE THEN search::score(0) ELSE 0 END) + \
             (IF search::score(1) != NONE THEN search::score(1) ELSE 0 END) AS score \
             FROM {table} WHERE content @0@ $terms OR name @1@ $terms \
             ORDER BY score DESC LIMIT {fetch_limit};"
        ),
        SearchKind::Source => format!(
            "SELECT id, name, content, \
             (IF search::score(0) != NONE THEN search::score(0) ELSE 0 END) + \
             (IF search::score(1) != NONE THEN search::score(1) ELSE 0 END) AS score \
             FROM {table} WHERE content @0@ $terms OR name @1@ $terms \
             ORDER BY score DESC LIMIT {fetch_limit};"
        ),
        SearchKind::Entity => format!(
            "SELECT id, name, label, description, \
             (IF search::score(0) != NONE THEN search::score(0) ELSE 0 END) + \
             (IF search::score(1) != NONE THEN search::score(1) ELSE 0 END) AS score \
             FROM {table} WHERE name @0@ $terms OR description @1@ $terms \
             ORDER BY score DESC LIMIT {fetch_limit};"
        ),
        SearchKind::Product => format!(
            "SELECT id, name, content, category, \
             (IF search::score(0) != NONE THEN search::score(0) ELSE 0 END) + \
             (IF search::score(1) != NONE THEN search::score(1) ELSE 0 END) AS score \
             FROM {table} WHERE name @0@ $terms OR content @1@ $terms \
             ORDER BY score DESC LIMIT {fetch_limit};"
        ),
        SearchKind::Relationship => format!(
            "SELECT id, in, out, relation_label, fact_sentence, source_chunk_id, \
             (IF search::score(0) != NONE THEN search::score(0) ELSE 0 END) AS score \
             FROM {table} WHERE fact_sentence @0@ $terms \
             ORDER BY score DESC LIMIT {fetch_limit};"
        ),
        SearchKind::Mention => format!(
            "SELECT id, in, out, fact_sentence, \
             (IF search::score(0) != NONE THEN search::score(0) ELSE 0 END) AS score \
             FROM {table} WHERE fact_sentence @0@ $terms \
             ORDER BY score DESC LIMIT {fetch_limit};"
        ),
    }
}

fn semantic_statement(kind: SearchKind, field: &str, fetch_limit: usize) -> String {
    let table = kind.table();
    let columns = match kind {
        SearchKind::Chunk => "id, name, content, source_description, chunk_number",
        SearchKind::Source => "id, name, content",
        SearchKind::Entity => "id, name, label, description",
        SearchKind::Product => "id, name, content, category",
        SearchKind::Relationship => "id, in, out, relation_label, fact_sentence, source_chunk_id",
        SearchKind::Mention => "id, in, out, fact_sentence",
    };
    format!(
        "SELECT {columns}, vector::similarity::cosine({field}, $embedding) AS score \
         FROM {table} WHERE {field} != NONE AND {field} <|{fetch_limit},100|> $embedding \
         ORDER BY score DESC LIMIT {fetch_limit};"
    )
}

fn method_queries(kind: SearchKind, config: &KindSearchConfig, has_terms: bool) -> Vec<MethodQuery> {
    let mut queries = Vec::new();
    for method in &config.search_methods {
        match (kind, method) {
            (_, SearchMethod::Keyword) if has_terms => queries.push(MethodQuery {
                method_source: "keyword",
                statement: keyword_statement(kind, config.keyword_fetch_limit),
                min_score: None,
            }),
            (_, SearchMethod::Keyword) => {}
            (SearchKind::Chunk | SearchKind::Source, SearchMethod::Semantic) => queries.push(MethodQuery {
                method_source: "semantic",
                statement: semantic_statement(kind, "content_embedding", config.semantic_fetch_limit),
                min_score: Some(config.min_similarity_score),
            }),
            (SearchKind::Entity, SearchMethod::Semantic | SearchMethod::SemanticName) => queries.push(MethodQuery {
                method_source: "semantic_name",
                statement: semantic_statement(kind, "name_embedding", config.semantic_fetch_limit),
                min_score: Some(config.min_similarity_score_name),
            }),
            (SearchKind::Relationship | SearchKind::Mention, SearchMethod::Semantic) => queries.push(MethodQuery {
                method_source: "semantic_fact",
                statement: semantic_statement(kind, "fact_embedding", config.semantic_fetch_limit),
                min_score: Some(config.min_similarity_score),
            }),
            (SearchKind::Product, SearchMethod::SemanticName) => queries.push(MethodQuery {
                method_source: "semantic_name",
                statement: semantic_statement(kind, "name_embedding", config.semantic_name_fetch_limit),
                min_score: Some(config.min_similarity_score_name),
            }),
            (SearchKind::Product, SearchMethod::SemanticContent) => queries.push(MethodQuery {
                method_source: "semantic_content",
                statement: semantic_statement(kind, "content_embedding", config.semantic_content_fetch_limit),
                min_score: Some(config.min_similarity_score_content),
            }),
            (SearchKind::Product, SearchMethod::Semantic) => {
                queries.push(MethodQuery {
                    method_source: "semantic_name",
                    statement: semantic_statement(kind, "name_embedding", config.semantic_name_fetch_limit),
                    min_score: Some(config.min_similarity_score_name),
                });
                queries.push(MethodQuery {
                    method_source: "semantic_content",
                    statement: semantic_statement(kind, "content_embedding", config.semantic_content_fetch_limit),
                    min_score: Some(config.min_similarity_score_content),
                });
            }
            (_, SearchMethod::SemanticName | SearchMethod::SemanticContent) => {}
        }
    }
    queries
}

/// Runs every enabled method for a kind in one store round trip and returns
/// the per-method hit lists, each tagged with its `method_source` and
/// ordered by the method's own score.
pub async fn fetch_kind_combined(
    db: &SurrealDbClient,
    kind: SearchKind,
    config: &KindSearchConfig,
    query_text: &str,
    query_embedding: &[f32],
) -> Result<Vec<Vec<SearchResultItem>>, GraphRagError> {
    let terms = escape_query_terms(query_text);
    let queries = method_queries(kind, config, !terms.is_empty());
    if queries.is_empty() {
        return Ok(Vec::new());
    }

    let mut request = db.client.query("RETURN 0;");
    for query in &queries {
        request = request.query(query.statement.clone());
    }
    let mut response = request
        .bind(("terms", terms))
        .bind(("embedding", query_embedding.to_vec()))
        .await?;

    let mut lists = Vec::with_capacity(queries.len());
    for (index, query) in queries.iter().enumerate() {
        let rows: Vec<HitRow> = response.take(index + 1)?;
        let items: Vec<SearchResultItem> = rows
            .into_iter()
            .map(|row| row.into_item(kind, query.method_source))
            .filter(|item| query.min_score.map_or(true, |min| item.score >= min))
            .collect();
        debug!(kind = ?kind, method = query.method_source, hits = items.len(), "method fetch complete");
        lists.push(items);
    }
    Ok(lists)
}
