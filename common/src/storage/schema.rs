use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{error::GraphRagError, storage::db::SurrealDbClient};

const INDEX_POLL_INTERVAL: Duration = Duration::from_millis(50);
const FTS_ANALYZER_NAME: &str = "graphrag_fts_analyzer";

/// Node tables whose dynamic property bags are scanned for index discovery
/// and schema description.
pub const NODE_TABLES: &[&str] = &["source", "chunk", "entity", "product"];

/// Keys never surfaced as dynamic index candidates, either because they are
/// fixed schema fields or bookkeeping values.
const RESERVED_PROPERTY_KEYS: &[&str] = &[
    "id",
    "uuid",
    "name",
    "content",
    "created_at",
    "updated_at",
    "processed_at",
    "chunk_number",
    "source_description",
    "source_id",
    "normalized_name",
    "label",
    "entity_count",
    "relationship_count",
    "content_embedding",
    "name_embedding",
    "fact_embedding",
];

#[derive(Clone, Copy)]
struct HnswIndexSpec {
    index_name: &'static str,
    table: &'static str,
    field: &'static str,
}

const HNSW_INDEX_SPECS: [HnswIndexSpec; 7] = [
    HnswIndexSpec { index_name: "idx_source_content_embedding", table: "source", field: "content_embedding" },
    HnswIndexSpec { index_name: "idx_chunk_content_embedding", table: "chunk", field: "content_embedding" },
    HnswIndexSpec { index_name: "idx_entity_name_embedding", table: "entity", field: "name_embedding" },
    HnswIndexSpec { index_name: "idx_product_name_embedding", table: "product", field: "name_embedding" },
    HnswIndexSpec { index_name: "idx_product_content_embedding", table: "product", field: "content_embedding" },
    HnswIndexSpec { index_name: "idx_mentions_fact_embedding", table: "mentions", field: "fact_embedding" },
    HnswIndexSpec { index_name: "idx_relates_to_fact_embedding", table: "relates_to", field: "fact_embedding" },
];

impl HnswIndexSpec {
    fn definition(&self, dimension: usize) -> String {
        format!(
            "DEFINE INDEX OVERWRITE {index} ON TABLE {table} FIELDS {field} HNSW DIMENSION {dimension} DIST COSINE TYPE F32 EFC 150 M 12;",
            index = self.index_name,
            table = self.table,
            field = self.field,
        )
    }
}

#[derive(Clone, Copy)]
struct FtsIndexSpec {
    index_name: &'static str,
    table: &'static str,
    field: &'static str,
}

const FTS_INDEX_SPECS: [FtsIndexSpec; 10] = [
    FtsIndexSpec { index_name: "idx_chunk_content_fts", table: "chunk", field: "content" },
    FtsIndexSpec { index_name: "idx_chunk_name_fts", table: "chunk", field: "name" },
    FtsIndexSpec { index_name: "idx_source_content_fts", table: "source", field: "content" },
    FtsIndexSpec { index_name: "idx_source_name_fts", table: "source", field: "name" },
    FtsIndexSpec { index_name: "idx_entity_name_fts", table: "entity", field: "name" },
    FtsIndexSpec { index_name: "idx_entity_description_fts", table: "entity", field: "description" },
    FtsIndexSpec { index_name: "idx_product_name_fts", table: "product", field: "name" },
    FtsIndexSpec { index_name: "idx_product_content_fts", table: "product", field: "content" },
    FtsIndexSpec { index_name: "idx_mentions_fact_fts", table: "mentions", field: "fact_sentence" },
    FtsIndexSpec { index_name: "idx_relates_to_fact_fts", table: "relates_to", field: "fact_sentence" },
];

impl FtsIndexSpec {
    fn definition(&self) -> String {
        format!(
            "DEFINE INDEX OVERWRITE {index} ON TABLE {table} FIELDS {field} SEARCH ANALYZER {analyzer} BM25;",
            index = self.index_name,
            table = self.table,
            field = self.field,
            analyzer = FTS_ANALYZER_NAME,
        )
    }
}

const SCALAR_INDEX_DEFINITIONS: &str = "\
    DEFINE INDEX OVERWRITE idx_source_name_unique ON TABLE source FIELDS name UNIQUE;\n\
    DEFINE INDEX OVERWRITE idx_entity_identity ON TABLE entity FIELDS normalized_name, label UNIQUE;\n\
    DEFINE INDEX OVERWRITE idx_entity_label ON TABLE entity FIELDS label;\n\
    DEFINE INDEX OVERWRITE idx_chunk_source ON TABLE chunk FIELDS source_id;\n\
    DEFINE INDEX OVERWRITE idx_chunk_source_number ON TABLE chunk FIELDS source_id, chunk_number;\n\
    DEFINE INDEX OVERWRITE idx_product_source ON TABLE product FIELDS source_id;\n\
    DEFINE INDEX OVERWRITE idx_relates_to_label ON TABLE relates_to FIELDS relation_label;";

const SCALAR_INDEX_NAMES: &[(&str, &str)] = &[
    ("idx_source_name_unique", "source"),
    ("idx_entity_identity", "entity"),
    ("idx_entity_label", "entity"),
    ("idx_chunk_source", "chunk"),
    ("idx_chunk_source_number", "chunk"),
    ("idx_product_source", "product"),
    ("idx_relates_to_label", "relates_to"),
];

/// Defines constraints, B-tree indexes, FTS indexes, vector indexes, and the
/// dynamically discovered per-property indexes for every node and
/// relationship table. Idempotent: safe to call on startup every time, and
/// safe to call again when the embedding dimension changes.
pub async fn ensure_schema(db: &SurrealDbClient, embedding_dimension: usize) -> Result<(), GraphRagError> {
    ensure_schema_inner(db, embedding_dimension)
        .await
        .map_err(|err| GraphRagError::Internal(err.to_string()))
}

async fn ensure_schema_inner(db: &SurrealDbClient, embedding_dimension: usize) -> Result<()> {
    create_fts_analyzer(db).await?;

    db.client
        .query(SCALAR_INDEX_DEFINITIONS)
        .await
        .context("defining scalar indexes")?
        .check()
        .context("scalar index definitions failed")?;

    for spec in FTS_INDEX_SPECS {
        create_index_with_polling(db, spec.definition(), spec.index_name, spec.table).await?;
    }

    for spec in HNSW_INDEX_SPECS {
        create_index_with_polling(db, spec.definition(embedding_dimension), spec.index_name, spec.table).await?;
    }

    for table in NODE_TABLES {
        for prop in discover_indexable_properties(db, table).await? {
            let definition = format!(
                "DEFINE INDEX OVERWRITE {name} ON TABLE {table} FIELDS properties.`{prop}`;",
                name = dynamic_index_name(table, &prop),
            );
            db.client
                .query(definition)
                .await
                .with_context(|| format!("defining dynamic index on {table}.properties.{prop}"))?
                .check()
                .with_context(|| format!("dynamic index definition failed for {table}.properties.{prop}"))?;
        }
    }

    Ok(())
}

/// Drops every index and analyzer this module manages, including the
/// dynamically discovered ones, leaving the data itself in place.
pub async fn clear_schema(db: &SurrealDbClient) -> Result<(), GraphRagError> {
    let mut drops: Vec<(String, String)> = Vec::new();
    for (name, table) in SCALAR_INDEX_NAMES {
        drops.push(((*name).to_string(), (*table).to_string()));
    }
    for spec in FTS_INDEX_SPECS {
        drops.push((spec.index_name.to_string(), spec.table.to_string()));
    }
    for spec in HNSW_INDEX_SPECS {
        drops.push((spec.index_name.to_string(), spec.table.to_string()));
    }
    for table in NODE_TABLES {
        for prop in discover_indexable_properties(db, table).await? {
            drops.push((dynamic_index_name(table, &prop), (*table).to_string()));
        }
    }

    for (index, table) in drops {
        db.client
            .query(format!("REMOVE INDEX IF EXISTS {index} ON TABLE {table};"))
            .await?
            .check()?;
    }

    db.client
        .query(format!("REMOVE ANALYZER IF EXISTS {FTS_ANALYZER_NAME};"))
        .await?
        .check()?;
    Ok(())
}

/// Deletes every record from every table, leaving index definitions intact.
pub async fn clear_data(db: &SurrealDbClient) -> Result<(), GraphRagError> {
    let tables = ["mentions", "relates_to", "chunk", "product", "entity", "source"];
    for table in tables {
        db.client.query(format!("DELETE {table};")).await?.check()?;
    }
    Ok(())
}

fn dynamic_index_name(table: &str, property: &str) -> String {
    let safe: String = property
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("dynamic_idx_{table}_{}", safe.to_lowercase())
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Enumerates the dynamic property keys observed on a table that are worth a
/// B-tree index: scalar-valued and not in the reserved set. Keys whose
/// observed values disagree on scalarness are skipped.
pub async fn discover_indexable_properties(db: &SurrealDbClient, table: &str) -> Result<Vec<String>, GraphRagError> {
    #[derive(Deserialize)]
    struct Row {
        properties: Option<serde_json::Map<String, Value>>,
    }

    let rows: Vec<Row> = db
        .client
        .query(format!("SELECT properties FROM {table};"))
        .await?
        .take(0)?;

    let mut scalar_keys: BTreeMap<String, bool> = BTreeMap::new();
    for row in rows {
        let Some(bag) = row.properties else { continue };
        for (key, value) in bag {
            if RESERVED_PROPERTY_KEYS.contains(&key.as_str()) {
                continue;
            }
            let entry = scalar_keys.entry(key).or_insert(true);
            *entry = *entry && is_scalar(&value);
        }
    }

    Ok(scalar_keys.into_iter().filter(|(_, scalar)| *scalar).map(|(key, _)| key).collect())
}

async fn create_fts_analyzer(db: &SurrealDbClient) -> Result<()> {
    let query = format!(
        "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME} TOKENIZERS class FILTERS lowercase, ascii, snowball(english);"
    );
    if db.client.query(query).await.and_then(|r| r.check()).is_ok() {
        return Ok(());
    }

    warn!("snowball analyzer unavailable, falling back to lowercase+ascii");
    let fallback = format!(
        "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME} TOKENIZERS class FILTERS lowercase, ascii;"
    );
    db.client
        .query(fallback)
        .await
        .context("creating fallback FTS analyzer")?
        .check()
        .context("fallback FTS analyzer definition failed")?;
    Ok(())
}

async fn create_index_with_polling(
    db: &SurrealDbClient,
    definition: String,
    index_name: &str,
    table: &str,
) -> Result<()> {
    let mut attempts = 0;
    const MAX_ATTEMPTS: usize = 3;
    loop {
        attempts += 1;
        let res = db
            .client
            .query(definition.clone())
            .await
            .with_context(|| format!("creating index {index_name} on table {table}"))?;
        match res.check() {
            Ok(_) => break,
            Err(err) if err.to_string().contains("read or write conflict") && attempts < MAX_ATTEMPTS => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("index definition failed for {index_name} on {table}"));
            }
        }
    }

    poll_index_build_status(db, index_name, table).await
}

async fn poll_index_build_status(db: &SurrealDbClient, index_name: &str, table: &str) -> Result<()> {
    loop {
        tokio::time::sleep(INDEX_POLL_INTERVAL).await;

        let info_query = format!("INFO FOR INDEX {index_name} ON TABLE {table};");
        let mut info_res = db
            .client
            .query(info_query)
            .await
            .with_context(|| format!("checking index build status for {index_name} on {table}"))?;
        let info: Option<Value> = info_res.take(0).context("deserializing INFO FOR INDEX result")?;

        let status = info
            .as_ref()
            .and_then(|v| v.get("building"))
            .and_then(|b| b.get("status"))
            .and_then(|s| s.as_str())
            .unwrap_or("ready")
            .to_string();

        debug!(index = index_name, table = table, status = %status, "index build status");

        if status.eq_ignore_ascii_case("ready") || status.eq_ignore_ascii_case("error") {
            break;
        }
    }
    Ok(())
}

/// Marks a property whose distinct observed values should be listed inline
/// in the schema description handed to the query-generation model.
#[derive(Debug, Clone, Copy)]
pub struct PropertyValueConfig {
    pub limit: usize,
}

impl Default for PropertyValueConfig {
    fn default() -> Self {
        Self { limit: 10 }
    }
}

/// Properties flagged for inline value listing, keyed by table then
/// property name.
#[derive(Debug, Clone, Default)]
pub struct FlaggedPropertiesConfig {
    pub nodes: BTreeMap<String, BTreeMap<String, PropertyValueConfig>>,
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "STRING",
        Value::Number(n) if n.is_f64() => "FLOAT",
        Value::Number(_) => "INTEGER",
        Value::Bool(_) => "BOOLEAN",
        Value::Array(_) => "LIST",
        Value::Object(_) => "MAP",
        Value::Null => "NULL",
    }
}

/// Renders the live graph schema as text for the query-generation prompt:
/// node labels with their observed scalar/list properties (flagged ones
/// annotated with distinct values), relationship types with their
/// properties, and the allowed traversal patterns.
pub async fn schema_string(
    db: &SurrealDbClient,
    flagged: &FlaggedPropertiesConfig,
) -> Result<String, GraphRagError> {
    let mut out = String::from("Node properties:\n");

    for table in NODE_TABLES {
        let rows: Vec<Value> = db
            .client
            .query(format!("SELECT * OMIT content_embedding, name_embedding FROM {table} LIMIT 50;"))
            .await?
            .take(0)?;

        let mut props: BTreeMap<String, &'static str> = BTreeMap::new();
        for row in &rows {
            let Some(object) = row.as_object() else { continue };
            for (key, value) in object {
                if key == "id" || key == "properties" || value.is_null() {
                    continue;
                }
                props.insert(key.clone(), json_type_name(value));
            }
            if let Some(bag) = object.get("properties").and_then(Value::as_object) {
                for (key, value) in bag {
                    if !value.is_null() {
                        props.insert(key.clone(), json_type_name(value));
                    }
                }
            }
        }

        let label = display_label(table);
        out.push_str(&format!("{label} {{"));
        let mut first = true;
        for (key, type_name) in &props {
            if !first {
                out.push_str(", ");
            }
            first = false;
            out.push_str(&format!("{key}: {type_name}"));
            if let Some(config) = flagged.nodes.get(*table).and_then(|m| m.get(key)) {
                let values = distinct_property_values(db, table, key, config.limit).await?;
                if !values.is_empty() {
                    let rendered: Vec<String> = values.iter().map(render_scalar).collect();
                    out.push_str(&format!(" {{possible values: [{}]}}", rendered.join(", ")));
                }
            }
        }
        out.push_str("}\n");
    }

    out.push_str("\nRelationship properties:\n");
    out.push_str("MENTIONS {uuid: STRING, fact_sentence: STRING}\n");
    out.push_str("RELATES_TO {uuid: STRING, relation_label: STRING, fact_sentence: STRING, source_chunk_uuid: STRING}\n");
    out.push_str("BELONGS_TO_SOURCE {}\n");
    out.push_str("NEXT_CHUNK {}\n");

    out.push_str("\nThe relationships:\n");
    out.push_str("(:Chunk)-[:BELONGS_TO_SOURCE]->(:Source)\n");
    out.push_str("(:Product)-[:BELONGS_TO_SOURCE]->(:Source)\n");
    out.push_str("(:Chunk)-[:NEXT_CHUNK]->(:Chunk)\n");
    out.push_str("(:Chunk)-[:MENTIONS]->(:Entity)\n");
    out.push_str("(:Chunk)-[:MENTIONS]->(:Product)\n");
    out.push_str("(:Entity)-[:RELATES_TO]->(:Entity)\n");
    out.push_str("(:Entity)-[:RELATES_TO]->(:Product)\n");
    out.push_str("(:Product)-[:RELATES_TO]->(:Entity)\n");

    Ok(out)
}

fn display_label(table: &str) -> &'static str {
    match table {
        "source" => "Source",
        "chunk" => "Chunk",
        "entity" => "Entity",
        "product" => "Product",
        _ => "Unknown",
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{s}'"),
        other => other.to_string(),
    }
}

async fn distinct_property_values(
    db: &SurrealDbClient,
    table: &str,
    property: &str,
    limit: usize,
) -> Result<Vec<Value>, GraphRagError> {
    #[derive(Deserialize)]
    struct Row {
        value: Value,
    }

    // Flagged properties can be fixed fields (category, label) or live in
    // the dynamic bag; check the fixed field first.
    let field_expr = if RESERVED_PROPERTY_KEYS.contains(&property) || is_fixed_field(table, property) {
        property.to_string()
    } else {
        format!("properties.`{property}`")
    };

    let rows: Vec<Row> = db
        .client
        .query(format!(
            "SELECT VALUE {{ value: {field_expr} }} FROM {table} WHERE {field_expr} != NONE LIMIT {limit};"
        ))
        .await?
        .take(0)?;

    let mut seen = Vec::new();
    for row in rows {
        if !seen.contains(&row.value) {
            seen.push(row.value);
        }
    }
    Ok(seen)
}

fn is_fixed_field(table: &str, property: &str) -> bool {
    match table {
        "source" => matches!(property, "name" | "content"),
        "chunk" => matches!(property, "name" | "content" | "chunk_number" | "source_description"),
        "entity" => matches!(property, "name" | "label" | "description"),
        "product" => matches!(property, "name" | "content" | "price" | "sku" | "category"),
        _ => false,
    }
}
