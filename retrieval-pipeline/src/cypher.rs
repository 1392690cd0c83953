use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use common::{
    error::GraphRagError,
    storage::{db::SurrealDbClient, schema, schema::FlaggedPropertiesConfig},
    usage::UsageTotals,
    utils::llm::LlmAgent,
};

#[derive(Debug, Deserialize)]
struct GeneratedCypherQuery {
    cypher_query: String,
}

/// The generation prompt teaches graph-pattern query syntax because that is
/// what the model has seen; execution happens through the translation layer
/// below, which accepts only the subset the prompt steers toward.
const CYPHER_GENERATION_TEMPLATE: &str = "\
Task: Generate a Cypher statement to query a graph database.
Instructions:
Use only the provided relationship types and properties in the schema.
Do not use any other relationship types or properties that are not provided.
Focus on constructing base queries using property matching and single relationship traversal.

Property value handling:
- Case-insensitivity for strings: perform case-insensitive comparisons on string properties, \
e.g. toLower(n.property) = toLower('value') or toLower(n.property) CONTAINS toLower('keyword').
- If the schema for a property includes '{possible values: [...]}', use those known values to \
construct precise comparisons.

Combining results:
- If the question implies distinct patterns, use UNION ALL; each sub-query must return the same \
column names (alias with AS where needed).

Do not generate queries that call vector or fulltext index procedures; those searches are handled \
by other components.

Schema:
{schema_string}

Note: Do not include any explanations or apologies in your response.
Strictly output only the Cypher query. If you cannot generate a query based on the schema and \
question, output the single word \"NONE\".

Examples:
# What products cost less than 1000?
MATCH (p:Product) WHERE p.price < 1000 RETURN p.name, p.price

# Find products with \"Dell XPS 13\" in their content.
MATCH (p:Product) WHERE toLower(p.content) CONTAINS toLower('Dell XPS 13') RETURN p.name, p.content

# Find any Entity or Product named 'Apex Innovations'.
MATCH (e:Entity) WHERE toLower(e.name) = toLower('Apex Innovations') RETURN e.name AS entityName
UNION ALL
MATCH (p:Product) WHERE toLower(p.name) = toLower('Apex Innovations') RETURN p.name AS entityName

The question is:
{question}";

fn cypher_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "cypher_query": {"type": "string"}
        },
        "required": ["cypher_query"],
        "additionalProperties": false
    })
}

/// Turns a natural-language question into a graph query, constrained by a
/// rendered schema string that is cached per instance until invalidated.
pub struct CypherGenerator {
    agent: Arc<LlmAgent>,
    flagged: FlaggedPropertiesConfig,
    schema_cache: Mutex<Option<String>>,
}

impl CypherGenerator {
    pub fn new(agent: Arc<LlmAgent>, flagged: FlaggedPropertiesConfig) -> Self {
        Self { agent, flagged, schema_cache: Mutex::new(None) }
    }

    /// The schema description fed into the prompt, rendered once and reused
    /// until `invalidate_schema` (typically after an ingest changes the
    /// property landscape).
    pub async fn schema_string(&self, db: &SurrealDbClient) -> Result<String, GraphRagError> {
        let mut cache = self.schema_cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            return Ok(cached.clone());
        }
        let rendered = schema::schema_string(db, &self.flagged).await?;
        *cache = Some(rendered.clone());
        Ok(rendered)
    }

    pub async fn invalidate_schema(&self) {
        *self.schema_cache.lock().await = None;
    }

    /// Generates a query for `question`. Returns `None` when the model
    /// answers with the `NONE` sentinel, outputs an empty string, or errors.
    pub async fn generate(&self, question: &str, schema_string: &str) -> (Option<String>, UsageTotals) {
        let prompt = CYPHER_GENERATION_TEMPLATE
            .replace("{schema_string}", schema_string)
            .replace("{question}", question);

        match self
            .agent
            .generate_typed::<GeneratedCypherQuery>("", &prompt, "generated_cypher_query", cypher_schema())
            .await
        {
            Ok((generated, usage)) => {
                let query = generated.cypher_query.trim().to_string();
                if query.is_empty() || query.eq_ignore_ascii_case("NONE") {
                    info!("model declined to generate a query");
                    (None, usage)
                } else {
                    info!(query = %query, "generated graph query");
                    (Some(query), usage)
                }
            }
            Err(err) => {
                warn!(error = %err, "query generation failed");
                (None, UsageTotals::default())
            }
        }
    }
}

/// Executes a generated query read-only: translates the pattern syntax to
/// the store's dialect and runs it only when the whole query falls inside
/// the supported subset. Returns the executed statement and its raw rows.
pub async fn execute_generated_query(
    db: &SurrealDbClient,
    cypher: &str,
) -> Result<Option<(String, Vec<Value>)>, GraphRagError> {
    let Some(translated) = translate::to_surql(cypher) else {
        warn!(query = %cypher, "generated query falls outside the supported subset, skipping execution");
        return Ok(None);
    };
    debug!(surql = %translated, "executing translated query");

    let mut response = db.client.query(&translated).await?;
    let mut rows: Vec<Value> = Vec::new();
    let statements = translated.matches(';').count().max(1);
    for index in 0..statements {
        let mut batch: Vec<Value> = response.take(index)?;
        rows.append(&mut batch);
    }
    Ok(Some((translated, rows)))
}

/// A deliberately narrow Cypher-to-SurrealQL translator. It accepts
/// single-node matches and single-hop MENTIONS / RELATES_TO traversals with
/// simple WHERE conditions, and refuses everything else so unvetted model
/// output never reaches the store.
pub mod translate {
    /// Node labels the translator knows, with their backing tables.
    const LABELS: &[(&str, &str)] = &[
        ("Chunk", "chunk"),
        ("Entity", "entity"),
        ("Product", "product"),
        ("Source", "source"),
    ];

    const EDGES: &[(&str, &str)] = &[("MENTIONS", "mentions"), ("RELATES_TO", "relates_to")];

    fn table_for_label(label: &str) -> Option<&'static str> {
        LABELS.iter().find(|(l, _)| l.eq_ignore_ascii_case(label)).map(|(_, t)| *t)
    }

    fn table_for_edge(edge: &str) -> Option<&'static str> {
        EDGES.iter().find(|(e, _)| e.eq_ignore_ascii_case(edge)).map(|(_, t)| *t)
    }

    fn fixed_fields(table: &str) -> &'static [&'static str] {
        match table {
            "source" => &["name", "content"],
            "chunk" => &["name", "content", "chunk_number", "source_description"],
            "entity" => &["name", "label", "description"],
            "product" => &["name", "content", "price", "sku", "category"],
            _ => &[],
        }
    }

    fn is_identifier(s: &str) -> bool {
        !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// Maps `var.prop` onto a store field expression, given the variable's
    /// table and an optional record-link prefix (`in` / `out` for hops).
    fn field_expr(table: &str, prop: &str, link: Option<&str>) -> Option<String> {
        if !is_identifier(prop) {
            return None;
        }
        let base = if prop.eq_ignore_ascii_case("uuid") {
            "id".to_string()
        } else if fixed_fields(table).contains(&prop) {
            prop.to_string()
        } else {
            format!("properties.`{prop}`")
        };
        Some(match link {
            Some(prefix) => format!("{prefix}.{base}"),
            None => base,
        })
    }

    struct Binding {
        var: String,
        table: &'static str,
        /// `in`/`out` when the variable is a hop endpoint.
        link: Option<&'static str>,
    }

    struct Branch {
        from_table: String,
        guards: Vec<String>,
        bindings: Vec<Binding>,
    }

    /// Parses `(var:Label)` returning (var, label, rest).
    fn parse_node(input: &str) -> Option<(String, String, &str)> {
        let input = input.trim_start();
        let rest = input.strip_prefix('(')?;
        let close = rest.find(')')?;
        let inner = rest.get(..close)?;
        let (var, label) = inner.split_once(':')?;
        let var = var.trim();
        let label = label.trim();
        if !is_identifier(var) || !is_identifier(label) {
            return None;
        }
        Some((var.to_string(), label.to_string(), rest.get(close + 1..)?))
    }

    /// Parses `-[:REL]->` returning (rel, rest).
    fn parse_edge(input: &str) -> Option<(String, &str)> {
        let input = input.trim_start();
        let rest = input.strip_prefix("-[:")?;
        let close = rest.find(']')?;
        let rel = rest.get(..close)?.trim();
        let rest = rest.get(close + 1..)?.trim_start();
        let rest = rest.strip_prefix("->")?;
        if !is_identifier(rel) {
            return None;
        }
        Some((rel.to_string(), rest))
    }

    fn parse_pattern(pattern: &str) -> Option<Branch> {
        let (var_a, label_a, rest) = parse_node(pattern)?;
        let table_a = table_for_label(&label_a)?;

        let rest_trimmed = rest.trim();
        if rest_trimmed.is_empty() {
            return Some(Branch {
                from_table: table_a.to_string(),
                guards: Vec::new(),
                bindings: vec![Binding { var: var_a, table: table_a, link: None }],
            });
        }

        let (rel, rest) = parse_edge(rest)?;
        let edge_table = table_for_edge(&rel)?;
        let (var_b, label_b, rest) = parse_node(rest)?;
        let table_b = table_for_label(&label_b)?;
        if !rest.trim().is_empty() || var_a == var_b {
            return None;
        }

        Some(Branch {
            from_table: edge_table.to_string(),
            guards: vec![
                format!("record::tb(in) = '{table_a}'"),
                format!("record::tb(out) = '{table_b}'"),
            ],
            bindings: vec![
                Binding { var: var_a, table: table_a, link: Some("in") },
                Binding { var: var_b, table: table_b, link: Some("out") },
            ],
        })
    }

    fn resolve_field(branch: &Branch, reference: &str) -> Option<String> {
        let (var, prop) = reference.trim().split_once('.')?;
        let binding = branch.bindings.iter().find(|b| b.var == var.trim())?;
        field_expr(binding.table, prop.trim(), binding.link)
    }

    /// Parses a quoted literal `'...'`, rejecting embedded quotes.
    fn parse_string_literal(input: &str) -> Option<String> {
        let inner = input.trim().strip_prefix('\'')?.strip_suffix('\'')?;
        if inner.contains('\'') || inner.contains('\\') {
            return None;
        }
        Some(inner.to_string())
    }

    fn translate_condition(branch: &Branch, condition: &str) -> Option<String> {
        let condition = condition.trim();
        let lowered = condition.to_lowercase();

        // toLower(x.prop) = toLower('v')  |  toLower(x.prop) CONTAINS toLower('v')
        if lowered.starts_with("tolower(") {
            let after = condition.get("toLower(".len()..)?;
            let close = after.find(')')?;
            let reference = after.get(..close)?;
            let field = resolve_field(branch, reference)?;
            let rest = after.get(close + 1..)?.trim();

            let (operator, rest) = if let Some(rest) = rest.strip_prefix('=') {
                ("=", rest)
            } else if lowered.contains(" contains ") {
                let rest = rest.get(rest.to_lowercase().find("contains")? + "contains".len()..)?;
                ("contains", rest)
            } else {
                return None;
            };

            let rest = rest.trim();
            let inner = rest.strip_prefix("toLower(")?.strip_suffix(')')?;
            let literal = parse_string_literal(inner)?;
            return Some(match operator {
                "=" => format!("string::lowercase({field}) = string::lowercase('{literal}')"),
                _ => format!("string::contains(string::lowercase({field}), string::lowercase('{literal}'))"),
            });
        }

        // x.prop <op> literal
        for operator in ["<=", ">=", "=", "<", ">"] {
            if let Some((left, right)) = condition.split_once(operator) {
                let field = resolve_field(branch, left)?;
                let right = right.trim();
                let value = if let Some(literal) = parse_string_literal(right) {
                    format!("'{literal}'")
                } else if right.parse::<f64>().is_ok() {
                    right.to_string()
                } else {
                    return None;
                };
                return Some(format!("{field} {operator} {value}"));
            }
        }

        None
    }

    fn translate_projection(branch: &Branch, projection: &str) -> Option<String> {
        let projection = projection.trim();
        let (reference, alias) = match projection.to_lowercase().find(" as ") {
            Some(position) => {
                let alias = projection.get(position + 4..)?.trim().to_string();
                if !is_identifier(&alias) {
                    return None;
                }
                (projection.get(..position)?.trim(), alias)
            }
            None => {
                let (_, prop) = projection.split_once('.')?;
                (projection, prop.trim().to_string())
            }
        };
        let field = resolve_field(branch, reference)?;
        Some(format!("{field} AS {alias}"))
    }

    fn translate_branch(branch_text: &str) -> Option<String> {
        let trimmed = branch_text.trim();
        let lowered = trimmed.to_lowercase();
        let rest = trimmed.get(lowered.find("match")? + "match".len()..)?;

        let (pattern_text, rest) = match rest.to_lowercase().find(" where ") {
            Some(position) => (rest.get(..position)?, rest.get(position..)?),
            None => {
                let position = rest.to_lowercase().find(" return ")?;
                (rest.get(..position)?, rest.get(position..)?)
            }
        };
        let branch = parse_pattern(pattern_text.trim())?;

        let rest_lowered = rest.to_lowercase();
        let (conditions_text, rest) = if rest_lowered.starts_with(" where ") {
            let return_position = rest_lowered.find(" return ")?;
            (Some(rest.get(" where ".len()..return_position)?), rest.get(return_position..)?)
        } else {
            (None, rest)
        };

        let rest = rest.get(" return ".len()..)?;
        let (projections_text, limit) = match rest.to_lowercase().find(" limit ") {
            Some(position) => {
                let limit: usize = rest.get(position + " limit ".len()..)?.trim().parse().ok()?;
                (rest.get(..position)?, Some(limit))
            }
            None => (rest, None),
        };

        let mut conditions: Vec<String> = branch.guards.clone();
        if let Some(text) = conditions_text {
            for condition in text.split(" AND ") {
                conditions.push(translate_condition(&branch, condition)?);
            }
        }

        let mut projections: Vec<String> = Vec::new();
        for projection in projections_text.split(',') {
            projections.push(translate_projection(&branch, projection)?);
        }
        if projections.is_empty() {
            return None;
        }

        let mut statement = format!("SELECT {} FROM {}", projections.join(", "), branch.from_table);
        if !conditions.is_empty() {
            statement.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
        }
        statement.push_str(&format!(" LIMIT {}", limit.unwrap_or(25)));
        statement.push(';');
        Some(statement)
    }

    /// Translates a generated query, or returns `None` when any part falls
    /// outside the supported subset.
    pub fn to_surql(cypher: &str) -> Option<String> {
        let normalized = cypher.replace('\n', " ");
        let mut statements = Vec::new();
        // split on UNION ALL case-insensitively
        let mut remaining = normalized.as_str();
        loop {
            match remaining.to_lowercase().find("union all") {
                Some(position) => {
                    statements.push(translate_branch(remaining.get(..position)?)?);
                    remaining = remaining.get(position + "union all".len()..)?;
                }
                None => {
                    statements.push(translate_branch(remaining)?);
                    break;
                }
            }
        }
        Some(statements.join(" "))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn single_node_equality_translates() {
            let surql = to_surql(
                "MATCH (p:Product) WHERE toLower(p.name) = toLower('Dell XPS 13') RETURN p.name, p.price",
            )
            .expect("translates");
            assert!(surql.contains("FROM product"));
            assert!(surql.contains("string::lowercase(name) = string::lowercase('Dell XPS 13')"));
            assert!(surql.contains("name AS name"));
            assert!(surql.contains("price AS price"));
        }

        #[test]
        fn contains_and_dynamic_property_translate() {
            let surql = to_surql(
                "MATCH (c:Chunk) WHERE toLower(c.content) CONTAINS toLower('honey') AND c.author = 'Milne' RETURN c.name LIMIT 5",
            )
            .expect("translates");
            assert!(surql.contains("string::contains(string::lowercase(content), string::lowercase('honey'))"));
            assert!(surql.contains("properties.`author` = 'Milne'"));
            assert!(surql.ends_with("LIMIT 5;"));
        }

        #[test]
        fn single_hop_translates_to_edge_table() {
            let surql = to_surql(
                "MATCH (c:Chunk)-[:MENTIONS]->(p:Product) WHERE toLower(p.name) = toLower('Dell XPS 13') RETURN c.name AS chunkName, p.name AS productName",
            )
            .expect("translates");
            assert!(surql.contains("FROM mentions"));
            assert!(surql.contains("record::tb(in) = 'chunk'"));
            assert!(surql.contains("record::tb(out) = 'product'"));
            assert!(surql.contains("in.name AS chunkName"));
            assert!(surql.contains("out.name AS productName"));
        }

        #[test]
        fn union_all_produces_two_statements() {
            let surql = to_surql(
                "MATCH (e:Entity) WHERE toLower(e.name) = toLower('Apex') RETURN e.name AS entityName \
                 UNION ALL \
                 MATCH (p:Product) WHERE toLower(p.name) = toLower('Apex') RETURN p.name AS entityName",
            )
            .expect("translates");
            assert_eq!(surql.matches("SELECT").count(), 2);
            assert!(surql.contains("FROM entity"));
            assert!(surql.contains("FROM product"));
        }

        #[test]
        fn numeric_comparison_translates() {
            let surql = to_surql("MATCH (p:Product) WHERE p.price < 1000 RETURN p.name").expect("translates");
            assert!(surql.contains("price < 1000"));
        }

        #[test]
        fn unsupported_shapes_are_refused() {
            assert!(to_surql("MATCH (a)-[:KNOWS*1..3]->(b) RETURN a").is_none());
            assert!(to_surql("MATCH (p:Product) DELETE p").is_none());
            assert!(to_surql("MATCH (x:Unknown) RETURN x.name").is_none());
            assert!(to_surql("CALL db.index.vector.queryNodes('idx', 5, $v)").is_none());
            assert!(to_surql("MATCH (p:Product) WHERE p.name = 'a''b' RETURN p.name").is_none());
        }
    }
}
