use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;
use uuid::Uuid;

use crate::{
    error::GraphRagError,
    storage::{db::SurrealDbClient, types::StoredObject},
};

fn thing(table: &str, id: &str) -> Thing {
    Thing::from((table, id))
}

/// `(Chunk)-[:MENTIONS]->(Entity|Product)` edge. Each mention carries its
/// own id and the sentence that evidences it; re-linking the same pair
/// bumps `last_seen_at` instead of stacking duplicate edges.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Mentions {
    pub id: Thing,
    #[serde(rename = "in")]
    pub in_: Thing,
    pub out: Thing,
    pub fact_sentence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Mentions {
    pub const TABLE: &'static str = "mentions";

    /// Ensures a mention edge between a chunk and its target node. Returns
    /// the edge's uuid and whether it was newly created.
    pub async fn upsert(
        chunk_id: &str,
        target_table: &str,
        target_id: &str,
        fact_sentence: Option<&str>,
        db: &SurrealDbClient,
    ) -> Result<(String, bool), GraphRagError> {
        let in_ = thing(crate::storage::types::chunk::Chunk::table_name(), chunk_id);
        let out = thing(target_table, target_id);

        let existing: Vec<Self> = db
            .client
            .query(format!(
                "SELECT * FROM {} WHERE in = $in AND out = $out",
                Self::TABLE
            ))
            .bind(("in", in_.clone()))
            .bind(("out", out.clone()))
            .await?
            .take(0)?;

        let now = Utc::now();
        if let Some(edge) = existing.into_iter().next() {
            db.client
                .query("UPDATE $edge SET last_seen_at = $now, fact_sentence = $fact")
                .bind(("edge", edge.id.clone()))
                .bind(("now", now))
                .bind(("fact", fact_sentence.map(str::to_string)))
                .await?
                .check()?;
            return Ok((edge.id.id.to_raw(), false));
        }

        let edge_uuid = Uuid::new_v4().to_string();
        db.client
            .query(format!(
                "RELATE $in->{table}->$out CONTENT {{
                    id: $edge,
                    fact_sentence: $fact,
                    created_at: $now,
                    last_seen_at: $now
                }};",
                table = Self::TABLE,
            ))
            .bind(("in", in_))
            .bind(("out", out))
            .bind(("edge", thing(Self::TABLE, &edge_uuid)))
            .bind(("fact", fact_sentence.map(str::to_string)))
            .bind(("now", now))
            .await?
            .check()?;

        Ok((edge_uuid, true))
    }

    /// Fact sentences already recorded for mentions of `target`, used to
    /// give the resolver's dedup prompt context about each candidate.
    pub async fn facts_for_target(
        target_table: &str,
        target_id: &str,
        limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<String>, GraphRagError> {
        #[derive(Deserialize)]
        struct Row {
            fact_sentence: Option<String>,
        }

        let rows: Vec<Row> = db
            .client
            .query(format!(
                "SELECT fact_sentence FROM {} WHERE out = $target AND fact_sentence != NONE LIMIT {limit}",
                Self::TABLE
            ))
            .bind(("target", thing(target_table, target_id)))
            .await?
            .take(0)?;

        Ok(rows.into_iter().filter_map(|r| r.fact_sentence).collect())
    }
}

/// `(Entity|Product)-[:RELATES_TO]->(Entity|Product)` edge carrying an
/// extracted fact. The merge key is `(in, out, relation_label,
/// fact_sentence)`; re-extraction of the same fact bumps `last_seen_at`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RelatesTo {
    pub id: Thing,
    #[serde(rename = "in")]
    pub in_: Thing,
    pub out: Thing,
    pub relation_label: String,
    pub fact_sentence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_embedding: Option<Vec<f32>>,
    /// The chunk this fact was extracted from, for provenance and for the
    /// source-deletion cascade.
    pub source_chunk_id: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl RelatesTo {
    pub const TABLE: &'static str = "relates_to";

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        src_table: &str,
        src_id: &str,
        dst_table: &str,
        dst_id: &str,
        relation_label: &str,
        fact_sentence: &str,
        source_chunk_id: &str,
        edge_uuid: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<(String, bool), GraphRagError> {
        let in_ = thing(src_table, src_id);
        let out = thing(dst_table, dst_id);

        let existing: Vec<Self> = db
            .client
            .query(format!(
                "SELECT * FROM {} WHERE in = $in AND out = $out AND relation_label = $label AND fact_sentence = $fact",
                Self::TABLE
            ))
            .bind(("in", in_.clone()))
            .bind(("out", out.clone()))
            .bind(("label", relation_label.to_owned()))
            .bind(("fact", fact_sentence.to_owned()))
            .await?
            .take(0)?;

        let now = Utc::now();
        if let Some(edge) = existing.into_iter().next() {
            db.client
                .query("UPDATE $edge SET last_seen_at = $now")
                .bind(("edge", edge.id.clone()))
                .bind(("now", now))
                .await?
                .check()?;
            return Ok((edge.id.id.to_raw(), false));
        }

        let edge_uuid = edge_uuid.unwrap_or_else(|| Uuid::new_v4().to_string());
        db.client
            .query(format!(
                "RELATE $in->{table}->$out CONTENT {{
                    id: $edge,
                    relation_label: $label,
                    fact_sentence: $fact,
                    source_chunk_id: $chunk,
                    created_at: $now,
                    last_seen_at: $now
                }};",
                table = Self::TABLE,
            ))
            .bind(("in", in_))
            .bind(("out", out))
            .bind(("edge", thing(Self::TABLE, &edge_uuid)))
            .bind(("label", relation_label.to_owned()))
            .bind(("fact", fact_sentence.to_owned()))
            .bind(("chunk", source_chunk_id.to_owned()))
            .bind(("now", now))
            .await?
            .check()?;

        Ok((edge_uuid, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mention_upsert_creates_then_refreshes_last_seen_at() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let (first_uuid, created) =
            Mentions::upsert("c1", "entity", "e1", Some("chunk c1 mentions e1"), &db)
                .await
                .expect("first upsert");
        assert!(created);

        let (second_uuid, created_again) =
            Mentions::upsert("c1", "entity", "e1", Some("seen again"), &db)
                .await
                .expect("second upsert");
        assert!(!created_again);
        assert_eq!(first_uuid, second_uuid);

        let edges: Vec<Mentions> = db.client.query("SELECT * FROM mentions").await.unwrap().take(0).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].fact_sentence.as_deref(), Some("seen again"));
        assert!(edges[0].last_seen_at >= edges[0].created_at);
    }

    #[tokio::test]
    async fn relates_to_merges_on_full_fact_key() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let (_, created) = RelatesTo::upsert(
            "entity", "a", "entity", "b", "ate", "Pooh ate honey.", "chunk-1", None, &db,
        )
        .await
        .unwrap();
        assert!(created);

        // same fact again -> merged
        let (_, created_again) = RelatesTo::upsert(
            "entity", "a", "entity", "b", "ate", "Pooh ate honey.", "chunk-1", None, &db,
        )
        .await
        .unwrap();
        assert!(!created_again);

        // a different fact sentence between the same pair is a new edge
        let (_, created_new_fact) = RelatesTo::upsert(
            "entity", "a", "entity", "b", "ate", "Pooh ate all the honey at once.", "chunk-1", None, &db,
        )
        .await
        .unwrap();
        assert!(created_new_fact);

        let edges: Vec<RelatesTo> = db.client.query("SELECT * FROM relates_to").await.unwrap().take(0).unwrap();
        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn facts_for_target_collects_recorded_sentences() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        Mentions::upsert("c1", "entity", "e1", Some("first sighting"), &db).await.unwrap();
        Mentions::upsert("c2", "entity", "e1", Some("second sighting"), &db).await.unwrap();
        Mentions::upsert("c3", "entity", "other", Some("unrelated"), &db).await.unwrap();

        let mut facts = Mentions::facts_for_target("entity", "e1", 10, &db).await.unwrap();
        facts.sort();
        assert_eq!(facts, vec!["first sighting".to_string(), "second sighting".to_string()]);
    }
}
