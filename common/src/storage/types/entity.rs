use crate::{error::GraphRagError, storage::db::SurrealDbClient, stored_object};
use uuid::Uuid;

const ENTITY_UUID_NAMESPACE: Uuid = Uuid::NAMESPACE_DNS;

/// Fallback label for candidates the extractor couldn't classify.
pub const GENERIC_ENTITY_LABEL: &str = "GenericEntity";

/// Normalizes a candidate name into the form used for entity identity
/// matching: trimmed, lowercased, internal whitespace collapsed. Two
/// candidate names that normalize to the same string and share a label are
/// the same entity.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

stored_object!(Entity, "entity", {
    name: String,
    normalized_name: String,
    label: String,
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name_embedding: Option<Vec<f32>>
});

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct EntityVectorResult {
    pub entity: Entity,
    pub score: f32,
}

impl Entity {
    /// Deterministic id for a new entity, derived from its identity key so
    /// that two concurrent ingests resolving the same `(normalized_name,
    /// label)` race toward the same record instead of splitting it.
    pub fn derive_id(normalized_name: &str, label: &str) -> String {
        Uuid::new_v5(&ENTITY_UUID_NAMESPACE, format!("{normalized_name}_{label}").as_bytes()).to_string()
    }

    pub fn new(name: String, label: String, description: Option<String>) -> Self {
        let now = chrono::Utc::now();
        let normalized_name = normalize_name(&name);
        Self {
            id: Self::derive_id(&normalized_name, &label),
            created_at: now,
            updated_at: now,
            name,
            normalized_name,
            label,
            description,
            name_embedding: None,
        }
    }

    /// Looks up an entity by its identity key `(normalized_name, label)`.
    pub async fn find_by_identity(
        normalized_name: &str,
        label: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, GraphRagError> {
        let rows: Vec<Self> = db
            .client
            .query(format!(
                "SELECT * FROM {} WHERE normalized_name = $normalized_name AND label = $label LIMIT 1",
                Self::table_name()
            ))
            .bind(("normalized_name", normalized_name.to_owned()))
            .bind(("label", label.to_owned()))
            .await?
            .take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Finds the entity by identity key, or creates it. Returns the record
    /// plus whether it was newly created; a matched record only has its
    /// `updated_at` bumped, so losers of a concurrent resolution race leave
    /// the winner's data intact.
    pub async fn merge_or_create(
        name: &str,
        label: &str,
        description: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<(Self, bool), GraphRagError> {
        let normalized = normalize_name(name);
        if let Some(mut existing) = Self::find_by_identity(&normalized, label, db).await? {
            existing.updated_at = chrono::Utc::now();
            db.client
                .query(format!(
                    "UPDATE type::thing('{table}', $id) SET updated_at = $now",
                    table = Self::table_name()
                ))
                .bind(("id", existing.id.clone()))
                .bind(("now", existing.updated_at))
                .await?
                .check()?;
            return Ok((existing, false));
        }

        let entity = Self::new(name.to_string(), label.to_string(), description);
        db.store_item(entity.clone()).await?;
        Ok((entity, true))
    }

    /// Replaces the display name with a longer canonical surface form. The
    /// normalized identity key is left untouched so the record keeps
    /// matching future mentions.
    pub async fn update_name(id: &str, new_name: &str, db: &SurrealDbClient) -> Result<(), GraphRagError> {
        db.client
            .query(format!(
                "UPDATE type::thing('{table}', $id) SET name = $name, updated_at = time::now()",
                table = Self::table_name()
            ))
            .bind(("id", id.to_owned()))
            .bind(("name", new_name.to_owned()))
            .await?
            .check()?;
        Ok(())
    }

    /// Nearest entities by name embedding, filtered to `min_score`. Used by
    /// the resolver to shortlist duplicate candidates.
    pub async fn vector_search_by_name(
        take: usize,
        query_embedding: Vec<f32>,
        min_score: f32,
        db: &SurrealDbClient,
    ) -> Result<Vec<EntityVectorResult>, GraphRagError> {
        #[derive(serde::Deserialize)]
        struct Row {
            #[serde(flatten)]
            entity: Entity,
            score: f32,
        }

        let sql = format!(
            r#"
            SELECT *, vector::similarity::cosine(name_embedding, $embedding) AS score
            FROM {table}
            WHERE name_embedding != NONE
              AND name_embedding <|{take},100|> $embedding
            ORDER BY score DESC
            LIMIT {take};
            "#,
            table = Self::table_name(),
        );

        let rows: Vec<Row> = db.query(&sql).bind(("embedding", query_embedding)).await?.take(0)?;

        Ok(rows
            .into_iter()
            .map(|r| EntityVectorResult { entity: r.entity, score: r.score })
            .filter(|r| r.score >= min_score)
            .collect())
    }

    pub async fn delete_by_id(id: &str, db: &SurrealDbClient) -> Result<(), GraphRagError> {
        db.delete_item::<Self>(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_name_collapses_case_and_whitespace() {
        assert_eq!(normalize_name("  Marie   Curie "), "marie curie");
        assert_eq!(normalize_name("Marie Curie"), normalize_name("marie  curie"));
    }

    #[test]
    fn derive_id_depends_on_both_name_and_label() {
        let as_person = Entity::derive_id("mercury", "Person");
        let as_planet = Entity::derive_id("mercury", "Planet");
        assert_ne!(as_person, as_planet);
        assert_eq!(as_person, Entity::derive_id("mercury", "Person"));
    }

    #[tokio::test]
    async fn merge_or_create_is_idempotent_on_identity_key() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let (first, created_first) = Entity::merge_or_create("Marie Curie", "Person", None, &db)
            .await
            .unwrap();
        assert!(created_first);

        let (second, created_second) = Entity::merge_or_create("marie  curie", "Person", None, &db)
            .await
            .unwrap();
        assert!(!created_second);
        assert_eq!(first.id, second.id);

        let all: Vec<Entity> = db.get_all_stored_items().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn update_name_keeps_identity_key() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let (entity, _) = Entity::merge_or_create("Pooh", "Character", None, &db).await.unwrap();
        Entity::update_name(&entity.id, "Winnie-the-Pooh", &db).await.unwrap();

        let reloaded: Entity = db.get_item(&entity.id).await.unwrap().expect("entity exists");
        assert_eq!(reloaded.name, "Winnie-the-Pooh");
        assert_eq!(reloaded.normalized_name, "pooh");
    }
}
