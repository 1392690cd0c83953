use uuid::Uuid;

use crate::{error::GraphRagError, storage::db::SurrealDbClient, stored_object};

/// Namespace used to derive a `Source`'s id from its caller-supplied name,
/// so re-ingesting the same source always resolves to the same node instead
/// of creating a duplicate.
const SOURCE_UUID_NAMESPACE: Uuid = Uuid::NAMESPACE_DNS;

stored_object!(Source, "source", {
    name: String,
    content: Option<String>,
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_embedding: Option<Vec<f32>>
});

impl Source {
    /// Deterministic id: the same source name always produces the same
    /// `Source.id`, making `upsert` idempotent without a read-before-write
    /// race on the unique name index.
    pub fn derive_id(name: &str) -> String {
        Uuid::new_v5(&SOURCE_UUID_NAMESPACE, name.as_bytes()).to_string()
    }

    pub fn new(
        name: String,
        content: Option<String>,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Self::derive_id(&name),
            created_at: now,
            updated_at: now,
            name,
            content,
            properties,
            content_embedding: None,
        }
    }

    /// Creates the source if absent, or refreshes its dynamic properties if
    /// one with this name already exists. `content` is only written on
    /// create; dynamic properties always overwrite. Returns the resulting
    /// record and whether it was newly created.
    pub async fn upsert(
        name: &str,
        content: Option<&str>,
        properties: serde_json::Map<String, serde_json::Value>,
        db: &SurrealDbClient,
    ) -> Result<(Self, bool), GraphRagError> {
        let id = Self::derive_id(name);
        let existing: Option<Self> = db.get_item(&id).await?;

        if let Some(mut source) = existing {
            source.properties = properties;
            source.updated_at = chrono::Utc::now();
            let _updated: Option<Self> = db
                .client
                .update((Self::table_name(), id.as_str()))
                .content(source.clone())
                .await?;
            return Ok((source, false));
        }

        let source = Self::new(name.to_string(), content.map(str::to_string), properties);
        db.store_item(source.clone()).await?;
        Ok((source, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_id_is_stable_for_same_name() {
        let a = Source::derive_id("episode-1");
        let b = Source::derive_id("episode-1");
        assert_eq!(a, b);
    }

    #[test]
    fn derive_id_differs_for_different_names() {
        assert_ne!(Source::derive_id("doc-1"), Source::derive_id("doc-2"));
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_overwrites_dynamic_properties() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let mut props = serde_json::Map::new();
        props.insert("author".into(), serde_json::json!("A. A. Milne"));
        let (first, created_first) = Source::upsert("pooh-stories", Some("full text"), props, &db)
            .await
            .expect("first upsert");
        assert!(created_first);
        assert_eq!(first.content.as_deref(), Some("full text"));

        let mut new_props = serde_json::Map::new();
        new_props.insert("author".into(), serde_json::json!("Milne"));
        new_props.insert("year".into(), serde_json::json!(1926));
        let (second, created_second) = Source::upsert("pooh-stories", None, new_props, &db)
            .await
            .expect("second upsert");
        assert!(!created_second);
        assert_eq!(first.id, second.id);
        assert_eq!(second.properties.get("year"), Some(&serde_json::json!(1926)));
        // content set on create survives a later merge that carries none
        assert_eq!(second.content.as_deref(), Some("full text"));

        let all: Vec<Source> = db.get_all_stored_items().await.expect("select all");
        assert_eq!(all.len(), 1);
    }
}
