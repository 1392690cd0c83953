use crate::{error::GraphRagError, storage::db::SurrealDbClient, stored_object};
use uuid::Uuid;

stored_object!(Chunk, "chunk", {
    source_id: String,
    source_description: String,
    name: String,
    content: String,
    chunk_number: Option<u32>,
    /// Reverse edge of the chunk-ordering chain: points at the chunk with
    /// `chunk_number - 1` in the same source, when one exists.
    previous_chunk_id: Option<String>,
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_embedding: Option<Vec<f32>>
});

impl Chunk {
    /// Fallback id when the caller supplies none: derived from the chunk's
    /// position and content so re-ingesting the same source converges on
    /// the same records instead of duplicating them.
    pub fn derive_id(source_id: &str, chunk_number: Option<u32>, content: &str) -> String {
        let key = match chunk_number {
            Some(number) => format!("{source_id}#{number}"),
            None => format!("{source_id}#{content}"),
        };
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Option<String>,
        source_id: String,
        source_description: String,
        name: String,
        content: String,
        chunk_number: Option<u32>,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            created_at: now,
            updated_at: now,
            source_id,
            source_description,
            name,
            content,
            chunk_number,
            previous_chunk_id: None,
            properties,
            content_embedding: None,
        }
    }

    /// Merges the chunk on its id. On a re-run the content, name and dynamic
    /// properties are refreshed; `created_at` and any stored embedding
    /// survive. The ordering link to the previous chunk is resolved here so
    /// chains stay intact regardless of which item the caller re-ingests.
    pub async fn upsert(mut self, db: &SurrealDbClient) -> Result<Self, GraphRagError> {
        if let Some(number) = self.chunk_number {
            if number > 1 {
                self.previous_chunk_id =
                    Self::find_by_source_and_number(&self.source_id, number - 1, db)
                        .await?
                        .map(|prev| prev.id);
            }
        }

        let existing: Option<Self> = db.get_item(&self.id).await?;
        if let Some(previous) = existing {
            self.created_at = previous.created_at;
            self.content_embedding = previous.content_embedding;
            self.updated_at = chrono::Utc::now();
            let _updated: Option<Self> = db
                .client
                .update((Self::table_name(), self.id.as_str()))
                .content(self.clone())
                .await?;
        } else {
            db.store_item(self.clone()).await?;
        }
        Ok(self)
    }

    pub async fn find_by_source_and_number(
        source_id: &str,
        chunk_number: u32,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, GraphRagError> {
        let rows: Vec<Self> = db
            .client
            .query(format!(
                "SELECT * FROM {} WHERE source_id = $source_id AND chunk_number = $number LIMIT 1",
                Self::table_name()
            ))
            .bind(("source_id", source_id.to_owned()))
            .bind(("number", chunk_number))
            .await?
            .take(0)?;
        Ok(rows.into_iter().next())
    }

    pub async fn find_by_source_id(source_id: &str, db: &SurrealDbClient) -> Result<Vec<Self>, GraphRagError> {
        let rows: Vec<Self> = db
            .client
            .query(format!(
                "SELECT * FROM {} WHERE source_id = $source_id ORDER BY chunk_number ASC",
                Self::table_name()
            ))
            .bind(("source_id", source_id.to_owned()))
            .await?
            .take(0)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source: &str, number: u32, content: &str) -> Chunk {
        Chunk::new(
            None,
            source.into(),
            "test source".into(),
            format!("chunk {number}"),
            content.into(),
            Some(number),
            serde_json::Map::new(),
        )
    }

    #[tokio::test]
    async fn upsert_links_to_previous_chunk_by_number() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let first = chunk("source-1", 1, "first").upsert(&db).await.unwrap();
        let second = chunk("source-1", 2, "second").upsert(&db).await.unwrap();

        assert!(first.previous_chunk_id.is_none());
        assert_eq!(second.previous_chunk_id.as_deref(), Some(first.id.as_str()));
    }

    #[tokio::test]
    async fn upsert_skips_ordering_link_when_predecessor_missing() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let orphan = chunk("source-1", 5, "standalone").upsert(&db).await.unwrap();
        assert!(orphan.previous_chunk_id.is_none());
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_record_and_refreshes_content() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let id = Uuid::new_v4().to_string();
        let mut a = chunk("source-1", 1, "draft");
        a.id = id.clone();
        a.upsert(&db).await.unwrap();

        let mut b = chunk("source-1", 1, "final");
        b.id = id.clone();
        let merged = b.upsert(&db).await.unwrap();
        assert_eq!(merged.content, "final");

        let all: Vec<Chunk> = db.get_all_stored_items().await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
