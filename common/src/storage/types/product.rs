use crate::{error::GraphRagError, storage::db::SurrealDbClient, stored_object};
use uuid::Uuid;

stored_object!(Product, "product", {
    source_id: String,
    name: String,
    normalized_name: String,
    /// Canonical JSON string of the product record as supplied by the
    /// caller, or the raw text when the payload wasn't parseable JSON.
    content: Option<String>,
    price: Option<f64>,
    sku: Option<String>,
    category: Option<String>,
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name_embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_embedding: Option<Vec<f32>>
});

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct ProductVectorResult {
    pub product: Product,
    pub score: f32,
}

impl Product {
    /// Fallback id when the caller supplies none: derived from the source
    /// and normalized name so re-ingesting a catalog converges on the same
    /// records.
    pub fn derive_id(source_id: &str, normalized_name: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{source_id}#{normalized_name}").as_bytes()).to_string()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Option<String>,
        source_id: String,
        name: String,
        content: Option<String>,
        price: Option<f64>,
        sku: Option<String>,
        category: Option<String>,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let now = chrono::Utc::now();
        let normalized_name = crate::storage::types::entity::normalize_name(&name);
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            created_at: now,
            updated_at: now,
            source_id,
            normalized_name,
            name,
            content,
            price,
            sku,
            category,
            properties,
            name_embedding: None,
            content_embedding: None,
        }
    }

    /// Merges the product on its id, refreshing descriptive fields while
    /// keeping `created_at` and stored embeddings.
    pub async fn upsert(mut self, db: &SurrealDbClient) -> Result<Self, GraphRagError> {
        let existing: Option<Self> = db.get_item(&self.id).await?;
        if let Some(previous) = existing {
            self.created_at = previous.created_at;
            self.name_embedding = previous.name_embedding;
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

    pub async fn find_by_source_id(source_id: &str, db: &SurrealDbClient) -> Result<Vec<Self>, GraphRagError> {
        let rows: Vec<Self> = db
            .client
            .query(format!(
                "SELECT * FROM {} WHERE source_id = $source_id",
                Self::table_name()
            ))
            .bind(("source_id", source_id.to_owned()))
            .await?
            .take(0)?;
        Ok(rows)
    }

    /// Nearest products by name embedding, filtered to `min_score`. Product
    /// candidates join entity candidates in the resolver's shortlist so a
    /// mention of an already-promoted product links to it rather than
    /// re-creating an entity.
    pub async fn vector_search_by_name(
        take: usize,
        query_embedding: Vec<f32>,
        min_score: f32,
        db: &SurrealDbClient,
    ) -> Result<Vec<ProductVectorResult>, GraphRagError> {
        #[derive(serde::Deserialize)]
        struct Row {
            #[serde(flatten)]
            product: Product,
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
            .map(|r| ProductVectorResult { product: r.product, score: r.score })
            .filter(|r| r.score >= min_score)
            .collect())
    }
}
