use std::sync::Arc;

use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::GraphRagError,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk::Chunk,
            entity::Entity,
            product::Product,
            relationship::{Mentions, RelatesTo},
            source::Source,
            StoredObject,
        },
    },
};

/// Counters returned by a source-deletion cascade, so callers can report
/// exactly what was removed or demoted.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionCounters {
    pub sources: u64,
    pub chunks: u64,
    pub products: u64,
    pub products_demoted: u64,
    pub mentions_rels: u64,
    pub relates_to_rels: u64,
    pub entities: u64,
}

/// Counts of edges moved from an entity onto the product that replaced it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PromotionStats {
    pub incoming_rels_copied: u64,
    pub outgoing_rels_copied: u64,
}

/// Vector properties the store accepts, paired with their table. Anything
/// else passed to `set_embedding` is a programming error surfaced as
/// validation.
const EMBEDDING_PROPERTIES: &[(&str, &str)] = &[
    ("source", "content_embedding"),
    ("chunk", "content_embedding"),
    ("entity", "name_embedding"),
    ("product", "name_embedding"),
    ("product", "content_embedding"),
    ("mentions", "fact_embedding"),
    ("relates_to", "fact_embedding"),
];

/// Idempotent write surface over the graph store. Every method is one
/// parameterized operation (or one transaction, for the multi-step ones);
/// callers never compose raw queries.
#[derive(Clone)]
pub struct NodeManager {
    db: Arc<SurrealDbClient>,
    embedding_dimension: usize,
}

impl NodeManager {
    pub fn new(db: Arc<SurrealDbClient>, embedding_dimension: usize) -> Self {
        Self { db, embedding_dimension }
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }

    pub async fn upsert_source(
        &self,
        name: &str,
        content: Option<&str>,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(Source, bool), GraphRagError> {
        Source::upsert(name, content, properties, &self.db).await
    }

    pub async fn upsert_chunk(&self, chunk: Chunk) -> Result<Chunk, GraphRagError> {
        chunk.upsert(&self.db).await
    }

    pub async fn upsert_product(&self, product: Product) -> Result<Product, GraphRagError> {
        product.upsert(&self.db).await
    }

    pub async fn link_chunk_to_entity(
        &self,
        chunk_id: &str,
        entity_id: &str,
        fact_sentence: Option<&str>,
    ) -> Result<(String, bool), GraphRagError> {
        Mentions::upsert(chunk_id, Entity::table_name(), entity_id, fact_sentence, &self.db).await
    }

    pub async fn link_chunk_to_product(
        &self,
        chunk_id: &str,
        product_id: &str,
        fact_sentence: Option<&str>,
    ) -> Result<(String, bool), GraphRagError> {
        Mentions::upsert(chunk_id, Product::table_name(), product_id, fact_sentence, &self.db).await
    }

    pub async fn merge_or_create_entity(
        &self,
        name: &str,
        label: &str,
        description: Option<String>,
    ) -> Result<(Entity, bool), GraphRagError> {
        Entity::merge_or_create(name, label, description, &self.db).await
    }

    /// Records a `RELATES_TO` fact between two already-resolved nodes. The
    /// endpoints may be entities or products; `node_table_of` resolves which.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_relationship(
        &self,
        src_table: &str,
        src_id: &str,
        dst_table: &str,
        dst_id: &str,
        relation_label: &str,
        fact_sentence: &str,
        source_chunk_id: &str,
    ) -> Result<(String, bool), GraphRagError> {
        RelatesTo::upsert(
            src_table,
            src_id,
            dst_table,
            dst_id,
            relation_label,
            fact_sentence,
            source_chunk_id,
            None,
            &self.db,
        )
        .await
    }

    /// Writes a vector property onto a node or relationship. The
    /// `(table, property)` pair must be one of the known embedding slots and
    /// the vector must match the configured dimension; vectors are never
    /// truncated to fit.
    pub async fn set_embedding(
        &self,
        table: &str,
        id: &str,
        property: &str,
        vector: Vec<f32>,
    ) -> Result<bool, GraphRagError> {
        if !EMBEDDING_PROPERTIES.contains(&(table, property)) {
            return Err(GraphRagError::Validation(format!(
                "'{property}' is not an embedding property of table '{table}'"
            )));
        }
        if vector.len() != self.embedding_dimension {
            return Err(GraphRagError::Embedding(format!(
                "vector of length {} does not match configured dimension {}",
                vector.len(),
                self.embedding_dimension
            )));
        }

        let mut response = self
            .db
            .client
            .query(format!("UPDATE $node SET {property} = $vector RETURN VALUE id;"))
            .bind(("node", Thing::from((table, id))))
            .bind(("vector", vector))
            .await?;
        let updated: Vec<Thing> = response.take(0)?;
        Ok(!updated.is_empty())
    }

    /// Atomically replaces an entity with a freshly created product: every
    /// `MENTIONS` and `RELATES_TO` edge touching the entity is repointed at
    /// the product with its properties intact, then the entity is removed.
    #[instrument(skip(self, product), fields(entity_id = entity_id, product_id = %product.id))]
    pub async fn promote_entity_to_product(
        &self,
        entity_id: &str,
        product: Product,
    ) -> Result<(Product, PromotionStats), GraphRagError> {
        let _entity: Entity = self
            .db
            .get_item(entity_id)
            .await?
            .ok_or_else(|| GraphRagError::NotFound(format!("entity {entity_id}")))?;

        let entity_thing = Thing::from((Entity::table_name(), entity_id));
        let product_thing = Thing::from((Product::table_name(), product.id.as_str()));

        let stats = PromotionStats {
            incoming_rels_copied: self
                .count_where(
                    "SELECT count() AS total FROM mentions WHERE out = $node GROUP ALL",
                    &entity_thing,
                )
                .await?
                + self
                    .count_where(
                        "SELECT count() AS total FROM relates_to WHERE out = $node GROUP ALL",
                        &entity_thing,
                    )
                    .await?,
            outgoing_rels_copied: self
                .count_where(
                    "SELECT count() AS total FROM relates_to WHERE in = $node GROUP ALL",
                    &entity_thing,
                )
                .await?,
        };

        self.db
            .client
            .query("BEGIN TRANSACTION;")
            .query("CREATE $product CONTENT $product_record;")
            .query("UPDATE mentions SET out = $product WHERE out = $entity;")
            .query("UPDATE relates_to SET out = $product WHERE out = $entity;")
            .query("UPDATE relates_to SET in = $product WHERE in = $entity;")
            .query("DELETE $entity;")
            .query("COMMIT TRANSACTION;")
            .bind(("entity", entity_thing))
            .bind(("product", product_thing))
            .bind(("product_record", product.clone()))
            .await?
            .check()?;

        info!(
            incoming = stats.incoming_rels_copied,
            outgoing = stats.outgoing_rels_copied,
            "entity promoted to product"
        );
        Ok((product, stats))
    }

    /// Deletes a source and everything derived from it, in a fixed order:
    /// extracted facts, mentions, orphaned entities, products (demoting the
    /// externally referenced ones back to entities), chunks, and finally the
    /// source node itself. Decisions about what survives are computed
    /// against the state outside the deleted set, and all writes are applied
    /// in one transaction so a failure leaves the source untouched.
    #[instrument(skip(self), fields(source_id = source_id))]
    pub async fn delete_source_and_derived(&self, source_id: &str) -> Result<DeletionCounters, GraphRagError> {
        let mut counters = DeletionCounters::default();

        let chunks = Chunk::find_by_source_id(source_id, &self.db).await?;
        let products = Product::find_by_source_id(source_id, &self.db).await?;

        let chunk_ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let mut origin_things: Vec<Thing> = chunks
            .iter()
            .map(|c| Thing::from((Chunk::table_name(), c.id.as_str())))
            .collect();
        origin_things.extend(
            products
                .iter()
                .map(|p| Thing::from((Product::table_name(), p.id.as_str()))),
        );

        counters.chunks = chunks.len() as u64;

        // Neighbors one hop away that might be left orphaned once the
        // origins disappear.
        let potential_orphans = self.potential_orphan_entities(&origin_things, &chunk_ids).await?;

        counters.relates_to_rels = self
            .count_rows(
                "SELECT count() AS total FROM relates_to WHERE source_chunk_id INSIDE $chunk_ids GROUP ALL",
                ("chunk_ids", chunk_ids.clone()),
            )
            .await?;
        counters.mentions_rels = self
            .count_rows(
                "SELECT count() AS total FROM mentions WHERE in INSIDE $origins GROUP ALL",
                ("origins", origin_things.clone()),
            )
            .await?;

        let mut orphan_things: Vec<Thing> = Vec::new();
        for entity_id in &potential_orphans {
            if self.entity_referenced_outside(entity_id, &origin_things, &chunk_ids).await? {
                continue;
            }
            orphan_things.push(Thing::from((Entity::table_name(), entity_id.as_str())));
        }
        counters.entities = orphan_things.len() as u64;

        // Demotion plan for products still referenced from outside the
        // deleted set.
        struct Demotion {
            product_thing: Thing,
            entity: Entity,
        }
        let mut demotions: Vec<Demotion> = Vec::new();
        let mut products_to_delete: Vec<Thing> = Vec::new();
        for product in &products {
            let product_thing = Thing::from((Product::table_name(), product.id.as_str()));
            if self
                .product_referenced_outside(&product_thing, &origin_things, &chunk_ids)
                .await?
            {
                let label = product
                    .category
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or("DemotedProduct");
                let mut entity = Entity::new(product.name.clone(), label.to_string(), None);
                // A demoted product keeps a fresh identity: the promoted
                // entity's deterministic id may already be reused.
                entity.id = Uuid::new_v4().to_string();
                demotions.push(Demotion { product_thing, entity });
            } else {
                products_to_delete.push(product_thing);
            }
        }
        counters.products = products_to_delete.len() as u64;
        counters.products_demoted = demotions.len() as u64;

        let mut tx = self
            .db
            .client
            .query("BEGIN TRANSACTION;")
            .query("DELETE relates_to WHERE source_chunk_id INSIDE $tx_chunk_ids;")
            .query("DELETE mentions WHERE in INSIDE $tx_origins;")
            .bind(("tx_chunk_ids", chunk_ids.clone()))
            .bind(("tx_origins", origin_things.clone()));

        if !orphan_things.is_empty() {
            tx = tx
                .query("DELETE entity WHERE id INSIDE $tx_orphans;")
                .bind(("tx_orphans", orphan_things));
        }

        for (index, demotion) in demotions.into_iter().enumerate() {
            let entity_thing = Thing::from((Entity::table_name(), demotion.entity.id.as_str()));
            tx = tx
                .query(format!(
                    "CREATE $tx_demoted_thing_{index} CONTENT $tx_demoted_{index};"
                ))
                .query(format!(
                    "UPDATE mentions SET out = $tx_demoted_thing_{index} WHERE out = $tx_demoted_product_{index};"
                ))
                .query(format!(
                    "UPDATE relates_to SET out = $tx_demoted_thing_{index} WHERE out = $tx_demoted_product_{index};"
                ))
                .query(format!(
                    "UPDATE relates_to SET in = $tx_demoted_thing_{index} WHERE in = $tx_demoted_product_{index};"
                ))
                .query(format!("DELETE $tx_demoted_product_{index};"))
                .bind((format!("tx_demoted_thing_{index}"), entity_thing))
                .bind((format!("tx_demoted_{index}"), demotion.entity))
                .bind((format!("tx_demoted_product_{index}"), demotion.product_thing));
        }

        if !products_to_delete.is_empty() {
            tx = tx
                .query("DELETE product WHERE id INSIDE $tx_products;")
                .bind(("tx_products", products_to_delete));
        }

        tx = tx
            .query("DELETE chunk WHERE source_id = $tx_source_id;")
            .query("DELETE $tx_source;")
            .bind(("tx_source_id", source_id.to_owned()))
            .bind(("tx_source", Thing::from((Source::table_name(), source_id))));

        tx.query("COMMIT TRANSACTION;").await?.check()?;

        counters.sources = 1;
        info!(?counters, "source deletion committed");
        Ok(counters)
    }

    /// Removes every entity with no remaining `MENTIONS` pointing at it and
    /// no `RELATES_TO` on either side. Returns how many were deleted.
    pub async fn delete_orphaned_entities(&self) -> Result<u64, GraphRagError> {
        let entities: Vec<Entity> = self.db.get_all_stored_items().await?;

        let mut deleted = 0;
        for entity in entities {
            let entity_thing = Thing::from((Entity::table_name(), entity.id.as_str()));
            let mentioned = self
                .count_where(
                    "SELECT count() AS total FROM mentions WHERE out = $node GROUP ALL",
                    &entity_thing,
                )
                .await?;
            let related = self
                .count_where(
                    "SELECT count() AS total FROM relates_to WHERE in = $node OR out = $node GROUP ALL",
                    &entity_thing,
                )
                .await?;
            if mentioned == 0 && related == 0 {
                Entity::delete_by_id(&entity.id, &self.db).await?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(deleted, "orphaned entities removed");
        }
        Ok(deleted)
    }

    async fn potential_orphan_entities(
        &self,
        origins: &[Thing],
        chunk_ids: &[String],
    ) -> Result<Vec<String>, GraphRagError> {
        #[derive(Deserialize)]
        struct EdgeEndpoints {
            #[serde(rename = "in")]
            in_: Thing,
            out: Thing,
        }

        let mut candidates: Vec<String> = Vec::new();
        let mut push_if_entity = |thing: &Thing, candidates: &mut Vec<String>| {
            if thing.tb == Entity::table_name() {
                let id = thing.id.to_raw();
                if !candidates.contains(&id) {
                    candidates.push(id);
                }
            }
        };

        let mentioned: Vec<EdgeEndpoints> = self
            .db
            .client
            .query("SELECT in, out FROM mentions WHERE in INSIDE $origins")
            .bind(("origins", origins.to_vec()))
            .await?
            .take(0)?;
        for edge in &mentioned {
            push_if_entity(&edge.out, &mut candidates);
        }

        let related: Vec<EdgeEndpoints> = self
            .db
            .client
            .query("SELECT in, out FROM relates_to WHERE source_chunk_id INSIDE $chunk_ids OR in INSIDE $origins OR out INSIDE $origins")
            .bind(("chunk_ids", chunk_ids.to_vec()))
            .bind(("origins", origins.to_vec()))
            .await?
            .take(0)?;
        for edge in &related {
            push_if_entity(&edge.in_, &mut candidates);
            push_if_entity(&edge.out, &mut candidates);
        }

        Ok(candidates)
    }

    async fn entity_referenced_outside(
        &self,
        entity_id: &str,
        origins: &[Thing],
        chunk_ids: &[String],
    ) -> Result<bool, GraphRagError> {
        let entity_thing = Thing::from((Entity::table_name(), entity_id));

        let external_mentions: u64 = self
            .count_with_exclusions(
                "SELECT count() AS total FROM mentions WHERE out = $node AND in NOTINSIDE $origins GROUP ALL",
                &entity_thing,
                origins,
                chunk_ids,
            )
            .await?;
        if external_mentions > 0 {
            return Ok(true);
        }

        let external_rels: u64 = self
            .count_with_exclusions(
                "SELECT count() AS total FROM relates_to WHERE (in = $node OR out = $node) AND source_chunk_id NOTINSIDE $chunk_ids GROUP ALL",
                &entity_thing,
                origins,
                chunk_ids,
            )
            .await?;
        Ok(external_rels > 0)
    }

    async fn product_referenced_outside(
        &self,
        product_thing: &Thing,
        origins: &[Thing],
        chunk_ids: &[String],
    ) -> Result<bool, GraphRagError> {
        let external_mentions = self
            .count_with_exclusions(
                "SELECT count() AS total FROM mentions WHERE out = $node AND in NOTINSIDE $origins GROUP ALL",
                product_thing,
                origins,
                chunk_ids,
            )
            .await?;
        if external_mentions > 0 {
            return Ok(true);
        }

        let external_rels = self
            .count_with_exclusions(
                "SELECT count() AS total FROM relates_to WHERE out = $node AND source_chunk_id NOTINSIDE $chunk_ids GROUP ALL",
                product_thing,
                origins,
                chunk_ids,
            )
            .await?;
        Ok(external_rels > 0)
    }

    async fn count_with_exclusions(
        &self,
        sql: &str,
        node: &Thing,
        origins: &[Thing],
        chunk_ids: &[String],
    ) -> Result<u64, GraphRagError> {
        #[derive(Deserialize)]
        struct Count {
            total: i64,
        }

        let rows: Vec<Count> = self
            .db
            .client
            .query(sql)
            .bind(("node", node.clone()))
            .bind(("origins", origins.to_vec()))
            .bind(("chunk_ids", chunk_ids.to_vec()))
            .await?
            .take(0)?;
        Ok(rows.first().map(|c| c.total.max(0)).unwrap_or(0) as u64)
    }

    async fn count_where(&self, sql: &str, node: &Thing) -> Result<u64, GraphRagError> {
        #[derive(Deserialize)]
        struct Count {
            total: i64,
        }

        let rows: Vec<Count> = self
            .db
            .client
            .query(sql)
            .bind(("node", node.clone()))
            .await?
            .take(0)?;
        Ok(rows.first().map(|c| c.total.max(0)).unwrap_or(0) as u64)
    }

    async fn count_rows<P>(&self, sql: &str, bind: (&'static str, P)) -> Result<u64, GraphRagError>
    where
        P: serde::Serialize + Send + Sync + 'static,
    {
        #[derive(Deserialize)]
        struct Count {
            total: i64,
        }

        let rows: Vec<Count> = self.db.client.query(sql).bind(bind).await?.take(0)?;
        Ok(rows.first().map(|c| c.total.max(0)).unwrap_or(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> NodeManager {
        let db = SurrealDbClient::memory("node_manager", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        NodeManager::new(Arc::new(db), 4)
    }

    fn test_chunk(source_id: &str, number: u32, content: &str) -> Chunk {
        Chunk::new(
            None,
            source_id.into(),
            "test source".into(),
            format!("chunk {number}"),
            content.into(),
            Some(number),
            serde_json::Map::new(),
        )
    }

    #[tokio::test]
    async fn set_embedding_rejects_wrong_dimension() {
        let manager = manager().await;
        let (entity, _) = manager
            .merge_or_create_entity("Pooh", "Character", None)
            .await
            .unwrap();

        let err = manager
            .set_embedding("entity", &entity.id, "name_embedding", vec![0.1; 3])
            .await
            .unwrap_err();
        assert!(matches!(err, GraphRagError::Embedding(_)));

        let ok = manager
            .set_embedding("entity", &entity.id, "name_embedding", vec![0.1; 4])
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn set_embedding_rejects_unknown_property() {
        let manager = manager().await;
        let err = manager
            .set_embedding("entity", "whatever", "content", vec![0.1; 4])
            .await
            .unwrap_err();
        assert!(matches!(err, GraphRagError::Validation(_)));
    }

    #[tokio::test]
    async fn promotion_moves_every_edge_to_the_product() {
        let manager = manager().await;
        let (entity, _) = manager
            .merge_or_create_entity("Dell XPS 13", "Product", None)
            .await
            .unwrap();
        let (other, _) = manager
            .merge_or_create_entity("Dell", "Organization", None)
            .await
            .unwrap();

        let chunk = manager
            .upsert_chunk(test_chunk("source-1", 1, "The Dell XPS 13 is a popular ultrabook."))
            .await
            .unwrap();
        manager
            .link_chunk_to_entity(&chunk.id, &entity.id, Some("The Dell XPS 13 is a popular ultrabook."))
            .await
            .unwrap();
        manager
            .upsert_relationship(
                "entity",
                &entity.id,
                "entity",
                &other.id,
                "made_by",
                "The Dell XPS 13 is made by Dell.",
                &chunk.id,
            )
            .await
            .unwrap();

        let product = Product::new(
            None,
            "source-2".into(),
            "Dell XPS 13 (2024 Model 9340)".into(),
            Some("{\"brand\":\"Dell\"}".into()),
            None,
            Some("DEL-XPS13-9340".into()),
            Some("laptops".into()),
            serde_json::Map::new(),
        );
        let (product, stats) = manager.promote_entity_to_product(&entity.id, product).await.unwrap();
        assert_eq!(stats.incoming_rels_copied, 1);
        assert_eq!(stats.outgoing_rels_copied, 1);

        // entity is gone, edges now point at the product
        let gone: Option<Entity> = manager.db().get_item(&entity.id).await.unwrap();
        assert!(gone.is_none());

        let mentions: Vec<Mentions> = manager
            .db()
            .client
            .query("SELECT * FROM mentions")
            .await
            .unwrap()
            .take(0)
            .unwrap();
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].out.id.to_raw(), product.id);
        assert_eq!(
            mentions[0].fact_sentence.as_deref(),
            Some("The Dell XPS 13 is a popular ultrabook.")
        );

        let rels: Vec<RelatesTo> = manager
            .db()
            .client
            .query("SELECT * FROM relates_to")
            .await
            .unwrap()
            .take(0)
            .unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].in_.id.to_raw(), product.id);
    }

    #[tokio::test]
    async fn delete_source_removes_chunks_orphans_and_counts() {
        let manager = manager().await;
        let (source, _) = manager
            .upsert_source("story", None, serde_json::Map::new())
            .await
            .unwrap();

        let chunk = test_chunk(&source.id, 1, "Pooh ate honey.");
        let chunk = manager.upsert_chunk(chunk).await.unwrap();

        let (pooh, _) = manager.merge_or_create_entity("Pooh", "Character", None).await.unwrap();
        let (honey, _) = manager.merge_or_create_entity("honey", "Food", None).await.unwrap();
        manager.link_chunk_to_entity(&chunk.id, &pooh.id, Some("Pooh ate honey.")).await.unwrap();
        manager.link_chunk_to_entity(&chunk.id, &honey.id, Some("Pooh ate honey.")).await.unwrap();
        manager
            .upsert_relationship("entity", &pooh.id, "entity", &honey.id, "ate", "Pooh ate honey.", &chunk.id)
            .await
            .unwrap();

        let counters = manager.delete_source_and_derived(&source.id).await.unwrap();
        assert_eq!(counters.sources, 1);
        assert_eq!(counters.chunks, 1);
        assert_eq!(counters.mentions_rels, 2);
        assert_eq!(counters.relates_to_rels, 1);
        assert_eq!(counters.entities, 2);
        assert_eq!(counters.products, 0);
        assert_eq!(counters.products_demoted, 0);

        let remaining_entities: Vec<Entity> = manager.db().get_all_stored_items().await.unwrap();
        assert!(remaining_entities.is_empty());
        let remaining_chunks: Vec<Chunk> = manager.db().get_all_stored_items().await.unwrap();
        assert!(remaining_chunks.is_empty());
        let remaining_sources: Vec<Source> = manager.db().get_all_stored_items().await.unwrap();
        assert!(remaining_sources.is_empty());
    }

    #[tokio::test]
    async fn delete_source_demotes_externally_mentioned_product() {
        let manager = manager().await;

        // Source A declares the product.
        let (source_a, _) = manager.upsert_source("catalog", None, serde_json::Map::new()).await.unwrap();
        let product = Product::new(
            None,
            source_a.id.clone(),
            "Dell XPS 13".into(),
            Some("{\"brand\":\"Dell\"}".into()),
            Some(1199.0),
            Some("DEL-XPS13".into()),
            Some("laptops".into()),
            serde_json::Map::new(),
        );
        let product = manager.upsert_product(product).await.unwrap();

        // Source B's chunk mentions the product.
        let (source_b, _) = manager.upsert_source("review", None, serde_json::Map::new()).await.unwrap();
        let chunk_b = manager
            .upsert_chunk(test_chunk(&source_b.id, 1, "The Dell XPS 13 is great."))
            .await
            .unwrap();
        manager
            .link_chunk_to_product(&chunk_b.id, &product.id, Some("The Dell XPS 13 is great."))
            .await
            .unwrap();

        let counters = manager.delete_source_and_derived(&source_a.id).await.unwrap();
        assert_eq!(counters.products_demoted, 1);
        assert_eq!(counters.products, 0);

        // The product is gone; a demoted entity with its category as label
        // carries the external mention.
        let products: Vec<Product> = manager.db().get_all_stored_items().await.unwrap();
        assert!(products.is_empty());

        let entities: Vec<Entity> = manager.db().get_all_stored_items().await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "Dell XPS 13");
        assert_eq!(entities[0].label, "laptops");

        let mentions: Vec<Mentions> = manager
            .db()
            .client
            .query("SELECT * FROM mentions")
            .await
            .unwrap()
            .take(0)
            .unwrap();
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].out.id.to_raw(), entities[0].id);
    }

    #[tokio::test]
    async fn delete_orphaned_entities_keeps_connected_nodes() {
        let manager = manager().await;
        let (lonely, _) = manager.merge_or_create_entity("Lonely", "Concept", None).await.unwrap();
        let (connected, _) = manager.merge_or_create_entity("Connected", "Concept", None).await.unwrap();
        let (other, _) = manager.merge_or_create_entity("Other", "Concept", None).await.unwrap();
        manager
            .upsert_relationship("entity", &connected.id, "entity", &other.id, "knows", "Connected knows Other.", "c1")
            .await
            .unwrap();

        let deleted = manager.delete_orphaned_entities().await.unwrap();
        assert_eq!(deleted, 1);

        let gone: Option<Entity> = manager.db().get_item(&lonely.id).await.unwrap();
        assert!(gone.is_none());
        let kept: Option<Entity> = manager.db().get_item(&connected.id).await.unwrap();
        assert!(kept.is_some());
    }
}
