use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use common::utils::properties::normalize_property_bag;

/// Whether an ingestion item materializes as a text chunk or a structured
/// product record. The caller declares this; the system never auto-detects
/// embedded JSON inside chunk text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeTypeHint {
    #[default]
    Chunk,
    Product,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentTypeHint {
    #[default]
    Text,
    Json,
}

/// One item of a source's `documents` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInput {
    pub page_content: String,
    #[serde(default)]
    pub node_type: NodeTypeHint,
    #[serde(default)]
    pub content_type: ContentTypeHint,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Key attributes a product-entity promotion match is judged against.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProductAttributes {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub release_year: Option<i32>,
}

impl ProductAttributes {
    pub fn is_empty(&self) -> bool {
        self.brand.is_none() && self.sku.is_none() && self.category.is_none() && self.release_year.is_none()
    }
}

/// A chunk item with its identifiers separated out of the metadata bag.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub uuid: Option<String>,
    pub name: String,
    pub content: String,
    pub chunk_number: Option<u32>,
    pub properties: Map<String, Value>,
}

/// A product item after JSON normalization: canonical name resolved, key
/// attributes pulled out, every JSON field merged into the property bag.
#[derive(Debug, Clone)]
pub struct ProductPayload {
    pub uuid: Option<String>,
    pub name: String,
    /// Canonical JSON string when the payload parsed, raw text otherwise.
    pub content: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub attributes: ProductAttributes,
    pub properties: Map<String, Value>,
}

/// Metadata keys that name the item rather than describe it; consumed while
/// building payloads so they never land in the dynamic property bag.
const CHUNK_META_KEYS: &[&str] = &["chunk_uuid", "name", "chunk_number"];

fn take_string(bag: &mut Map<String, Value>, key: &str) -> Option<String> {
    bag.remove(key).and_then(|v| match v {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    })
}

fn fallback_name(content: &str) -> String {
    if content.chars().count() > 50 {
        let prefix: String = content.chars().take(50).collect();
        format!("{prefix}...")
    } else {
        content.to_string()
    }
}

impl ChunkPayload {
    pub fn from_document(document: DocumentInput) -> Self {
        let mut metadata = document.metadata;
        let uuid = take_string(&mut metadata, "chunk_uuid");
        let name = take_string(&mut metadata, "name").unwrap_or_else(|| fallback_name(&document.page_content));
        let chunk_number = metadata
            .remove("chunk_number")
            .and_then(|v| v.as_u64())
            .and_then(|n| u32::try_from(n).ok());

        for key in CHUNK_META_KEYS {
            metadata.remove(*key);
        }

        Self {
            uuid,
            name,
            content: document.page_content,
            chunk_number,
            properties: normalize_property_bag(metadata),
        }
    }
}

/// JSON keys tried, in priority order, when deriving a product's canonical
/// name from its record.
const PRODUCT_NAME_KEYS: &[&str] = &["productName", "title", "item_name", "name"];

impl ProductPayload {
    /// Builds a product payload from a document. For `content_type = json`
    /// the page content is parsed and its fields merged over the metadata
    /// bag; unparseable JSON is logged and degrades to treating the raw text
    /// as the product description.
    pub fn from_document(document: DocumentInput) -> Self {
        let mut metadata = document.metadata;
        let uuid = take_string(&mut metadata, "chunk_uuid");
        let mut name = take_string(&mut metadata, "name");
        let mut description = take_string(&mut metadata, "description");
        let mut bag = metadata;

        let content = document.page_content;
        if document.content_type == ContentTypeHint::Json {
            match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(fields)) => {
                    for key in PRODUCT_NAME_KEYS {
                        if let Some(candidate) = fields.get(*key).and_then(Value::as_str) {
                            if !candidate.is_empty() {
                                name = Some(candidate.to_string());
                                break;
                            }
                        }
                    }
                    if let Some(desc) = fields.get("description").and_then(Value::as_str) {
                        description = Some(desc.to_string());
                    }
                    for (key, value) in fields {
                        bag.insert(key, value);
                    }
                }
                Ok(_) => {
                    warn!("product payload is JSON but not an object, treating as text");
                    description.get_or_insert_with(|| content.clone());
                }
                Err(err) => {
                    warn!(error = %err, "product payload failed to parse as JSON, treating as text");
                    description.get_or_insert_with(|| content.clone());
                }
            }
        } else if description.is_none() {
            description = Some(content.clone());
        }

        let price = bag.get("price").and_then(Value::as_f64);
        let attributes = ProductAttributes {
            brand: bag.get("brand").and_then(Value::as_str).map(str::to_string),
            sku: bag.get("sku").and_then(Value::as_str).map(str::to_string),
            category: bag.get("category").and_then(Value::as_str).map(str::to_string),
            release_year: bag
                .get("release_year")
                .and_then(Value::as_i64)
                .and_then(|y| i32::try_from(y).ok()),
        };

        Self {
            uuid,
            name: name.unwrap_or_else(|| "Unknown Product".to_string()),
            content,
            description,
            price,
            attributes,
            properties: normalize_property_bag(bag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(content: &str, content_type: ContentTypeHint, metadata: Value) -> DocumentInput {
        DocumentInput {
            page_content: content.to_string(),
            node_type: NodeTypeHint::Product,
            content_type,
            metadata: metadata.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn chunk_payload_pulls_identifiers_out_of_metadata() {
        let document = DocumentInput {
            page_content: "Pooh went to visit Rabbit.".into(),
            node_type: NodeTypeHint::Chunk,
            content_type: ContentTypeHint::Text,
            metadata: json!({"chunk_uuid": "c-1", "name": "Visit", "chunk_number": 2, "mood": "cheerful"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        };

        let payload = ChunkPayload::from_document(document);
        assert_eq!(payload.uuid.as_deref(), Some("c-1"));
        assert_eq!(payload.name, "Visit");
        assert_eq!(payload.chunk_number, Some(2));
        assert_eq!(payload.properties.get("mood"), Some(&json!("cheerful")));
        assert!(payload.properties.get("chunk_number").is_none());
    }

    #[test]
    fn chunk_payload_falls_back_to_content_prefix_for_name() {
        let long = "x".repeat(80);
        let payload = ChunkPayload::from_document(DocumentInput {
            page_content: long,
            node_type: NodeTypeHint::Chunk,
            content_type: ContentTypeHint::Text,
            metadata: Map::new(),
        });
        assert!(payload.name.ends_with("..."));
        assert_eq!(payload.name.chars().count(), 53);
    }

    #[test]
    fn product_name_derivation_follows_priority_order() {
        let payload = ProductPayload::from_document(doc(
            r#"{"title": "Fallback Title", "productName": "Dell XPS 13 (2024 Model 9340)", "brand": "Dell", "sku": "DEL-XPS13-9340", "price": 1499.0}"#,
            ContentTypeHint::Json,
            json!({}),
        ));

        assert_eq!(payload.name, "Dell XPS 13 (2024 Model 9340)");
        assert_eq!(payload.attributes.brand.as_deref(), Some("Dell"));
        assert_eq!(payload.attributes.sku.as_deref(), Some("DEL-XPS13-9340"));
        assert_eq!(payload.price, Some(1499.0));
        assert_eq!(payload.properties.get("productName"), Some(&json!("Dell XPS 13 (2024 Model 9340)")));
    }

    #[test]
    fn unparseable_json_degrades_to_text_description() {
        let payload = ProductPayload::from_document(doc(
            "not json at all {",
            ContentTypeHint::Json,
            json!({"name": "Mystery Gadget"}),
        ));

        assert_eq!(payload.name, "Mystery Gadget");
        assert_eq!(payload.description.as_deref(), Some("not json at all {"));
        assert_eq!(payload.content, "not json at all {");
    }

    #[test]
    fn nested_json_fields_become_strings_in_the_property_bag() {
        let payload = ProductPayload::from_document(doc(
            r#"{"productName": "Widget", "specs": {"weight": "1kg"}}"#,
            ContentTypeHint::Json,
            json!({}),
        ));

        let specs = payload.properties.get("specs").and_then(Value::as_str).expect("stringified");
        assert!(specs.contains("weight"));
    }
}
