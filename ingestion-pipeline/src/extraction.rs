use serde::Deserialize;
use serde_json::json;

use common::{error::GraphRagError, usage::UsageTotals, utils::llm::LlmAgent};

/// A candidate entity surfaced by the extractor, before resolution against
/// the graph.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(default = "default_label")]
    pub label: String,
    pub description: Option<String>,
    /// The exact sentence of the chunk that mentions the entity.
    pub fact_sentence_about_mention: Option<String>,
}

fn default_label() -> String {
    common::storage::types::entity::GENERIC_ENTITY_LABEL.to_string()
}

#[derive(Debug, Deserialize)]
struct ExtractionResult {
    entities: Vec<ExtractedEntity>,
}

pub const ENTITY_EXTRACTION_SYSTEM_PROMPT: &str = "\
You are an expert AI assistant tasked with identifying and extracting named entities from the provided text.
Your goal is to identify distinct real-world objects, concepts, persons, organizations, locations, products, etc., and represent them consistently.

Guidelines:
- Focus on extracting nouns or noun phrases that represent distinct entities.
- For each entity, provide the most complete and canonical name possible based on the information in the CURRENT TEXT. If only \"Pooh\" is mentioned, use \"Pooh\", but if \"Winnie-the-Pooh\" is mentioned, prefer that.
- If an entity is mentioned multiple times in the CURRENT TEXT, extract it only ONCE using its most representative or complete name.
- For the 'label', assign a general category (e.g., Person, Organization, Location, Product, Concept, Event, Artwork, Miscellaneous). Start with broad categories.
- Provide a brief contextual description for the entity based only on the provided CURRENT TEXT, and the exact sentence that mentions it.
- Do NOT extract attributes of entities as separate entities, and do NOT extract actions or verbs as entities.
- If the text is short and contains no clear entities, return an empty list.";

fn extraction_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "label": {"type": "string"},
                        "description": {"type": ["string", "null"]},
                        "fact_sentence_about_mention": {"type": ["string", "null"]}
                    },
                    "required": ["name", "label", "description", "fact_sentence_about_mention"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["entities"],
        "additionalProperties": false
    })
}

/// Extracts the entities mentioned in `text`, with the previous chunk (when
/// available) supplied as disambiguation context.
pub async fn extract_entities(
    agent: &LlmAgent,
    text: &str,
    context: Option<&str>,
) -> Result<(Vec<ExtractedEntity>, UsageTotals), GraphRagError> {
    let user_prompt = format!(
        "Please extract all distinct entities from the following text content.\n\
         If contextual information from previous chunks is provided, use it to help disambiguate the current text, \
         but primarily focus on entities explicitly mentioned in the CURRENT TEXT.\n\n\
         CONTEXT (optional, from previous text):\n{context}\n\n\
         CURRENT TEXT to extract entities from:\n{text}",
        context = context.unwrap_or("None."),
    );

    let (result, usage): (ExtractionResult, UsageTotals) = agent
        .generate_typed(
            ENTITY_EXTRACTION_SYSTEM_PROMPT,
            &user_prompt,
            "entity_extraction",
            extraction_schema(),
        )
        .await?;

    Ok((result.entities, usage))
}
