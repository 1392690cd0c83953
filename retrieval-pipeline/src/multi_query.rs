use chrono::Local;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use common::{usage::UsageTotals, utils::llm::LlmAgent};

#[derive(Debug, Deserialize)]
struct AlternativeQueriesList {
    alternative_queries: Vec<String>,
}

const MULTI_QUERY_SYSTEM_PROMPT: &str = "\
You rephrase a user's search query into alternative questions that could surface different relevant \
results from a knowledge base. Vary the vocabulary and angle, keep each alternative self-contained, \
and never change the user's intent. Use the provided current date to resolve time-relative phrasing \
like 'last year' or 'this weekend' into concrete terms where it helps.";

fn schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "alternative_queries": {
                "type": "array",
                "items": {"type": "string"}
            }
        },
        "required": ["alternative_queries"],
        "additionalProperties": false
    })
}

/// Generates up to `max_alternatives` unique paraphrases of the query,
/// case-insensitively deduplicated against the original. Any model failure
/// returns an empty list so search proceeds with the original query alone.
pub async fn generate_alternative_queries(
    agent: &LlmAgent,
    original_query: &str,
    max_alternatives: usize,
) -> (Vec<String>, UsageTotals) {
    if original_query.trim().is_empty() || max_alternatives == 0 {
        return (Vec::new(), UsageTotals::default());
    }

    let now = Local::now();
    let user_prompt = format!(
        "Generate up to {max_alternatives} alternative versions of this query.\n\
         Current date: {date} ({weekday})\n\nQUERY: {original_query}",
        date = now.format("%Y-%m-%d"),
        weekday = now.format("%A"),
    );

    match agent
        .generate_typed::<AlternativeQueriesList>(MULTI_QUERY_SYSTEM_PROMPT, &user_prompt, "alternative_queries", schema())
        .await
    {
        Ok((result, usage)) => {
            let unique = dedupe_alternatives(original_query, result.alternative_queries, max_alternatives);
            info!(count = unique.len(), "generated alternative queries");
            (unique, usage)
        }
        Err(err) => {
            warn!(error = %err, "multi-query generation failed, searching with the original query only");
            (Vec::new(), UsageTotals::default())
        }
    }
}

/// Keeps at most `max` non-empty paraphrases, case-insensitively distinct
/// from each other and from the original query.
fn dedupe_alternatives(original_query: &str, candidates: Vec<String>, max: usize) -> Vec<String> {
    let original_lowered = original_query.trim().to_lowercase();
    let mut unique: Vec<String> = Vec::new();
    for candidate in candidates {
        let trimmed = candidate.trim();
        if trimmed.is_empty() || trimmed.to_lowercase() == original_lowered {
            continue;
        }
        if unique.iter().any(|existing| existing.to_lowercase() == trimmed.to_lowercase()) {
            continue;
        }
        unique.push(trimmed.to_string());
        if unique.len() >= max {
            break;
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_the_original_and_case_duplicates() {
        let alternatives = vec![
            "Laptop for students".to_string(),
            "best laptops for college".to_string(),
            "BEST LAPTOPS FOR COLLEGE".to_string(),
            "  ".to_string(),
            "affordable student notebooks".to_string(),
        ];

        let unique = dedupe_alternatives("laptop for students", alternatives, 3);
        assert_eq!(unique, vec![
            "best laptops for college".to_string(),
            "affordable student notebooks".to_string(),
        ]);
    }

    #[test]
    fn caps_at_max_alternatives() {
        let alternatives = (0..10).map(|i| format!("alternative {i}")).collect();
        let unique = dedupe_alternatives("query", alternatives, 3);
        assert_eq!(unique.len(), 3);
    }
}
