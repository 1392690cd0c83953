use text_splitter::{ChunkConfig, TextSplitter};
use tokenizers::Tokenizer;

use common::error::GraphRagError;

/// Splits a document's content into token-bounded chunks using the
/// configured tokenizer as the size measure, so chunk boundaries line up
/// with what the embedding and LLM models actually count against their
/// context windows.
pub fn split_into_chunks(content: &str, tokenizer: &Tokenizer, min_tokens: usize, max_tokens: usize) -> Vec<String> {
    let capacity = min_tokens..=max_tokens.max(min_tokens);
    let config = ChunkConfig::new(capacity).with_sizer(tokenizer);
    let splitter = TextSplitter::new(config);
    splitter.chunks(content).map(str::to_string).collect()
}

/// Loads the tokenizer used to size chunks.
pub async fn load_tokenizer(model_identifier: &str) -> Result<Tokenizer, GraphRagError> {
    Tokenizer::from_pretrained(model_identifier, None)
        .map_err(|err| GraphRagError::Internal(format!("failed to load tokenizer {model_identifier}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_long_content_into_multiple_chunks() {
        // Skipped silently when the tokenizer files can't be fetched.
        let Ok(tokenizer) = load_tokenizer("bert-base-cased").await else {
            return;
        };
        let content = "Sentence one. ".repeat(400);
        let chunks = split_into_chunks(&content, &tokenizer, 50, 200);
        assert!(chunks.len() > 1);
    }
}
