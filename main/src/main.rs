use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use common::config::get_config;
use graphrag::GraphRag;
use ingestion_pipeline::{
    chunking::{load_tokenizer, split_into_chunks},
    DocumentInput, IngestionTuning, SourceInput,
};
use retrieval_pipeline::SearchConfig;

#[derive(Parser)]
#[command(name = "graphrag", about = "Knowledge-graph ingestion and hybrid search")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Declare indexes and constraints on the configured database.
    Init,
    /// Ingest a JSON source description (source_identifier + documents).
    Ingest {
        /// Path to a JSON file describing one source and its documents.
        file: PathBuf,
    },
    /// Split a plain-text file into chunks and ingest them as one source.
    IngestText {
        file: PathBuf,
        /// Source name; defaults to the file name.
        #[arg(long)]
        source: Option<String>,
    },
    /// Run a hybrid search with the default configuration.
    Search {
        query: String,
        /// Overall cap on the fused result list.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Delete a source and everything derived from it.
    DeleteSource { source_uuid: String },
    /// Delete all data, keeping the schema.
    ClearData,
    /// Drop every managed index and analyzer.
    ClearSchema,
}

const TOKENIZER_MODEL: &str = "bert-base-cased";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config()?;
    let graph = GraphRag::new(&config).await?;

    match cli.command {
        Command::Init => {
            graph.ensure_schema().await?;
            println!("schema ensured");
        }
        Command::Ingest { file } => {
            let input: SourceInput = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
            let result = graph.add_documents_from_source(input).await?;
            println!(
                "ingested source {} ({} items, {} generative requests, {} embedding requests)",
                result.source_uuid,
                result.added_item_uuids.len(),
                result.generative_usage.requests,
                result.embedding_usage.requests,
            );
        }
        Command::IngestText { file, source } => {
            let text = std::fs::read_to_string(&file)?;
            let source_identifier = source.unwrap_or_else(|| {
                file.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "text-source".into())
            });

            let tuning = IngestionTuning::default();
            let tokenizer = load_tokenizer(TOKENIZER_MODEL).await?;
            let documents: Vec<DocumentInput> =
                split_into_chunks(&text, &tokenizer, tuning.chunk_min_tokens, tuning.chunk_max_tokens)
                .into_iter()
                .enumerate()
                .map(|(index, content)| DocumentInput {
                    page_content: content,
                    node_type: ingestion_pipeline::NodeTypeHint::Chunk,
                    content_type: ingestion_pipeline::ContentTypeHint::Text,
                    metadata: serde_json::json!({"chunk_number": index + 1})
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                })
                .collect();

            let result = graph
                .add_documents_from_source(SourceInput {
                    source_identifier,
                    source_content: None,
                    source_metadata: serde_json::Map::new(),
                    documents,
                })
                .await?;
            println!("ingested {} chunks into source {}", result.added_item_uuids.len(), result.source_uuid);
        }
        Command::Search { query, limit } => {
            let search_config = SearchConfig { overall_results_limit: Some(limit), ..SearchConfig::default() };
            let results = graph.search(&query, &search_config).await?;
            for item in &results.items {
                println!(
                    "{:>8.5}  {:?}  {}",
                    item.score,
                    item.result_type,
                    item.name.as_deref().or(item.fact_sentence.as_deref()).unwrap_or(&item.uuid),
                );
            }
            if let Some(snippet) = &results.context_snippet {
                println!("\n{snippet}");
            }
        }
        Command::DeleteSource { source_uuid } => {
            let counters = graph.delete_source(&source_uuid).await?;
            println!("{counters:?}");
        }
        Command::ClearData => {
            graph.clear_data().await?;
            println!("data cleared");
        }
        Command::ClearSchema => {
            graph.clear_schema().await?;
            println!("schema cleared");
        }
    }

    Ok(())
}
