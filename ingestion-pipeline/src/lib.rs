#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chunking;
pub mod documents;
pub mod extraction;
pub mod pipeline;
pub mod relationships;
pub mod resolver;
pub mod services;

pub use documents::{ContentTypeHint, DocumentInput, NodeTypeHint, ProductAttributes};
pub use pipeline::{IngestResult, IngestionConfig, IngestionOrchestrator, IngestionTuning, SourceInput};
pub use services::{DefaultPipelineServices, PipelineServices};
