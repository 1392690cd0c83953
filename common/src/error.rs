use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

/// Central error type. Variants line up with the error taxonomy: config,
/// store (transient vs permanent, see `classify_store_error`), LLM,
/// embedding, and data/validation errors.
#[derive(Error, Debug)]
pub enum GraphRagError {
    #[error("config error: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("LLM error: {0}")]
    Llm(#[from] OpenAIError),
    #[error("LLM output parsing error: {0}")]
    LlmParsing(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("data error: {0}")]
    Data(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("task join error: {0}")]
    Join(#[from] JoinError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Whether a store error is worth retrying (lock conflicts, connection
/// hiccups) or should be surfaced immediately (constraint violations, bad
/// queries). SurrealDB's driver doesn't distinguish these at the type
/// level, so classification happens on the rendered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorClass {
    Transient,
    Permanent,
}

pub fn classify_store_error(err: &surrealdb::Error) -> StoreErrorClass {
    let msg = err.to_string();
    if msg.contains("read or write conflict")
        || msg.contains("Failed to commit transaction")
        || msg.contains("Connection")
        || msg.contains("timed out")
    {
        StoreErrorClass::Transient
    } else {
        StoreErrorClass::Permanent
    }
}

impl GraphRagError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GraphRagError::Database(e) => classify_store_error(e) == StoreErrorClass::Transient,
            GraphRagError::Llm(_) | GraphRagError::Embedding(_) => true,
            _ => false,
        }
    }
}
