#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod cypher;
pub mod fts;
pub mod kinds;
pub mod multi_query;
pub mod pipeline;
pub mod scoring;

pub use kinds::{SearchKind, SearchResultItem};
pub use pipeline::{
    CombinedSearchResults, CypherSearchConfig, KindSearchConfig, MultiQueryConfig, Reranker,
    SearchConfig, SearchManager, SearchMethod,
};
