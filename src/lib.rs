#![warn(missing_docs)]
//! Core library for the letterscope semantic concept time-series engine.
//!
//! letterscope turns a free-text concept into a prevalence signal over a
//! corpus of historical letters: concepts are expanded and embedded once
//! (cached), then scored against precomputed per-period mean embeddings
//! for trend series, or against individual chunks for topic frequency.

pub mod buckets;
pub mod chunks;
pub mod concepts;
pub mod embedding;
pub mod frequency;
pub mod llm;
pub mod scorer;
pub mod search;
pub mod series;
pub mod store;

pub use buckets::{Bucket, BucketAggregator, BucketMean, BucketRow};
pub use chunks::{ChunkRecord, DEFAULT_SOURCE};
pub use concepts::{
    ConceptCache, ConceptExpansion, ConceptKey, ConceptRecord, PgConceptCache, ResolvedConcept,
};
pub use embedding::{EmbeddingClient, QueryEmbedder};
pub use frequency::{LetterCountCache, TopicFrequency};
pub use llm::{ConceptModel, ExpansionClient};
pub use scorer::{cosine_similarity, ScoredBucket};
pub use search::{ChunkMatch, PgVectorSearch, VectorSearch};
pub use series::SeriesPoint;
pub use store::TableName;
