//! Vector search gateway: generic nearest-neighbor queries over chunk
//! embeddings.
//!
//! This is the one retrieval primitive shared by the topic-frequency
//! classifier and the chat-retrieval flow. pgvector's `<=>` operator is
//! cosine distance, so the reported score is `1 - distance`, directly
//! comparable with the in-process cosine used for bucket scoring.

use std::sync::Arc;

use anyhow::{Context, Result};
use pgvector::Vector;
use tokio_postgres::Client;

use crate::store::TableName;

/// One nearest-neighbor hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMatch {
    /// Corpus slice the chunk belongs to.
    pub source: String,
    /// Stable id of the parent letter.
    pub letter_id: i64,
    /// Position of the chunk within its letter.
    pub chunk_index: i64,
    /// Cosine similarity to the query embedding.
    pub score: f64,
}

/// Trait over the gateway so consumers are testable without a database.
pub trait VectorSearch {
    /// Returns up to `limit` chunks ordered by descending similarity,
    /// optionally restricted to one source.
    fn top_chunks(
        &self,
        query: &[f32],
        limit: usize,
        source: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<ChunkMatch>>> + Send;
}

/// pgvector-backed gateway.
pub struct PgVectorSearch {
    client: Arc<Client>,
    table: TableName,
}

impl PgVectorSearch {
    /// Wraps a shared connection and the chunk table identifier.
    pub fn new(client: Arc<Client>, table: TableName) -> Self {
        Self { client, table }
    }
}

impl VectorSearch for PgVectorSearch {
    async fn top_chunks(
        &self,
        query: &[f32],
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ChunkMatch>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT source, letter_id, chunk_index, \
                    1 - (embedding <=> $1) AS score \
             FROM {} \
             WHERE ($2::TEXT IS NULL OR source = $2) \
             ORDER BY embedding <=> $1 ASC \
             LIMIT $3",
            self.table.qualified()
        );
        let vector = Vector::from(query.to_vec());
        let rows = self
            .client
            .query(&sql, &[&vector, &source, &(limit as i64)])
            .await
            .context("vector search query failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ChunkMatch {
                source: row.get("source"),
                letter_id: row.get("letter_id"),
                chunk_index: row.get("chunk_index"),
                score: row.get("score"),
            });
        }
        Ok(out)
    }
}
