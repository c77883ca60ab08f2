//! Chunk records and the pgvector-backed chunk table.
//!
//! A chunk is a bounded slice of one letter: the unit of embedding and
//! retrieval. The letter id is assigned once at ingestion and is the stable
//! document identity used everywhere downstream; it is never recomputed.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use tokio_postgres::Client;

use crate::store::TableName;

/// Default corpus slice loaded by the ingestion job.
pub const DEFAULT_SOURCE: &str = "letters_full";

/// One ingested chunk, as carried through the loader JSONL and the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Corpus slice this chunk belongs to.
    pub source: String,
    /// Stable id of the parent letter, assigned at ingestion.
    pub letter_id: i64,
    /// Position of the chunk within its letter.
    pub chunk_index: i64,
    /// Date the letter was written.
    pub date: NaiveDate,
    /// Chunk body text submitted to the embedding model.
    pub text: String,
    /// Embedding vector; empty until the loader has embedded the chunk.
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// Ensures the pgvector extension is installed.
pub async fn ensure_vector_extension(client: &Client) -> Result<()> {
    client
        .execute("CREATE EXTENSION IF NOT EXISTS vector", &[])
        .await
        .context("failed to ensure pgvector extension")?;
    Ok(())
}

/// Creates the chunk table when missing.
pub async fn ensure_chunk_table(client: &Client, table: &TableName, dims: usize) -> Result<()> {
    anyhow::ensure!(dims > 0, "embedding dimension must be positive");
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            source TEXT NOT NULL,
            letter_id BIGINT NOT NULL,
            chunk_index BIGINT NOT NULL,
            letter_date DATE NOT NULL,
            text TEXT NOT NULL,
            embedding VECTOR({dims}) NOT NULL,
            PRIMARY KEY (source, letter_id, chunk_index)
        )",
        table.qualified()
    );
    client
        .execute(&ddl, &[])
        .await
        .context("failed to create chunk table")?;
    Ok(())
}

/// Creates the approximate-nearest-neighbor index over chunk embeddings.
pub async fn ensure_ann_index(client: &Client, table: &TableName) -> Result<()> {
    let sql = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} USING hnsw (embedding vector_cosine_ops)",
        table.ann_index_name(),
        table.qualified()
    );
    client
        .execute(&sql, &[])
        .await
        .context("failed to ensure ANN index")?;
    Ok(())
}

/// Inserts a batch of chunks in one transaction, upserting on the
/// (source, letter_id, chunk_index) key.
pub async fn insert_chunk_batch(
    client: &mut Client,
    table: &TableName,
    records: &[ChunkRecord],
) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }

    let sql = format!(
        "INSERT INTO {} \
            (source, letter_id, chunk_index, letter_date, text, embedding) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (source, letter_id, chunk_index) DO UPDATE SET \
            letter_date = EXCLUDED.letter_date, \
            text = EXCLUDED.text, \
            embedding = EXCLUDED.embedding",
        table.qualified()
    );
    let transaction = client.transaction().await?;
    let statement = transaction.prepare(&sql).await?;
    for record in records {
        let vector = Vector::from(record.embedding.clone());
        transaction
            .execute(
                &statement,
                &[
                    &record.source,
                    &record.letter_id,
                    &record.chunk_index,
                    &record.date,
                    &record.text,
                    &vector,
                ],
            )
            .await
            .with_context(|| {
                format!(
                    "failed to insert chunk {}/{} from source {}",
                    record.letter_id, record.chunk_index, record.source
                )
            })?;
    }
    transaction.commit().await?;
    Ok(())
}

/// Deletes every chunk of one source. Used by the loader's clear option.
pub async fn clear_source(client: &Client, table: &TableName, source: &str) -> Result<u64> {
    let sql = format!("DELETE FROM {} WHERE source = $1", table.qualified());
    client
        .execute(&sql, &[&source])
        .await
        .context("failed to clear source")
}

/// Distinct source identifiers present in the chunk table, sorted.
pub async fn distinct_sources(client: &Client, table: &TableName) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT DISTINCT source FROM {} ORDER BY source ASC",
        table.qualified()
    );
    let rows = client
        .query(&sql, &[])
        .await
        .context("failed to list sources")?;
    Ok(rows.into_iter().map(|row| row.get("source")).collect())
}

/// Number of distinct letters ingested for a source. This is the
/// denominator of the topic-frequency percentage.
pub async fn distinct_letter_count(
    client: &Client,
    table: &TableName,
    source: &str,
) -> Result<u64> {
    let sql = format!(
        "SELECT COUNT(DISTINCT letter_id) AS letters FROM {} WHERE source = $1",
        table.qualified()
    );
    let row = client
        .query_one(&sql, &[&source])
        .await
        .context("failed to count letters")?;
    let letters: i64 = row.get("letters");
    Ok(letters.max(0) as u64)
}
