use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use letterscope::chunks::{self, ChunkRecord};
use letterscope::embedding::EmbeddingClient;
use letterscope::TableName;
use tokio_postgres::NoTls;

#[derive(Parser, Debug)]
#[command(
    name = "letterscope-loader",
    about = "Load letter chunks from JSONL into the pgvector chunk table"
)]
struct LoaderCli {
    /// Path to the chunk JSONL file (one ChunkRecord per line).
    #[arg(long, env = "LETTERSCOPE_CHUNK_INPUT", default_value = "chunks.jsonl")]
    input: PathBuf,

    /// Postgres connection string (postgres://...).
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Schema holding the chunk table.
    #[arg(long, env = "LETTERSCOPE_SCHEMA", default_value = "public")]
    schema: String,

    /// Table storing ingested chunks.
    #[arg(long, env = "LETTERSCOPE_CHUNK_TABLE", default_value = "letter_chunks")]
    chunk_table: String,

    /// Rows buffered per INSERT transaction.
    #[arg(long, env = "LETTERSCOPE_LOAD_BATCH", default_value_t = 128)]
    batch_size: usize,

    /// API key for the embeddings service.
    #[arg(long, env = "OPENAI_API_KEY")]
    api_key: String,

    /// Embedding model identifier.
    #[arg(
        long,
        env = "LETTERSCOPE_EMBEDDING_MODEL",
        default_value = "text-embedding-3-large"
    )]
    embedding_model: String,

    /// Output dimensionality for every embedded chunk.
    #[arg(long, env = "LETTERSCOPE_EMBEDDING_DIMENSIONS", default_value_t = 1536)]
    dimensions: usize,

    /// Base URL for OpenAI-compatible endpoints.
    #[arg(
        long,
        env = "LETTERSCOPE_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    base_url: String,

    /// Seconds before embedding requests time out.
    #[arg(long, env = "LETTERSCOPE_OPENAI_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Max inputs per embedding request.
    #[arg(long, env = "LETTERSCOPE_OPENAI_BATCH", default_value_t = 32)]
    embed_batch: usize,

    /// Delete every existing chunk of this source before loading.
    #[arg(long)]
    clear_source: Option<String>,

    /// Create the extension/table/index automatically if missing.
    #[arg(long, default_value_t = true)]
    prepare: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = LoaderCli::parse();
    let table = TableName::new(cli.schema.clone(), cli.chunk_table.clone())?;
    let embedder = EmbeddingClient::new(
        cli.api_key.clone(),
        cli.base_url.clone(),
        cli.embedding_model.clone(),
        cli.dimensions,
        Duration::from_secs(cli.timeout_secs.max(1)),
        cli.embed_batch.max(1),
    )?;

    let file = File::open(&cli.input)
        .with_context(|| format!("failed to open chunk input {:?}", cli.input))?;
    let reader = BufReader::new(file);

    let (client, connection) = tokio_postgres::connect(&cli.database_url, NoTls)
        .await
        .with_context(|| format!("failed to connect to Postgres at {}", cli.database_url))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            eprintln!("postgres connection error: {err}");
        }
    });
    let mut client = client;

    if cli.prepare {
        chunks::ensure_vector_extension(&client).await?;
        chunks::ensure_chunk_table(&client, &table, cli.dimensions).await?;
        chunks::ensure_ann_index(&client, &table).await?;
    }

    if let Some(source) = &cli.clear_source {
        let deleted = chunks::clear_source(&client, &table, source).await?;
        println!("cleared {deleted} existing chunk(s) for source {source}");
    }

    let batch_size = cli.batch_size.max(1);
    let mut batch: Vec<ChunkRecord> = Vec::with_capacity(batch_size);
    let mut total_loaded = 0usize;
    let mut total_embedded = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ChunkRecord = serde_json::from_str(&line)
            .with_context(|| format!("invalid chunk record at line {}", line_no + 1))?;
        if !record.embedding.is_empty() && record.embedding.len() != cli.dimensions {
            anyhow::bail!(
                "chunk at line {} carries a {}-dim embedding, expected {}",
                line_no + 1,
                record.embedding.len(),
                cli.dimensions
            );
        }
        batch.push(record);
        if batch.len() >= batch_size {
            total_embedded += embed_missing(&embedder, &mut batch).await?;
            chunks::insert_chunk_batch(&mut client, &table, &batch).await?;
            total_loaded += batch.len();
            eprintln!("loaded {total_loaded} chunk(s) ({total_embedded} embedded)...");
            batch.clear();
        }
    }

    if !batch.is_empty() {
        total_embedded += embed_missing(&embedder, &mut batch).await?;
        chunks::insert_chunk_batch(&mut client, &table, &batch).await?;
        total_loaded += batch.len();
    }

    println!(
        "load complete: {} chunk(s) written to {} ({} embedded here)",
        total_loaded,
        table.qualified(),
        total_embedded
    );
    Ok(())
}

/// Embeds every record in the batch that arrived without a vector, in
/// bounded sub-batches, preserving record order.
async fn embed_missing(embedder: &EmbeddingClient, batch: &mut [ChunkRecord]) -> Result<usize> {
    let missing: Vec<usize> = batch
        .iter()
        .enumerate()
        .filter(|(_, record)| record.embedding.is_empty())
        .map(|(idx, _)| idx)
        .collect();
    if missing.is_empty() {
        return Ok(0);
    }

    let mut embedded = 0usize;
    for group in missing.chunks(embedder.batch_size()) {
        let inputs: Vec<String> = group.iter().map(|idx| batch[*idx].text.clone()).collect();
        let worker = embedder.clone();
        let vectors = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = inputs.iter().map(|s| s.as_str()).collect();
            worker.embed_batch(&refs)
        })
        .await
        .map_err(|err| anyhow!("embedding task join error: {err}"))??;
        anyhow::ensure!(
            vectors.len() == group.len(),
            "embedding count {} mismatched batch of {}",
            vectors.len(),
            group.len()
        );
        for (idx, vector) in group.iter().zip(vectors.into_iter()) {
            batch[*idx].embedding = vector;
            embedded += 1;
        }
    }
    Ok(embedded)
}
