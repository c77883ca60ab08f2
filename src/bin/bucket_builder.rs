use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use futures_util::{pin_mut, TryStreamExt};
use letterscope::buckets::{self, Bucket, BucketAggregator};
use letterscope::{TableName, DEFAULT_SOURCE};
use pgvector::Vector;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

#[derive(Parser, Debug)]
#[command(
    name = "letterscope-buckets",
    about = "Rebuild per-period mean embeddings from the chunk corpus"
)]
struct BuildCli {
    /// Postgres connection string (postgres://...).
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Schema holding the chunk and bucket tables.
    #[arg(long, env = "LETTERSCOPE_SCHEMA", default_value = "public")]
    schema: String,

    /// Table storing ingested chunks.
    #[arg(long, env = "LETTERSCOPE_CHUNK_TABLE", default_value = "letter_chunks")]
    chunk_table: String,

    /// Table storing bucket mean embeddings.
    #[arg(
        long,
        env = "LETTERSCOPE_BUCKET_TABLE",
        default_value = "bucket_embeddings"
    )]
    bucket_table: String,

    /// Bucket granularity to build.
    #[arg(long, value_enum, default_value_t = Bucket::Week)]
    bucket: Bucket,

    /// Only aggregate chunks from this source.
    #[arg(long)]
    source: Option<String>,

    /// Only aggregate chunks dated on or after this ISO date (YYYY-MM-DD).
    #[arg(long)]
    from: Option<String>,

    /// Only aggregate chunks dated on or before this ISO date (YYYY-MM-DD).
    #[arg(long)]
    to: Option<String>,

    /// Wipe the (bucket, source) scope even if the build produces nothing.
    #[arg(long, default_value_t = false)]
    clear: bool,

    /// Only report how many chunks would be aggregated.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = BuildCli::parse();
    let from = parse_iso_date(cli.from.as_deref())?;
    let to = parse_iso_date(cli.to.as_deref())?;
    let chunk_table = TableName::new(cli.schema.clone(), cli.chunk_table.clone())?;
    let bucket_table = TableName::new(cli.schema.clone(), cli.bucket_table.clone())?;

    let (client, connection) = tokio_postgres::connect(&cli.database_url, NoTls)
        .await
        .with_context(|| format!("failed to connect to Postgres at {}", cli.database_url))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            eprintln!("postgres connection error: {err}");
        }
    });
    let mut client = client;

    println!(
        "building {} buckets from {} into {} (source: {}, range: {}..{})",
        cli.bucket.as_str(),
        chunk_table.qualified(),
        bucket_table.qualified(),
        cli.source.as_deref().unwrap_or("<any>"),
        cli.from.as_deref().unwrap_or("<open>"),
        cli.to.as_deref().unwrap_or("<open>"),
    );

    if cli.dry_run {
        let matched = count_matching_chunks(&client, &chunk_table, &cli.source, from, to).await?;
        println!("dry run: {matched} chunk(s) would be aggregated");
        return Ok(());
    }

    buckets::ensure_bucket_table(&client, &bucket_table).await?;

    if cli.clear {
        let scope = cli.source.clone().unwrap_or_else(|| DEFAULT_SOURCE.to_string());
        let deleted = clear_scope(&client, &bucket_table, cli.bucket, &scope).await?;
        println!("cleared {deleted} existing bucket row(s) for scope {scope}");
    }

    let (aggregator, source_seen) =
        aggregate_chunks(&client, &chunk_table, cli.bucket, &cli.source, from, to).await?;

    eprintln!(
        "scan complete: {} chunk(s) processed, {} skipped, {} bucket(s)",
        aggregator.processed(),
        aggregator.skipped(),
        aggregator.bucket_count()
    );

    let dims = aggregator.dims();
    let means = aggregator.into_means();
    if means.is_empty() {
        println!("no buckets produced; store left untouched");
        return Ok(());
    }

    let scope_source = cli
        .source
        .clone()
        .or(source_seen)
        .unwrap_or_else(|| DEFAULT_SOURCE.to_string());
    let bucket_count = means.len();
    buckets::replace_bucket_scope(&mut client, &bucket_table, cli.bucket, &scope_source, &means)
        .await?;

    println!(
        "bucket build complete: {} bucket(s), {} dims, scope {} ({})",
        bucket_count,
        dims.unwrap_or(0),
        scope_source,
        cli.bucket.as_str(),
    );
    Ok(())
}

fn parse_iso_date(value: Option<&str>) -> Result<Option<NaiveDate>> {
    match value {
        None => Ok(None),
        Some(raw) => {
            let date = raw
                .parse::<NaiveDate>()
                .with_context(|| format!("invalid ISO date (YYYY-MM-DD): {raw:?}"))?;
            Ok(Some(date))
        }
    }
}

async fn count_matching_chunks(
    client: &tokio_postgres::Client,
    table: &TableName,
    source: &Option<String>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) AS matched FROM {} \
         WHERE ($1::TEXT IS NULL OR source = $1) \
           AND ($2::DATE IS NULL OR letter_date >= $2) \
           AND ($3::DATE IS NULL OR letter_date <= $3)",
        table.qualified()
    );
    let row = client
        .query_one(&sql, &[source, &from, &to])
        .await
        .context("failed to count matching chunks")?;
    Ok(row.get("matched"))
}

async fn clear_scope(
    client: &tokio_postgres::Client,
    table: &TableName,
    bucket: Bucket,
    source: &str,
) -> Result<u64> {
    let sql = format!(
        "DELETE FROM {} WHERE bucket = $1 AND source = $2",
        table.qualified()
    );
    client
        .execute(&sql, &[&bucket.as_str(), &source])
        .await
        .context("failed to clear bucket scope")
}

/// Streams every matching chunk through the aggregator. Aggregation is
/// all-in-memory; the store replace only runs after this returns Ok.
async fn aggregate_chunks(
    client: &tokio_postgres::Client,
    table: &TableName,
    bucket: Bucket,
    source: &Option<String>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<(BucketAggregator, Option<String>)> {
    let sql = format!(
        "SELECT letter_date, source, embedding FROM {} \
         WHERE ($1::TEXT IS NULL OR source = $1) \
           AND ($2::DATE IS NULL OR letter_date >= $2) \
           AND ($3::DATE IS NULL OR letter_date <= $3)",
        table.qualified()
    );
    let params: Vec<&(dyn ToSql + Sync)> = vec![source, &from, &to];
    let stream = client
        .query_raw(&sql, slice_iter(&params))
        .await
        .context("failed to stream chunk rows")?;
    pin_mut!(stream);

    let mut aggregator = BucketAggregator::new(bucket);
    let mut source_seen: Option<String> = None;
    while let Some(row) = stream.try_next().await.context("chunk stream failed")? {
        let date: NaiveDate = row.get("letter_date");
        let embedding: Vector = row.get("embedding");
        if source_seen.is_none() {
            source_seen = Some(row.get("source"));
        }
        aggregator.observe(date, embedding.as_slice());
        if aggregator.processed() % 5000 == 0 {
            eprintln!(
                "progress: {} chunk(s) processed, {} bucket(s)...",
                aggregator.processed(),
                aggregator.bucket_count()
            );
        }
    }
    Ok((aggregator, source_seen))
}

fn slice_iter<'a>(
    params: &'a [&'a (dyn ToSql + Sync)],
) -> impl ExactSizeIterator<Item = &'a dyn ToSql> + 'a {
    params.iter().map(|param| *param as _)
}
