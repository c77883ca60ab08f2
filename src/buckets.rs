//! Time-bucket arithmetic and the bucket-embedding store.
//!
//! A bucket is a fixed-width window (Monday-aligned week or calendar month)
//! identified by its first day. The offline builder folds every chunk
//! embedding into a per-bucket mean vector; the request path only ever
//! reads those precomputed rows back.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{Datelike, Days, Months, NaiveDate};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio_postgres::Client;

use crate::store::TableName;

/// Bucket granularity for trend aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    /// Monday-aligned 7-day windows.
    Week,
    /// Calendar months.
    Month,
}

impl Bucket {
    /// Parses the wire form (`week` / `month`), case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "week" => Some(Bucket::Week),
            "month" => Some(Bucket::Month),
            _ => None,
        }
    }

    /// Wire name of the granularity, also the store's discriminator value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Week => "week",
            Bucket::Month => "month",
        }
    }

    /// First day of the bucket containing `date`.
    pub fn start_of(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Bucket::Week => {
                let back = date.weekday().num_days_from_monday() as u64;
                date.checked_sub_days(Days::new(back)).unwrap_or(date)
            }
            Bucket::Month => date
                .with_day(1)
                .expect("the first of a month is always a valid date"),
        }
    }

    /// Next enumeration boundary after `current`. Weeks keep the phase of
    /// the starting date; months snap to the first of the following month.
    /// `None` only at the edge of chrono's representable range.
    pub fn next_boundary(&self, current: NaiveDate) -> Option<NaiveDate> {
        match self {
            Bucket::Week => current.checked_add_days(Days::new(7)),
            Bucket::Month => current
                .with_day(1)
                .and_then(|first| first.checked_add_months(Months::new(1))),
        }
    }
}

/// One bucket row as read back for scoring.
#[derive(Debug, Clone)]
pub struct BucketRow {
    /// First day of the bucket window.
    pub bucket_start: NaiveDate,
    /// Mean embedding across the bucket's chunks.
    pub embedding: Vec<f32>,
    /// Number of chunks folded into the mean.
    pub chunk_count: i64,
}

/// Finished per-bucket aggregate produced by [`BucketAggregator`].
#[derive(Debug, Clone, PartialEq)]
pub struct BucketMean {
    /// First day of the bucket window.
    pub bucket_start: NaiveDate,
    /// Mean embedding (sum / count).
    pub mean: Vec<f32>,
    /// Chunks folded into this bucket.
    pub chunk_count: i64,
    /// Earliest chunk date seen in the bucket.
    pub min_date: NaiveDate,
    /// Latest chunk date seen in the bucket.
    pub max_date: NaiveDate,
}

struct Accumulator {
    sum: Vec<f64>,
    count: i64,
    min_date: NaiveDate,
    max_date: NaiveDate,
}

/// Streaming mean-vector accumulator for one builder run.
///
/// The first valid chunk's dimensionality becomes canonical for the run;
/// chunks with a different (or empty) dimensionality are counted as skipped
/// and excluded from every aggregate.
pub struct BucketAggregator {
    bucket: Bucket,
    dims: Option<usize>,
    accumulators: BTreeMap<NaiveDate, Accumulator>,
    processed: u64,
    skipped: u64,
}

impl BucketAggregator {
    /// Creates an empty aggregator for the given granularity.
    pub fn new(bucket: Bucket) -> Self {
        Self {
            bucket,
            dims: None,
            accumulators: BTreeMap::new(),
            processed: 0,
            skipped: 0,
        }
    }

    /// Folds one chunk into its bucket.
    pub fn observe(&mut self, date: NaiveDate, embedding: &[f32]) {
        self.processed += 1;
        if embedding.is_empty() {
            self.skipped += 1;
            return;
        }
        let dims = *self.dims.get_or_insert(embedding.len());
        if embedding.len() != dims {
            self.skipped += 1;
            return;
        }

        let start = self.bucket.start_of(date);
        let acc = self
            .accumulators
            .entry(start)
            .or_insert_with(|| Accumulator {
                sum: vec![0.0; dims],
                count: 0,
                min_date: date,
                max_date: date,
            });
        for (slot, value) in acc.sum.iter_mut().zip(embedding.iter()) {
            *slot += *value as f64;
        }
        acc.count += 1;
        if date < acc.min_date {
            acc.min_date = date;
        }
        if date > acc.max_date {
            acc.max_date = date;
        }
    }

    /// Total chunks observed, including skipped ones.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Chunks excluded for empty or mismatched dimensionality.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Number of distinct buckets accumulated so far.
    pub fn bucket_count(&self) -> usize {
        self.accumulators.len()
    }

    /// Canonical dimensionality, once a valid chunk has been seen.
    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    /// Finalizes every bucket into its mean vector, ordered by start date.
    pub fn into_means(self) -> Vec<BucketMean> {
        self.accumulators
            .into_iter()
            .map(|(bucket_start, acc)| {
                let count = acc.count.max(1) as f64;
                let mean = acc.sum.iter().map(|v| (v / count) as f32).collect();
                BucketMean {
                    bucket_start,
                    mean,
                    chunk_count: acc.count,
                    min_date: acc.min_date,
                    max_date: acc.max_date,
                }
            })
            .collect()
    }
}

/// Creates the bucket-embedding table when missing.
pub async fn ensure_bucket_table(client: &Client, table: &TableName) -> Result<()> {
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            bucket TEXT NOT NULL,
            bucket_start DATE NOT NULL,
            source TEXT NOT NULL,
            embedding REAL[] NOT NULL,
            chunk_count BIGINT NOT NULL,
            min_date DATE NOT NULL,
            max_date DATE NOT NULL,
            PRIMARY KEY (bucket, source, bucket_start)
        )",
        table.qualified()
    );
    client
        .execute(&ddl, &[])
        .await
        .context("failed to create bucket embedding table")?;
    Ok(())
}

/// Fetches bucket rows for a scope, sorted by start date. `from`/`to` bound
/// the bucket start; `source` narrows to one corpus slice.
pub async fn fetch_bucket_rows(
    client: &Client,
    table: &TableName,
    bucket: Bucket,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    source: Option<&str>,
) -> Result<Vec<BucketRow>> {
    let sql = format!(
        "SELECT bucket_start, embedding, chunk_count \
         FROM {} \
         WHERE bucket = $1 \
           AND ($2::TEXT IS NULL OR source = $2) \
           AND ($3::DATE IS NULL OR bucket_start >= $3) \
           AND ($4::DATE IS NULL OR bucket_start <= $4) \
         ORDER BY bucket_start ASC",
        table.qualified()
    );
    let rows = client
        .query(&sql, &[&bucket.as_str(), &source, &from, &to])
        .await
        .context("failed to fetch bucket embeddings")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(BucketRow {
            bucket_start: row.get("bucket_start"),
            embedding: row.get("embedding"),
            chunk_count: row.get("chunk_count"),
        });
    }
    Ok(out)
}

/// Known corpus bounds for a scope: min/max bucket start, used to clamp
/// requested date ranges before the backfill loop runs.
pub async fn fetch_corpus_bounds(
    client: &Client,
    table: &TableName,
    bucket: Bucket,
    source: Option<&str>,
) -> Result<Option<(NaiveDate, NaiveDate)>> {
    let sql = format!(
        "SELECT MIN(bucket_start) AS lo, MAX(bucket_start) AS hi \
         FROM {} \
         WHERE bucket = $1 AND ($2::TEXT IS NULL OR source = $2)",
        table.qualified()
    );
    let row = client
        .query_one(&sql, &[&bucket.as_str(), &source])
        .await
        .context("failed to fetch corpus bounds")?;
    let lo: Option<NaiveDate> = row.get("lo");
    let hi: Option<NaiveDate> = row.get("hi");
    Ok(lo.zip(hi))
}

/// Replaces the whole (bucket, source) scope with a freshly built
/// generation, inside one transaction. Callers only reach this after the
/// full in-memory aggregation succeeded, so a failed run never leaves a
/// half-replaced scope behind.
pub async fn replace_bucket_scope(
    client: &mut Client,
    table: &TableName,
    bucket: Bucket,
    source: &str,
    means: &[BucketMean],
) -> Result<()> {
    let transaction = client.transaction().await?;
    let delete_sql = format!(
        "DELETE FROM {} WHERE bucket = $1 AND source = $2",
        table.qualified()
    );
    transaction
        .execute(&delete_sql, &[&bucket.as_str(), &source])
        .await
        .context("failed to clear previous bucket generation")?;

    let insert_sql = format!(
        "INSERT INTO {} \
            (bucket, bucket_start, source, embedding, chunk_count, min_date, max_date) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
        table.qualified()
    );
    let statement = transaction.prepare(&insert_sql).await?;
    for mean in means {
        transaction
            .execute(
                &statement,
                &[
                    &bucket.as_str(),
                    &mean.bucket_start,
                    &source,
                    &mean.mean,
                    &mean.chunk_count,
                    &mean.min_date,
                    &mean.max_date,
                ],
            )
            .await
            .with_context(|| {
                format!("failed to insert bucket row for {}", mean.bucket_start)
            })?;
    }
    transaction.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
    }

    #[test]
    fn week_starts_are_monday_aligned() {
        // 1914-02-01 fell on a Sunday; its week began Monday Jan 26.
        assert_eq!(
            Bucket::Week.start_of(date(1914, 2, 1)),
            date(1914, 1, 26)
        );
        // A Monday is its own week start.
        assert_eq!(Bucket::Week.start_of(date(1914, 2, 2)), date(1914, 2, 2));
        assert_eq!(
            Bucket::Week.start_of(date(1914, 2, 8)),
            date(1914, 2, 2)
        );
    }

    #[test]
    fn month_starts_snap_to_the_first() {
        assert_eq!(Bucket::Month.start_of(date(1914, 2, 17)), date(1914, 2, 1));
        assert_eq!(Bucket::Month.start_of(date(1914, 12, 31)), date(1914, 12, 1));
    }

    #[test]
    fn week_boundaries_keep_phase_and_months_snap() {
        assert_eq!(
            Bucket::Week.next_boundary(date(1914, 1, 1)),
            Some(date(1914, 1, 8))
        );
        assert_eq!(
            Bucket::Month.next_boundary(date(1914, 1, 15)),
            Some(date(1914, 2, 1))
        );
        assert_eq!(
            Bucket::Month.next_boundary(date(1914, 12, 1)),
            Some(date(1915, 1, 1))
        );
    }

    #[test]
    fn february_chunks_fold_into_two_week_buckets() {
        // Feb 2 (Mon) and Feb 4 (Wed) share the week of Feb 2; Feb 10 lands
        // in the week of Feb 9.
        let mut agg = BucketAggregator::new(Bucket::Week);
        agg.observe(date(1914, 2, 2), &[1.0, 0.0]);
        agg.observe(date(1914, 2, 4), &[0.0, 1.0]);
        agg.observe(date(1914, 2, 10), &[2.0, 2.0]);

        let means = agg.into_means();
        assert_eq!(means.len(), 2);

        assert_eq!(means[0].bucket_start, date(1914, 2, 2));
        assert_eq!(means[0].chunk_count, 2);
        assert_eq!(means[0].mean, vec![0.5, 0.5]);
        assert_eq!(means[0].min_date, date(1914, 2, 2));
        assert_eq!(means[0].max_date, date(1914, 2, 4));

        assert_eq!(means[1].bucket_start, date(1914, 2, 9));
        assert_eq!(means[1].chunk_count, 1);
        assert_eq!(means[1].mean, vec![2.0, 2.0]);
    }

    #[test]
    fn mismatched_dimensions_are_skipped() {
        let mut agg = BucketAggregator::new(Bucket::Month);
        agg.observe(date(1914, 2, 1), &[1.0, 1.0]);
        agg.observe(date(1914, 2, 2), &[1.0, 1.0, 1.0]);
        agg.observe(date(1914, 2, 3), &[]);
        agg.observe(date(1914, 2, 4), &[3.0, 3.0]);

        assert_eq!(agg.processed(), 4);
        assert_eq!(agg.skipped(), 2);
        assert_eq!(agg.dims(), Some(2));

        let means = agg.into_means();
        assert_eq!(means.len(), 1);
        assert_eq!(means[0].chunk_count, 2);
        assert_eq!(means[0].mean, vec![2.0, 2.0]);
    }

    #[test]
    fn means_come_out_sorted_by_start() {
        let mut agg = BucketAggregator::new(Bucket::Month);
        agg.observe(date(1914, 5, 20), &[1.0]);
        agg.observe(date(1914, 2, 3), &[2.0]);
        agg.observe(date(1914, 3, 15), &[3.0]);

        let starts: Vec<NaiveDate> = agg.into_means().iter().map(|m| m.bucket_start).collect();
        assert_eq!(
            starts,
            vec![date(1914, 2, 1), date(1914, 3, 1), date(1914, 5, 1)]
        );
    }

    #[test]
    fn bucket_parse_accepts_wire_forms() {
        assert_eq!(Bucket::parse("week"), Some(Bucket::Week));
        assert_eq!(Bucket::parse("MONTH"), Some(Bucket::Month));
        assert_eq!(Bucket::parse("day"), None);
    }
}
