//! Topic-frequency classification: how many letters in a source mention a
//! concept at all.
//!
//! The classifier samples the top-N nearest chunks to the concept
//! embedding, keeps those above a score threshold, and deduplicates by
//! letter id so a letter matches if any one of its chunks clears the bar.
//! Because N bounds the candidate pool, the count is a lower-bound
//! estimate of the true frequency, not an exhaustive scan; the debug
//! payload exists to calibrate the threshold against the score
//! distribution.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use anyhow::Result;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::search::{ChunkMatch, VectorSearch};

/// Default candidate sample size.
pub const DEFAULT_SAMPLE_SIZE: usize = 400;
/// Default similarity threshold a chunk must clear.
pub const DEFAULT_SCORE_THRESHOLD: f64 = 0.55;
/// How long a cached per-source letter count stays fresh.
pub const DEFAULT_COUNT_TTL: Duration = Duration::from_secs(5 * 60);

/// Aggregated classification result.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicFrequency {
    /// Distinct letters with at least one chunk above the threshold.
    pub matched_letters: u64,
    /// Distinct letters ingested for the source.
    pub total_letters: u64,
    /// `round(100 * matched / total)`; 0 when the source is empty.
    pub percent: u32,
    /// Threshold that was applied.
    pub score_threshold: f64,
    /// Candidate pool bound that was applied.
    pub sample_size: usize,
}

/// Score distribution summary for threshold calibration.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoreStats {
    /// Lowest candidate score.
    pub min: f64,
    /// Median candidate score.
    pub p50: f64,
    /// 90th-percentile candidate score.
    pub p90: f64,
    /// Highest candidate score.
    pub max: f64,
}

/// Full classification outcome, including the raw candidates the debug
/// payload is built from.
#[derive(Debug, Clone)]
pub struct Classification {
    /// The aggregate numbers.
    pub frequency: TopicFrequency,
    /// Every candidate score returned by the gateway.
    pub scores: Vec<f64>,
    /// The strongest candidates, in gateway order.
    pub top: Vec<ChunkMatch>,
}

/// Letter ids whose best chunk clears the threshold.
pub fn matched_letter_ids(matches: &[ChunkMatch], threshold: f64) -> HashSet<i64> {
    matches
        .iter()
        .filter(|m| m.score >= threshold)
        .map(|m| m.letter_id)
        .collect()
}

/// Percentage of matched letters, rounded; 0 for an empty source.
pub fn percent(matched: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    (100.0 * matched as f64 / total as f64).round() as u32
}

/// Percentile summary over candidate scores; all zeros when no candidates
/// came back.
pub fn score_stats(scores: &[f64]) -> ScoreStats {
    if scores.is_empty() {
        return ScoreStats {
            min: 0.0,
            p50: 0.0,
            p90: 0.0,
            max: 0.0,
        };
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pick = |p: f64| {
        let idx = ((p * (sorted.len() - 1) as f64).floor() as usize).min(sorted.len() - 1);
        sorted[idx]
    };
    ScoreStats {
        min: pick(0.0),
        p50: pick(0.5),
        p90: pick(0.9),
        max: pick(1.0),
    }
}

/// Runs one classification: a single gateway query, thresholding, and
/// letter-id dedup against the supplied corpus total.
pub async fn classify<S: VectorSearch>(
    gateway: &S,
    query_embedding: &[f32],
    source: &str,
    sample_size: usize,
    threshold: f64,
    total_letters: u64,
) -> Result<Classification> {
    let matches = gateway
        .top_chunks(query_embedding, sample_size, Some(source))
        .await?;

    let scores: Vec<f64> = matches.iter().map(|m| m.score).collect();
    let matched = matched_letter_ids(&matches, threshold);
    let matched_letters = matched.len() as u64;

    let top: Vec<ChunkMatch> = matches.iter().take(10).cloned().collect();

    Ok(Classification {
        frequency: TopicFrequency {
            matched_letters,
            total_letters,
            percent: percent(matched_letters, total_letters),
            score_threshold: threshold,
            sample_size,
        },
        scores,
        top,
    })
}

/// TTL'd cache of per-source letter counts.
///
/// Expiry is an explicit timestamp comparison on read; there is no
/// background sweep. The LRU bound keeps arbitrary user-supplied source
/// strings from growing the map without limit.
pub struct LetterCountCache {
    ttl: Duration,
    inner: Mutex<LruCache<String, (Instant, u64)>>,
}

impl LetterCountCache {
    /// Builds a cache holding up to `capacity` sources for `ttl` each.
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached count when present and fresh.
    pub async fn get(&self, source: &str) -> Option<u64> {
        let mut guard = self.inner.lock().await;
        match guard.get(source) {
            Some((stored_at, count)) if stored_at.elapsed() < self.ttl => Some(*count),
            Some(_) => {
                guard.pop(source);
                None
            }
            None => None,
        }
    }

    /// Stores a freshly computed count.
    pub async fn put(&self, source: &str, count: u64) {
        let mut guard = self.inner.lock().await;
        guard.put(source.to_string(), (Instant::now(), count));
    }

    /// Drops one source's entry.
    pub async fn invalidate(&self, source: &str) {
        let mut guard = self.inner.lock().await;
        guard.pop(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(letter_id: i64, chunk_index: i64, score: f64) -> ChunkMatch {
        ChunkMatch {
            source: "letters_full".to_string(),
            letter_id,
            chunk_index,
            score,
        }
    }

    struct FixedGateway {
        matches: Vec<ChunkMatch>,
    }

    impl VectorSearch for FixedGateway {
        async fn top_chunks(
            &self,
            _query: &[f32],
            limit: usize,
            _source: Option<&str>,
        ) -> Result<Vec<ChunkMatch>> {
            Ok(self.matches.iter().take(limit).cloned().collect())
        }
    }

    #[test]
    fn letters_deduplicate_across_chunks() {
        let matches = vec![
            hit(1, 0, 0.9),
            hit(1, 1, 0.8),
            hit(1, 2, 0.7),
            hit(2, 0, 0.6),
            hit(3, 0, 0.3),
        ];
        let ids = matched_letter_ids(&matches, 0.55);
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&1) && ids.contains(&2));
    }

    #[test]
    fn empty_source_yields_zero_percent() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(5, 0), 0);
    }

    #[test]
    fn percent_rounds_to_nearest() {
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(1, 1), 100);
    }

    #[tokio::test]
    async fn percent_is_monotone_as_threshold_drops() {
        let gateway = FixedGateway {
            matches: vec![
                hit(1, 0, 0.9),
                hit(2, 0, 0.7),
                hit(3, 0, 0.5),
                hit(4, 0, 0.3),
                hit(5, 0, 0.1),
            ],
        };
        let mut last_percent = 0;
        for threshold in [0.95, 0.8, 0.6, 0.4, 0.2, 0.0] {
            let outcome = classify(&gateway, &[1.0], "letters_full", 400, threshold, 10)
                .await
                .expect("classify");
            assert!(
                outcome.frequency.percent >= last_percent,
                "percent fell from {last_percent} to {} at threshold {threshold}",
                outcome.frequency.percent
            );
            last_percent = outcome.frequency.percent;
        }
        assert_eq!(last_percent, 50);
    }

    #[tokio::test]
    async fn sample_size_bounds_the_candidate_pool() {
        let gateway = FixedGateway {
            matches: (0..20).map(|i| hit(i, 0, 0.9)).collect(),
        };
        let outcome = classify(&gateway, &[1.0], "letters_full", 5, 0.5, 20)
            .await
            .expect("classify");
        assert_eq!(outcome.frequency.matched_letters, 5);
        assert_eq!(outcome.scores.len(), 5);
    }

    #[test]
    fn score_stats_cover_the_distribution() {
        let stats = score_stats(&[0.1, 0.9, 0.5, 0.3, 0.7]);
        assert_eq!(stats.min, 0.1);
        assert_eq!(stats.p50, 0.5);
        assert_eq!(stats.max, 0.9);
        assert!(stats.p90 >= stats.p50);
    }

    #[test]
    fn score_stats_handle_no_candidates() {
        let stats = score_stats(&[]);
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.max, 0.0);
    }

    #[tokio::test]
    async fn count_cache_expires_by_timestamp() {
        let cache = LetterCountCache::new(
            NonZeroUsize::new(4).expect("nonzero"),
            Duration::from_millis(20),
        );
        cache.put("letters_full", 560).await;
        assert_eq!(cache.get("letters_full").await, Some(560));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("letters_full").await, None);
    }

    #[tokio::test]
    async fn count_cache_invalidation_forces_a_refetch() {
        let cache = LetterCountCache::new(
            NonZeroUsize::new(4).expect("nonzero"),
            Duration::from_secs(300),
        );
        cache.put("letters_full", 560).await;
        cache.invalidate("letters_full").await;
        assert_eq!(cache.get("letters_full").await, None);
    }
}
