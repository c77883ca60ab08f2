//! Series assembly: gap backfill, rolling-mean smoothing, and min-max
//! normalization over a scored bucket list.
//!
//! Downstream consumers (charting) assume a dense, uniformly spaced series,
//! so every bucket boundary in the requested range is materialized even
//! when the scorer produced nothing for it.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::buckets::Bucket;
use crate::scorer::ScoredBucket;

/// One dense series point delivered to callers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPoint {
    /// First day of the bucket window (ISO date on the wire).
    pub bucket_start: NaiveDate,
    /// Cosine score for the bucket, 0 for backfilled gaps.
    pub raw: f64,
    /// Rolling mean of `raw` over the smoothing window.
    pub smooth: f64,
    /// `smooth` rescaled to [0,100] across the series.
    pub norm: f64,
    /// Chunk count for scored buckets; absent for backfilled gaps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<i64>,
}

/// Enumerates every bucket boundary from `from` to `to` and fills
/// boundaries without a scored entry with raw=0.
///
/// `from`/`to` default to the first/last scored bucket; with no scored
/// entries an explicit range still yields the full zero-filled enumeration,
/// and no range at all yields an empty series.
pub fn backfill(
    bucket: Bucket,
    scored: &[ScoredBucket],
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Vec<(NaiveDate, f64, Option<i64>)> {
    let start = match from.or_else(|| scored.first().map(|s| s.bucket_start)) {
        Some(start) => start,
        None => return Vec::new(),
    };
    let end = match to.or_else(|| scored.last().map(|s| s.bucket_start)) {
        Some(end) => end,
        None => return Vec::new(),
    };

    let by_start: HashMap<NaiveDate, (f64, i64)> = scored
        .iter()
        .map(|s| (s.bucket_start, (s.raw, s.chunk_count)))
        .collect();

    let mut out = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        match by_start.get(&cursor) {
            Some((raw, count)) => out.push((cursor, *raw, Some(*count))),
            None => out.push((cursor, 0.0, None)),
        }
        cursor = match bucket.next_boundary(cursor) {
            Some(next) => next,
            None => break,
        };
    }
    out
}

/// Trailing rolling mean: each point averages itself and up to `window - 1`
/// predecessors. Early points use however many values exist (a shrunk
/// window, never zero-padding). `window <= 1` is the identity transform.
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    if window <= 1 {
        return values.to_vec();
    }

    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, value) in values.iter().enumerate() {
        sum += value;
        if i >= window {
            sum -= values[i - window];
        }
        let span = (i + 1).min(window);
        out.push(sum / span as f64);
    }
    out
}

/// Linear min-max rescale to [0,100]. A flat series (max == min) maps to
/// all zeros rather than dividing by zero.
pub fn normalize_0_100(values: &[f64]) -> Vec<f64> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for value in values {
        if *value < min {
            min = *value;
        }
        if *value > max {
            max = *value;
        }
    }
    if !min.is_finite() || !max.is_finite() || max == min {
        return vec![0.0; values.len()];
    }
    values
        .iter()
        .map(|v| 100.0 * (v - min) / (max - min))
        .collect()
}

/// Full assembly: backfill, smooth, normalize.
pub fn assemble(
    bucket: Bucket,
    scored: &[ScoredBucket],
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    smoothing_window: usize,
) -> Vec<SeriesPoint> {
    let filled = backfill(bucket, scored, from, to);
    let raw: Vec<f64> = filled.iter().map(|(_, raw, _)| *raw).collect();
    let smooth = rolling_mean(&raw, smoothing_window);
    let norm = normalize_0_100(&smooth);

    filled
        .into_iter()
        .zip(smooth)
        .zip(norm)
        .map(|(((bucket_start, raw, chunk_count), smooth), norm)| SeriesPoint {
            bucket_start,
            raw,
            smooth,
            norm,
            chunk_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
    }

    fn scored(y: i32, m: u32, d: u32, raw: f64, count: i64) -> ScoredBucket {
        ScoredBucket {
            bucket_start: date(y, m, d),
            raw,
            chunk_count: count,
        }
    }

    #[test]
    fn backfill_is_dense_and_evenly_spaced() {
        let sparse = vec![
            scored(1914, 2, 2, 0.4, 3),
            scored(1914, 3, 2, 0.6, 1),
        ];
        let filled = backfill(Bucket::Week, &sparse, None, None);

        assert_eq!(filled.len(), 5);
        for pair in filled.windows(2) {
            assert_eq!((pair[1].0 - pair[0].0).num_days(), 7);
        }
        assert_eq!(filled[0], (date(1914, 2, 2), 0.4, Some(3)));
        assert_eq!(filled[1], (date(1914, 2, 9), 0.0, None));
        assert_eq!(filled[4], (date(1914, 3, 2), 0.6, Some(1)));
    }

    #[test]
    fn explicit_range_with_no_overlap_is_zero_filled() {
        // Five week boundaries fall inside January 1914 starting Jan 1.
        let series = assemble(
            Bucket::Week,
            &[],
            Some(date(1914, 1, 1)),
            Some(date(1914, 1, 31)),
            7,
        );
        assert_eq!(series.len(), 5);
        assert_eq!(series[0].bucket_start, date(1914, 1, 1));
        assert_eq!(series[4].bucket_start, date(1914, 1, 29));
        for point in &series {
            assert_eq!(point.raw, 0.0);
            assert_eq!(point.smooth, 0.0);
            assert_eq!(point.norm, 0.0);
            assert!(point.chunk_count.is_none());
        }
    }

    #[test]
    fn no_scored_buckets_and_no_range_yields_empty() {
        assert!(backfill(Bucket::Month, &[], None, None).is_empty());
        assert!(backfill(Bucket::Month, &[], Some(date(1914, 1, 1)), None).is_empty());
    }

    #[test]
    fn inverted_range_yields_empty() {
        let filled = backfill(
            Bucket::Week,
            &[],
            Some(date(1914, 3, 1)),
            Some(date(1914, 1, 1)),
        );
        assert!(filled.is_empty());
    }

    #[test]
    fn month_enumeration_snaps_after_a_mid_month_start() {
        let filled = backfill(
            Bucket::Month,
            &[],
            Some(date(1914, 1, 15)),
            Some(date(1914, 4, 1)),
        );
        let starts: Vec<NaiveDate> = filled.iter().map(|(d, _, _)| *d).collect();
        assert_eq!(
            starts,
            vec![
                date(1914, 1, 15),
                date(1914, 2, 1),
                date(1914, 3, 1),
                date(1914, 4, 1),
            ]
        );
    }

    #[test]
    fn rolling_mean_window_one_is_identity() {
        let values = vec![0.1, 0.9, 0.4, 0.7];
        assert_eq!(rolling_mean(&values, 1), values);
    }

    #[test]
    fn rolling_mean_shrinks_at_the_left_edge() {
        let values = vec![3.0, 1.0, 2.0, 6.0];
        let smooth = rolling_mean(&values, 3);
        assert_eq!(smooth[0], 3.0);
        assert_eq!(smooth[1], 2.0);
        assert_eq!(smooth[2], 2.0);
        assert_eq!(smooth[3], 3.0);
    }

    #[test]
    fn normalized_values_stay_in_range_and_hit_both_ends() {
        let norm = normalize_0_100(&[0.2, 0.5, 0.35]);
        assert_eq!(norm[0], 0.0);
        assert_eq!(norm[1], 100.0);
        assert!(norm.iter().all(|v| (0.0..=100.0).contains(v)));
    }

    #[test]
    fn flat_series_normalizes_to_zero() {
        assert_eq!(normalize_0_100(&[0.7, 0.7, 0.7]), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn smoothing_window_one_keeps_smooth_equal_to_raw() {
        let sparse = vec![scored(1914, 2, 2, 0.4, 2), scored(1914, 2, 9, 0.8, 1)];
        let series = assemble(Bucket::Week, &sparse, None, None, 1);
        for point in &series {
            assert_eq!(point.smooth, point.raw);
        }
    }

    #[test]
    fn assembled_series_covers_every_boundary_in_range() {
        let sparse = vec![scored(1914, 6, 1, 0.3, 4)];
        let series = assemble(
            Bucket::Month,
            &sparse,
            Some(date(1914, 4, 1)),
            Some(date(1914, 8, 1)),
            2,
        );
        assert_eq!(series.len(), 5);
        assert!(series.windows(2).all(|p| p[0].bucket_start < p[1].bucket_start));
        assert_eq!(series[2].raw, 0.3);
        assert_eq!(series[2].chunk_count, Some(4));
    }
}
