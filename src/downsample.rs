//! Deterministic bucket-mean downsampling for chart queries.
//!
//! Buckets are fixed-width and aligned to the query's start timestamp, so a
//! repeated query over the same range and resolution returns identical
//! results and the bucket count never exceeds the requested budget.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use crate::store::Sample;

/// Width in seconds for a bucket grid over `[start, end]` that yields at
/// most `max_points` buckets.
pub fn bucket_width_seconds(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_points: usize,
) -> i64 {
    let span = (end - start).num_seconds().max(0);
    let points = max_points.max(1) as i64;
    // The range is inclusive on both ends, hence span + 1 slots to cover.
    ((span + 1) + points - 1) / points
}

/// Mean per fixed-width bucket; each output sample carries its bucket's
/// start timestamp. Samples before `start` are clamped into the first
/// bucket rather than dropped.
pub fn downsample(samples: &[Sample], start: DateTime<Utc>, bucket_seconds: i64) -> Vec<Sample> {
    let width = bucket_seconds.max(1);
    let mut buckets: BTreeMap<i64, (f64, u32)> = BTreeMap::new();
    for sample in samples {
        let offset = (sample.timestamp - start).num_seconds().max(0);
        let index = offset.div_euclid(width);
        let entry = buckets.entry(index).or_insert((0.0, 0));
        entry.0 += sample.value;
        entry.1 += 1;
    }
    buckets
        .into_iter()
        .map(|(index, (sum, count))| Sample {
            timestamp: start + Duration::seconds(index * width),
            value: sum / count as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn sample(secs: i64, value: f64) -> Sample {
        Sample {
            timestamp: at(secs),
            value,
        }
    }

    #[test]
    fn width_covers_the_range_within_the_point_budget() {
        assert_eq!(bucket_width_seconds(at(0), at(3600), 500), 8);
        assert_eq!(bucket_width_seconds(at(0), at(9), 500), 1);
        // Inclusive-end edge: ten one-second slots into five buckets still
        // needs width three to stay within budget.
        assert_eq!(bucket_width_seconds(at(0), at(10), 5), 3);
    }

    #[test]
    fn bucket_count_never_exceeds_the_budget() {
        for (span, budget) in [(10i64, 5usize), (10, 3), (100, 7), (3600, 500), (59, 60)] {
            let start = at(1_700_000_003);
            let end = start + Duration::seconds(span);
            let samples: Vec<Sample> = (0..=span)
                .map(|s| sample(start.timestamp() + s, s as f64))
                .collect();
            let width = bucket_width_seconds(start, end, budget);
            let reduced = downsample(&samples, start, width);
            assert!(
                reduced.len() <= budget,
                "span={span} budget={budget} got {}",
                reduced.len()
            );
        }
    }

    #[test]
    fn means_are_computed_per_bucket() {
        let samples = [
            sample(0, 1.0),
            sample(1, 3.0),
            sample(10, 10.0),
            sample(11, 20.0),
        ];
        let reduced = downsample(&samples, at(0), 10);
        assert_eq!(reduced.len(), 2);
        assert_eq!(reduced[0].timestamp, at(0));
        assert_eq!(reduced[0].value, 2.0);
        assert_eq!(reduced[1].timestamp, at(10));
        assert_eq!(reduced[1].value, 15.0);
    }

    #[test]
    fn output_is_ascending_and_deterministic() {
        let samples: Vec<Sample> = (0..100).map(|s| sample(s, (s % 7) as f64)).collect();
        let first = downsample(&samples, at(0), 9);
        let second = downsample(&samples, at(0), 9);
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(downsample(&[], at(0), 60).is_empty());
    }
}
