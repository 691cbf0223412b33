//! Consensus Detection Aggregation
//!
//! A single pattern variant is noisy: partial visual similarity produces
//! false positives. The aggregator merges raw matches from several variants
//! of the same semantic target into spatially deduplicated consensus points
//! and only keeps points corroborated by a quorum of independent variants.

use std::collections::HashMap;

/// A consensus detection: a location where enough independent pattern
/// variants agree a target is present. Immutable once emitted.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Best confidence over the supporting variants
    pub confidence: f32,
    pub x: i32,
    pub y: i32,
    /// (pattern id, confidence) in arrival order
    pub support: Vec<(String, f32)>,
}

struct ConsensusPoint {
    x: i32,
    y: i32,
    support: Vec<(String, f32)>,
}

/// Spatial hash aggregator. Bucket coordinates are `(x / bucket, y / bucket)`;
/// a new match joins an existing consensus point when one lies within
/// `proximity` on both axes (Chebyshev-style), searched over the 3x3 bucket
/// neighborhood.
pub struct DetectionAggregator {
    proximity_x: i32,
    proximity_y: i32,
    bucket_size: i32,
    min_matches: usize,
    points: Vec<ConsensusPoint>,
    buckets: HashMap<(i32, i32), Vec<usize>>,
}

impl DetectionAggregator {
    pub fn new(proximity: i32, bucket_size: i32, min_matches: usize) -> Self {
        Self {
            proximity_x: proximity,
            proximity_y: proximity,
            bucket_size: bucket_size.max(1),
            min_matches,
            points: Vec::new(),
            buckets: HashMap::new(),
        }
    }

    /// Feed one raw match from one pattern variant. The matcher has already
    /// deduplicated per-pattern; dedup across variants happens here.
    pub fn add(&mut self, pattern: &str, confidence: f32, x: i32, y: i32) {
        let bx = x.div_euclid(self.bucket_size);
        let by = y.div_euclid(self.bucket_size);

        for dx in -1..=1 {
            for dy in -1..=1 {
                let Some(indices) = self.buckets.get(&(bx + dx, by + dy)) else {
                    continue;
                };
                for &i in indices {
                    let point = &self.points[i];
                    if (x - point.x).abs() < self.proximity_x
                        && (y - point.y).abs() < self.proximity_y
                    {
                        self.points[i].support.push((pattern.to_string(), confidence));
                        return;
                    }
                }
            }
        }

        let index = self.points.len();
        self.points.push(ConsensusPoint {
            x,
            y,
            support: vec![(pattern.to_string(), confidence)],
        });
        self.buckets.entry((bx, by)).or_default().push(index);
    }

    /// Emit consensus points that met the quorum. Order is unspecified;
    /// callers treat the result as a set and sort separately.
    pub fn finish(self) -> Vec<Detection> {
        let min_matches = self.min_matches;
        self.points
            .into_iter()
            .filter(|p| p.support.len() >= min_matches)
            .map(|p| {
                let confidence = p
                    .support
                    .iter()
                    .map(|&(_, c)| c)
                    .fold(f32::MIN, f32::max);
                Detection {
                    confidence,
                    x: p.x,
                    y: p.y,
                    support: p.support,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate(matches: &[(&str, f32, i32, i32)], min_matches: usize) -> Vec<Detection> {
        let mut agg = DetectionAggregator::new(10, 10, min_matches);
        for &(name, conf, x, y) in matches {
            agg.add(name, conf, x, y);
        }
        agg.finish()
    }

    #[test]
    fn quorum_of_two_merges_nearby_hits() {
        // Two variants within 5px of each other: exactly one detection,
        // support length 2, confidence is the max of the pair.
        let out = aggregate(
            &[("marker1", 0.95, 50, 50), ("marker2", 0.90, 52, 51)],
            2,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].support.len(), 2);
        assert!((out[0].confidence - 0.95).abs() < 1e-6);
        assert!(out[0].x == 50 || out[0].x == 52);
    }

    #[test]
    fn single_variant_fails_quorum() {
        let out = aggregate(&[("marker1", 0.99, 50, 50)], 2);
        assert!(out.is_empty());
    }

    #[test]
    fn distant_hits_stay_separate() {
        let out = aggregate(
            &[
                ("marker1", 0.9, 50, 50),
                ("marker2", 0.9, 51, 51),
                ("marker1", 0.9, 200, 200),
                ("marker2", 0.9, 203, 199),
            ],
            2,
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn merge_works_across_bucket_boundaries() {
        // 9 and 11 land in different buckets but are 2px apart.
        let out = aggregate(&[("marker1", 0.9, 9, 9), ("marker2", 0.9, 11, 11)], 2);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn aggregation_is_idempotent_on_its_own_output() {
        let first = aggregate(
            &[
                ("marker1", 0.95, 50, 50),
                ("marker2", 0.90, 52, 51),
                ("marker1", 0.80, 300, 120),
                ("marker3", 0.85, 298, 123),
            ],
            2,
        );
        assert_eq!(first.len(), 2);

        // Re-running aggregation on the emitted points changes nothing:
        // no two outputs are within proximity of each other, so each stands
        // alone (quorum 1 keeps them all).
        let mut agg = DetectionAggregator::new(10, 10, 1);
        for d in &first {
            agg.add("consensus", d.confidence, d.x, d.y);
        }
        let second = agg.finish();
        assert_eq!(second.len(), first.len());
        for d in &second {
            assert_eq!(d.support.len(), 1);
        }
    }
}
