// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Pre-compiled search descriptors and the result layout shared between
//! the growing segment and the disk index.

use canopy_core::FieldId;

use crate::distance::Metric;

/// Caller-tunable knobs that ride along with a search.
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    /// DiskANN candidate-list size; clamped by the engine-specific bounds.
    pub query_list: Option<usize>,
    /// Presence turns the call into a range search.
    pub radius: Option<f32>,
    /// Secondary range bound, validated against the metric direction.
    pub range_filter: Option<f32>,
}

/// A pre-compiled search over one vector field.
#[derive(Debug, Clone)]
pub struct SearchInfo {
    pub field_id: FieldId,
    pub topk: usize,
    pub metric: Metric,
    /// `-1` leaves distances untouched; `d` rounds to `10^-d`.
    pub round_decimal: i32,
    pub params: SearchParams,
}

impl SearchInfo {
    pub fn new(field_id: FieldId, topk: usize, metric: Metric) -> Self {
        Self {
            field_id,
            topk,
            metric,
            round_decimal: -1,
            params: SearchParams::default(),
        }
    }
}

/// Dense `(nq, topk)` result layout. Missing hits carry offset `-1` and the
/// metric's worst distance.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub seg_offsets: Vec<i64>,
    pub distances: Vec<f32>,
    pub total_nq: usize,
    pub unity_topk: usize,
}

impl SearchResult {
    /// Hits for query `q`, excluding padding slots.
    pub fn hits(&self, q: usize) -> impl Iterator<Item = (i64, f32)> + '_ {
        let begin = q * self.unity_topk;
        let end = begin + self.unity_topk;
        self.seg_offsets[begin..end]
            .iter()
            .zip(self.distances[begin..end].iter())
            .filter(|(o, _)| **o >= 0)
            .map(|(o, d)| (*o, *d))
    }
}

/// Rounds distances in place to `10^-round_decimal`; `-1` is a no-op.
pub fn round_distances(distances: &mut [f32], round_decimal: i32) {
    if round_decimal == -1 {
        return;
    }
    let multiplier = 10f32.powi(round_decimal);
    for d in distances.iter_mut() {
        *d = (*d * multiplier).round() / multiplier;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_distances() {
        let mut distances = vec![1.23456, 0.999];
        round_distances(&mut distances, 2);
        assert_eq!(distances, vec![1.23, 1.0]);

        let mut untouched = vec![1.23456];
        round_distances(&mut untouched, -1);
        assert_eq!(untouched, vec![1.23456]);
    }

    #[test]
    fn test_hits_skip_padding() {
        let result = SearchResult {
            seg_offsets: vec![2, -1, 0, 1],
            distances: vec![0.5, f32::MAX, 0.1, 0.2],
            total_nq: 2,
            unity_topk: 2,
        };
        assert_eq!(result.hits(0).collect::<Vec<_>>(), vec![(2, 0.5)]);
        assert_eq!(
            result.hits(1).collect::<Vec<_>>(),
            vec![(0, 0.1), (1, 0.2)]
        );
    }
}
