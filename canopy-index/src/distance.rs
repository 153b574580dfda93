// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Distance metrics and the shared top-k collector.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};
use snafu::location;

use canopy_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    L2,
    InnerProduct,
    Cosine,
    Hamming,
}

impl Metric {
    /// Whether smaller distances rank better under this metric.
    pub fn smaller_is_better(&self) -> bool {
        matches!(self, Self::L2 | Self::Hamming)
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "L2" => Ok(Self::L2),
            "IP" => Ok(Self::InnerProduct),
            "COSINE" => Ok(Self::Cosine),
            "HAMMING" => Ok(Self::Hamming),
            other => Err(Error::invalid_input(
                format!("unknown metric type {}", other),
                location!(),
            )),
        }
    }

    /// Distance used to pad missing hits in a fixed (nq, topk) layout.
    pub fn worst_distance(&self) -> f32 {
        if self.smaller_is_better() {
            f32::MAX
        } else {
            f32::MIN
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::L2 => "L2",
            Self::InnerProduct => "IP",
            Self::Cosine => "COSINE",
            Self::Hamming => "HAMMING",
        };
        write!(f, "{}", name)
    }
}

pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot = inner_product(a, b);
    let norm = (inner_product(a, a) * inner_product(b, b)).sqrt();
    if norm == 0.0 {
        0.0
    } else {
        dot / norm
    }
}

pub fn hamming(a: &[u8], b: &[u8]) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Float-vector distance under `metric`. Hamming is not defined for floats.
pub fn float_distance(metric: Metric, a: &[f32], b: &[f32]) -> Result<f32> {
    match metric {
        Metric::L2 => Ok(l2_squared(a, b)),
        Metric::InnerProduct => Ok(inner_product(a, b)),
        Metric::Cosine => Ok(cosine(a, b)),
        Metric::Hamming => Err(Error::data_type(
            "hamming distance is only defined for binary vectors",
            location!(),
        )),
    }
}

/// Validates a range-search filter bound against the metric direction.
///
/// For smaller-is-better metrics the filter is the inner bound
/// (`range_filter <= dist < radius`); for larger-is-better metrics it is the
/// outer bound (`radius < dist <= range_filter`).
pub fn check_range_search_params(radius: f32, range_filter: f32, metric: Metric) -> Result<()> {
    let valid = if metric.smaller_is_better() {
        range_filter < radius
    } else {
        range_filter > radius
    };
    if !valid {
        return Err(Error::invalid_input(
            format!(
                "invalid range search bounds for {}: radius {}, range_filter {}",
                metric, radius, range_filter
            ),
            location!(),
        ));
    }
    Ok(())
}

/// True when `dist` falls inside the range-search window.
pub fn range_hit(metric: Metric, dist: f32, radius: f32, range_filter: Option<f32>) -> bool {
    if metric.smaller_is_better() {
        dist < radius && range_filter.is_none_or(|f| dist >= f)
    } else {
        dist > radius && range_filter.is_none_or(|f| dist <= f)
    }
}

struct Candidate {
    /// Ranking key; negated for larger-is-better metrics so the binary
    /// heap always evicts the worst candidate.
    key: f32,
    offset: i64,
    dist: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.offset == other.offset
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.total_cmp(&other.key)
    }
}

/// Fixed-capacity best-k accumulator shared by every brute-force path.
pub struct TopKCollector {
    k: usize,
    ascending: bool,
    heap: BinaryHeap<Candidate>,
}

impl TopKCollector {
    pub fn new(k: usize, metric: Metric) -> Self {
        Self {
            k,
            ascending: metric.smaller_is_better(),
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn push(&mut self, offset: i64, dist: f32) {
        if self.k == 0 {
            return;
        }
        let key = if self.ascending { dist } else { -dist };
        if self.heap.len() < self.k {
            self.heap.push(Candidate { key, offset, dist });
        } else if let Some(worst) = self.heap.peek() {
            if key < worst.key {
                self.heap.pop();
                self.heap.push(Candidate { key, offset, dist });
            }
        }
    }

    /// Drains the collector, best hit first.
    pub fn into_sorted(self) -> Vec<(i64, f32)> {
        let mut hits = self.heap.into_vec();
        hits.sort_by(|a, b| a.key.total_cmp(&b.key));
        hits.into_iter().map(|c| (c.offset, c.dist)).collect()
    }
}
