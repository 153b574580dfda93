// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! The opaque vector-engine seam.
//!
//! The segment and the disk-index lifecycle never see an engine's internal
//! configuration dictionary; they hand it typed parameter structs and get
//! typed hit lists back.

use roaring::RoaringBitmap;

use bytes::Bytes;
use canopy_core::Result;

use crate::distance::Metric;

/// Newest index format this build writes.
pub const CURRENT_INDEX_VERSION: u32 = 4;
/// Oldest index format this build still reads.
pub const MINIMAL_INDEX_VERSION: u32 = 1;

/// A set of query vectors (or raw vectors returned by an engine),
/// packed row-major.
#[derive(Debug, Clone, PartialEq)]
pub enum VectorDataset {
    Float { dim: u32, data: Vec<f32> },
    Binary { dim: u32, data: Vec<u8> },
}

impl VectorDataset {
    pub fn dim(&self) -> u32 {
        match self {
            Self::Float { dim, .. } => *dim,
            Self::Binary { dim, .. } => *dim,
        }
    }

    pub fn rows(&self) -> usize {
        match self {
            Self::Float { dim, data } => data.len() / (*dim).max(1) as usize,
            Self::Binary { dim, data } => data.len() / ((*dim).max(8) as usize / 8),
        }
    }

    /// Byte width of one row.
    pub fn row_width(&self) -> usize {
        match self {
            Self::Float { dim, .. } => *dim as usize * 4,
            Self::Binary { dim, .. } => *dim as usize / 8,
        }
    }
}

/// One serialized artifact: either an inline blob or a reference to a file
/// staged elsewhere (remote path plus size).
#[derive(Debug, Clone)]
pub struct BinaryEntry {
    pub key: String,
    pub value: Option<Bytes>,
    pub size: u64,
}

/// Ordered artifact manifest produced by serialize/upload.
#[derive(Debug, Clone, Default)]
pub struct BinarySet {
    entries: Vec<BinaryEntry>,
}

impl BinarySet {
    pub fn append_blob(&mut self, key: impl Into<String>, value: Bytes) {
        let size = value.len() as u64;
        self.entries.push(BinaryEntry {
            key: key.into(),
            value: Some(value),
            size,
        });
    }

    pub fn append_ref(&mut self, key: impl Into<String>, size: u64) {
        self.entries.push(BinaryEntry {
            key: key.into(),
            value: None,
            size,
        });
    }

    pub fn get(&self, key: &str) -> Option<&BinaryEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn entries(&self) -> &[BinaryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build-time engine parameters. `raw_data_path` points at the staged
/// raw-vector file; artifacts land under `prefix_path`.
#[derive(Debug, Clone)]
pub struct EngineBuildParams {
    pub raw_data_path: String,
    pub prefix_path: String,
    pub threads: usize,
    pub metric: Metric,
    /// Staged auxiliary scalar file, present only when the engine
    /// advertises additional-scalar support.
    pub scalar_data_path: Option<String>,
}

/// Load-time engine parameters.
#[derive(Debug, Clone)]
pub struct EngineLoadParams {
    pub prefix_path: String,
    pub threads: usize,
    pub warm_up: bool,
    pub use_bfs_cache: bool,
}

/// Per-call search parameters handed to the engine.
#[derive(Debug, Clone)]
pub struct EngineSearchParams {
    pub topk: usize,
    pub metric: Metric,
    pub search_list_size: Option<usize>,
    pub beamwidth: usize,
    pub prefix_path: String,
    /// Always reset to 0.0 at query time; the engine budgets its own
    /// PQ cache during load.
    pub pq_code_budget: f32,
    pub radius: Option<f32>,
    pub range_filter: Option<f32>,
}

/// Raw hits from an engine call.
///
/// Top-k searches return exactly `nq * topk` slots, offsets padded with
/// `-1`. Range searches return a variable number of hits per query with
/// `lims` as the `nq + 1` prefix-sum boundary array.
#[derive(Debug, Clone, Default)]
pub struct EngineHits {
    pub offsets: Vec<i64>,
    pub distances: Vec<f32>,
    pub lims: Option<Vec<usize>>,
}

/// Batched best-first iteration over one query's neighborhood.
pub struct AnnIterator {
    hits: std::vec::IntoIter<(i64, f32)>,
}

impl AnnIterator {
    pub fn new(hits: Vec<(i64, f32)>) -> Self {
        Self {
            hits: hits.into_iter(),
        }
    }
}

impl Iterator for AnnIterator {
    type Item = (i64, f32);

    fn next(&mut self) -> Option<Self::Item> {
        self.hits.next()
    }
}

/// The opaque index engine capability.
///
/// Exactly one of `build` or `deserialize` is invoked over an engine's
/// lifetime; `search`/`range_search`/`get_vector_by_ids` are only valid
/// afterwards. The `bitset` argument is a block list: a set bit excludes
/// that offset from the result.
pub trait VectorEngine: Send + Sync {
    fn build(&mut self, params: &EngineBuildParams) -> Result<()>;

    fn serialize(&self, binary_set: &mut BinarySet) -> Result<()>;

    fn deserialize(&mut self, binary_set: BinarySet, params: &EngineLoadParams) -> Result<()>;

    fn search(
        &self,
        query: &VectorDataset,
        params: &EngineSearchParams,
        bitset: &RoaringBitmap,
    ) -> Result<EngineHits>;

    fn range_search(
        &self,
        query: &VectorDataset,
        params: &EngineSearchParams,
        bitset: &RoaringBitmap,
    ) -> Result<EngineHits>;

    fn ann_iterator(
        &self,
        query: &VectorDataset,
        params: &EngineSearchParams,
        bitset: &RoaringBitmap,
    ) -> Result<Vec<AnnIterator>>;

    fn has_raw_data(&self, metric: Metric) -> bool;

    fn is_additional_scalar_supported(&self) -> bool;

    fn dim(&self) -> usize;

    fn get_vector_by_ids(&self, ids: &[i64]) -> Result<VectorDataset>;
}
