// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

use canopy_index::Metric;

/// Default rows per column chunk.
pub const DEFAULT_CHUNK_ROWS: usize = 32 * 1024;
/// Default rows the interim index must cover before a field syncs.
pub const DEFAULT_INTERIM_THRESHOLD: u64 = 4096;

/// Tunables for a growing segment.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Rows per chunk in every column.
    pub chunk_rows: usize,
    /// Whether float-vector fields build an interim index as rows arrive.
    pub enable_interim_index: bool,
    /// Contiguous rows the interim index must hold before the field is
    /// considered synced and its raw chunks become releasable.
    pub interim_index_threshold: u64,
    /// Metric the interim index ranks with.
    pub interim_metric: Metric,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            chunk_rows: DEFAULT_CHUNK_ROWS,
            enable_interim_index: false,
            interim_index_threshold: DEFAULT_INTERIM_THRESHOLD,
            interim_metric: Metric::L2,
        }
    }
}
