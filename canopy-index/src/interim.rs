// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Incremental in-memory float-vector index for growing segments.
//!
//! Rows arrive at reserved offsets in any order; the index tracks the
//! contiguous covered prefix and flips to "synced" once that prefix
//! crosses the configured threshold. After the flip it serves reads
//! directly, which lets the owning segment release the field's raw
//! chunks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use roaring::RoaringBitmap;
use snafu::location;

use canopy_core::utils::ack::AckResponder;
use canopy_core::{Error, Result};

use crate::distance::{float_distance, Metric, TopKCollector};

pub struct InterimIndex {
    metric: Metric,
    dim: usize,
    sync_threshold: u64,
    /// Offset-addressed storage; slots ahead of the covered prefix are
    /// zero-filled until their reservation lands.
    data: RwLock<Vec<f32>>,
    coverage: AckResponder,
    synced: AtomicBool,
}

impl InterimIndex {
    pub fn new(metric: Metric, dim: usize, sync_threshold: u64) -> Self {
        Self {
            metric,
            dim,
            sync_threshold: sync_threshold.max(1),
            data: RwLock::new(Vec::new()),
            coverage: AckResponder::new(),
            synced: AtomicBool::new(false),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Feeds `vectors` (packed rows) at reserved offset `begin`.
    pub fn append(&self, begin: u64, vectors: &[f32]) -> Result<()> {
        if vectors.len() % self.dim != 0 {
            return Err(Error::invalid_input(
                format!(
                    "vector payload of {} floats is not a multiple of dim {}",
                    vectors.len(),
                    self.dim
                ),
                location!(),
            ));
        }
        let rows = (vectors.len() / self.dim) as u64;
        let end = begin + rows;
        {
            let mut data = self.data.write().unwrap();
            let needed = end as usize * self.dim;
            if data.len() < needed {
                data.resize(needed, 0.0);
            }
            let start = begin as usize * self.dim;
            data[start..start + vectors.len()].copy_from_slice(vectors);
        }
        self.coverage.add_segment(begin, end);
        if self.coverage.ack() >= self.sync_threshold {
            self.synced.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// True once the covered prefix crossed the sync threshold.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Offset below which the index owns the data. Zero until synced.
    pub fn sync_watermark(&self) -> u64 {
        if self.is_synced() {
            self.coverage.ack()
        } else {
            0
        }
    }

    /// Top-k scan over rows `[0, row_limit)`, skipping blocked offsets.
    pub fn search(
        &self,
        queries: &[f32],
        nq: usize,
        topk: usize,
        row_limit: u64,
        blocked: &RoaringBitmap,
    ) -> Result<Vec<Vec<(i64, f32)>>> {
        if queries.len() != nq * self.dim {
            return Err(Error::invalid_input(
                format!(
                    "{} query floats do not shape into {} rows of dim {}",
                    queries.len(),
                    nq,
                    self.dim
                ),
                location!(),
            ));
        }
        let data = self.data.read().unwrap();
        let limit = row_limit
            .min(self.coverage.ack())
            .min((data.len() / self.dim) as u64) as usize;

        let mut results = Vec::with_capacity(nq);
        for q in 0..nq {
            let qv = &queries[q * self.dim..(q + 1) * self.dim];
            let mut collector = TopKCollector::new(topk, self.metric);
            for row in 0..limit {
                if blocked.contains(row as u32) {
                    continue;
                }
                let rv = &data[row * self.dim..(row + 1) * self.dim];
                collector.push(row as i64, float_distance(self.metric, qv, rv)?);
            }
            results.push(collector.into_sorted());
        }
        Ok(results)
    }

    /// Copies rows out of the index; a negative offset zero-fills its slot.
    pub fn copy_rows(&self, offsets: &[i64], out: &mut [f32]) -> Result<()> {
        if out.len() != offsets.len() * self.dim {
            return Err(Error::invalid_input(
                "output buffer does not match offset count",
                location!(),
            ));
        }
        let data = self.data.read().unwrap();
        let rows = data.len() / self.dim;
        for (i, &offset) in offsets.iter().enumerate() {
            let dst = &mut out[i * self.dim..(i + 1) * self.dim];
            if offset < 0 {
                dst.fill(0.0);
                continue;
            }
            let row = offset as usize;
            if row >= rows {
                return Err(Error::unexpected(
                    format!("offset {} beyond indexed rows {}", offset, rows),
                    location!(),
                ));
            }
            dst.copy_from_slice(&data[row * self.dim..(row + 1) * self.dim]);
        }
        Ok(())
    }
}
