// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Per-field interim index registry for a growing segment.
//!
//! Float-vector fields accumulate rows into an incremental index as they
//! arrive. Once a field's index covers the configured threshold the field
//! is "synced": reads are served from the index and the raw chunks become
//! releasable. A build failure before the sync point silently degrades
//! the field back to brute-force scans.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use roaring::RoaringBitmap;
use snafu::location;
use tracing::warn;

use canopy_core::data::FieldData;
use canopy_core::{DataType, Error, FieldId, FieldMeta, Result, Schema};
use canopy_index::InterimIndex;

use crate::config::SegmentConfig;

/// Fields eligible for interim indexing.
fn should_index(meta: &FieldMeta, config: &SegmentConfig) -> bool {
    config.enable_interim_index && meta.data_type == DataType::FloatVector
}

struct FieldIndexing {
    index: InterimIndex,
    /// Set on a pre-sync build failure; the field then stays raw-only.
    failed: AtomicBool,
}

pub struct IndexingRecord {
    fields: HashMap<FieldId, FieldIndexing>,
}

impl IndexingRecord {
    pub fn new(schema: &Schema, config: &SegmentConfig) -> Self {
        let mut fields = HashMap::new();
        for meta in schema.fields() {
            if !should_index(meta, config) {
                continue;
            }
            // Dimension validated at schema construction.
            let dim = meta.dim.unwrap_or(0) as usize;
            fields.insert(
                meta.id,
                FieldIndexing {
                    index: InterimIndex::new(
                        config.interim_metric,
                        dim,
                        config.interim_index_threshold,
                    ),
                    failed: AtomicBool::new(false),
                },
            );
        }
        Self { fields }
    }

    pub fn has_field(&self, field_id: FieldId) -> bool {
        self.fields.contains_key(&field_id)
    }

    /// Feeds a newly written range into the field's builder. Non-indexed
    /// fields and non-float payloads pass through untouched; a pre-sync
    /// failure degrades the field instead of surfacing. Post-sync
    /// failures propagate, because the index owns data whose raw chunks
    /// may already be gone.
    pub fn appending_index(&self, begin: u64, field_id: FieldId, data: &FieldData) -> Result<()> {
        let Some(field) = self.fields.get(&field_id) else {
            return Ok(());
        };
        if field.failed.load(Ordering::Acquire) {
            return Ok(());
        }
        let FieldData::FloatVector { dim, data: vectors } = data else {
            return Ok(());
        };
        let result = if *dim as usize != field.index.dim() {
            Err(Error::invalid_input(
                format!(
                    "payload dim {} does not match interim index dim {}",
                    dim,
                    field.index.dim()
                ),
                location!(),
            ))
        } else {
            field.index.append(begin, vectors)
        };
        if let Err(e) = result {
            if field.index.is_synced() {
                return Err(e);
            }
            warn!(field = %field_id, error = %e, "interim index build failed, falling back to brute force");
            field.failed.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// True when the field's index owns a releasable portion of the data.
    pub fn sync_data_with_index(&self, field_id: FieldId) -> bool {
        self.fields
            .get(&field_id)
            .is_some_and(|f| !f.failed.load(Ordering::Acquire) && f.index.is_synced())
    }

    /// Offset below which the index owns the field's data.
    pub fn sync_watermark(&self, field_id: FieldId) -> u64 {
        self.fields
            .get(&field_id)
            .filter(|f| !f.failed.load(Ordering::Acquire))
            .map_or(0, |f| f.index.sync_watermark())
    }

    /// True when the index already covers every offset below `end`, so
    /// the raw chunks do not need this batch.
    pub fn covers(&self, field_id: FieldId, end: u64) -> bool {
        self.sync_data_with_index(field_id) && self.sync_watermark(field_id) >= end
    }

    /// Reads vectors straight from the index, used for bulk subscripts
    /// once raw chunks are released.
    pub fn get_data_from_index(
        &self,
        field_id: FieldId,
        offsets: &[i64],
        out: &mut [f32],
    ) -> Result<()> {
        debug_assert!(self.sync_data_with_index(field_id));
        self.fields[&field_id].index.copy_rows(offsets, out)
    }

    /// Top-k over the index-owned prefix, bounded by the insert barrier.
    pub fn search(
        &self,
        field_id: FieldId,
        queries: &[f32],
        nq: usize,
        topk: usize,
        ins_barrier: u64,
        blocked: &RoaringBitmap,
    ) -> Result<Vec<Vec<(i64, f32)>>> {
        self.fields[&field_id]
            .index
            .search(queries, nq, topk, ins_barrier, blocked)
    }
}
