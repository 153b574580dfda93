// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! The growing segment: a mutable in-memory segment accepting concurrent
//! inserts, deletes and queries.
//!
//! # Thread Safety
//!
//! Every public method takes `&self` and may be called from many worker
//! threads. Visibility is barrier-based: a batch becomes readable once its
//! reservation interval joins the contiguous ack prefix, which `insert`
//! commits as its final step.

pub mod deleted;
pub mod indexing;
pub mod insert_record;
pub mod load;
pub mod pk_index;
mod search;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use roaring::RoaringBitmap;
use snafu::location;

use canopy_core::data::{FieldData, IdArray, InsertData};
use canopy_core::{
    Error, FieldId, PrimaryKey, Result, Schema, SystemField, Timestamp,
};
use canopy_index::engine::VectorDataset;
use canopy_index::{SearchInfo, SearchResult};

use crate::config::SegmentConfig;
use deleted::DeletedRecord;
use indexing::IndexingRecord;
use insert_record::InsertRecord;

pub use load::{FieldLoadInfo, LoadDeletedRecordInfo, LoadFieldDataInfo};

/// System-column payloads returned by [`GrowingSegment::bulk_subscript_system`].
#[derive(Debug, Clone, PartialEq)]
pub enum SystemData {
    RowIds(Vec<i64>),
    Timestamps(Vec<Timestamp>),
}

#[derive(Debug, Default)]
struct SegmentStats {
    mem_size: AtomicUsize,
}

pub struct GrowingSegment {
    id: i64,
    schema: Arc<Schema>,
    config: SegmentConfig,
    pub(crate) insert_record: InsertRecord,
    pub(crate) indexing_record: IndexingRecord,
    deleted_record: DeletedRecord,
    /// Shared by readers of raw chunks; taken exclusively (best effort)
    /// by chunk release.
    pub(crate) chunk_mutex: RwLock<()>,
    stats: SegmentStats,
}

impl GrowingSegment {
    pub fn new(id: i64, schema: Arc<Schema>, config: SegmentConfig) -> Result<Self> {
        let insert_record = InsertRecord::new(&schema, config.chunk_rows)?;
        let indexing_record = IndexingRecord::new(&schema, &config);
        Ok(Self {
            id,
            schema,
            config,
            insert_record,
            indexing_record,
            deleted_record: DeletedRecord::new(),
            chunk_mutex: RwLock::new(()),
            stats: SegmentStats::default(),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Reserves `n` contiguous offsets; concurrent callers receive
    /// disjoint ranges.
    pub fn pre_insert(&self, n: u64) -> u64 {
        self.insert_record.pre_insert(n)
    }

    /// Writes one reserved batch. Steps are ordered: system columns and
    /// field columns first, then the primary-key index, then the ack
    /// commit, so readers never observe a partially written batch.
    ///
    /// On error the reservation is never committed; its offsets stay
    /// unacked and unobservable.
    pub fn insert(
        &self,
        reserved_begin: u64,
        num_rows: usize,
        row_ids: &[i64],
        timestamps: &[Timestamp],
        data: &InsertData,
    ) -> Result<()> {
        if data.num_rows() != num_rows {
            return Err(Error::invalid_input(
                format!(
                    "insert data carries {} rows, caller declared {}",
                    data.num_rows(),
                    num_rows
                ),
                location!(),
            ));
        }
        if row_ids.len() != num_rows || timestamps.len() != num_rows {
            return Err(Error::invalid_input(
                "row id and timestamp arrays must match the row count",
                location!(),
            ));
        }

        // Timestamps are pre-sorted by the caller; no re-sort here.
        self.insert_record
            .timestamps()
            .write_rows(reserved_begin, timestamps);
        self.insert_record.row_ids().write_rows(reserved_begin, row_ids);
        self.stats.mem_size.fetch_add(
            num_rows * (std::mem::size_of::<Timestamp>() + std::mem::size_of::<i64>()),
            Ordering::Relaxed,
        );

        let end = reserved_begin + num_rows as u64;
        for meta in self.schema.fields() {
            let field_data = data.field(meta.id).ok_or_else(|| {
                Error::invalid_input(
                    format!("insert data is missing field {}", meta.id),
                    location!(),
                )
            })?;
            if field_data.data_type() != meta.data_type {
                return Err(Error::invalid_input(
                    format!(
                        "field {} expects {}, payload is {}",
                        meta.id,
                        meta.data_type,
                        field_data.data_type()
                    ),
                    location!(),
                ));
            }

            if self.config.enable_interim_index {
                self.indexing_record
                    .appending_index(reserved_begin, meta.id, field_data)?;
            }
            if !self.indexing_record.covers(meta.id, end) {
                self.insert_record
                    .column(meta.id)?
                    .append(reserved_begin, field_data)?;
            }
            self.stats
                .mem_size
                .fetch_add(field_data.byte_size(), Ordering::Relaxed);

            self.try_remove_chunks(meta.id);
        }

        let primary = data
            .field(self.schema.primary_field_id())
            .ok_or_else(|| {
                Error::invalid_input("insert data is missing the primary field", location!())
            })?
            .primary_keys()?;
        self.insert_record.insert_pks(&primary, reserved_begin);

        self.insert_record.commit(reserved_begin, num_rows as u64);
        Ok(())
    }

    /// Applies a deletion batch. Ids whose primary key was never inserted
    /// are silently dropped; the survivors are sorted by `(ts, pk)` and
    /// appended to the deletion log.
    pub fn delete(
        &self,
        num_rows: usize,
        ids: &IdArray,
        timestamps: &[Timestamp],
    ) -> Result<()> {
        if ids.len() != num_rows || timestamps.len() != num_rows {
            return Err(Error::invalid_input(
                "id and timestamp arrays must match the row count",
                location!(),
            ));
        }
        let pks = ids.to_keys(self.insert_record.pk_type())?;

        let mut ordering: Vec<(Timestamp, PrimaryKey)> = timestamps
            .iter()
            .copied()
            .zip(pks)
            .filter(|(_, pk)| self.insert_record.contains_pk(pk))
            .collect();
        if ordering.is_empty() {
            return Ok(());
        }
        ordering.sort();

        let mut sorted_ts = Vec::with_capacity(ordering.len());
        let mut sorted_pks = Vec::with_capacity(ordering.len());
        for (ts, pk) in ordering {
            sorted_ts.push(ts);
            self.stats.mem_size.fetch_add(
                std::mem::size_of::<Timestamp>() + pk.byte_size(),
                Ordering::Relaxed,
            );
            sorted_pks.push(pk);
        }
        self.deleted_record.push(sorted_pks, &sorted_ts);
        Ok(())
    }

    /// Bulk-loads a previously persisted deletion log. Unlike [`delete`],
    /// no primary-key existence filter is applied.
    ///
    /// [`delete`]: GrowingSegment::delete
    pub fn load_deleted_record(&self, info: &LoadDeletedRecordInfo) -> Result<()> {
        if info.row_count == 0 {
            return Err(Error::invalid_input(
                "deleted record load carries no rows",
                location!(),
            ));
        }
        if info.primary_keys.len() != info.row_count || info.timestamps.len() != info.row_count {
            return Err(Error::invalid_input(
                "deleted record arrays must match the row count",
                location!(),
            ));
        }
        let pks = info.primary_keys.to_keys(self.insert_record.pk_type())?;
        let mut ordering: Vec<(Timestamp, PrimaryKey)> =
            info.timestamps.iter().copied().zip(pks).collect();
        ordering.sort();
        let mut sorted_ts = Vec::with_capacity(ordering.len());
        let mut sorted_pks = Vec::with_capacity(ordering.len());
        for (ts, pk) in ordering {
            self.stats.mem_size.fetch_add(
                std::mem::size_of::<Timestamp>() + pk.byte_size(),
                Ordering::Relaxed,
            );
            sorted_ts.push(ts);
            sorted_pks.push(pk);
        }
        self.deleted_record.push(sorted_pks, &sorted_ts);
        Ok(())
    }

    /// OR-composes the deletion bitmap at `(ins_barrier, ts)` into
    /// `bitset`. No-op when no deletion is visible at `ts`. Idempotent
    /// for fixed arguments.
    pub fn mask_with_delete(
        &self,
        bitset: &mut RoaringBitmap,
        ins_barrier: u64,
        ts: Timestamp,
    ) {
        let del_barrier = self.deleted_record.barrier(ts);
        if del_barrier == 0 {
            return;
        }
        let bitmap =
            self.deleted_record
                .bitmap_at(del_barrier, ins_barrier, ts, &self.insert_record);
        *bitset |= bitmap.as_ref();
    }

    /// Deliberately a no-op on growing segments: timestamp visibility is
    /// bounded through [`get_active_count`] instead, unlike sealed
    /// segments.
    ///
    /// [`get_active_count`]: GrowingSegment::get_active_count
    pub fn mask_with_timestamps(&self, _bitset: &mut RoaringBitmap, _ts: Timestamp) {}

    /// Number of rows visible at `ts`: an upper-bound search over the
    /// (caller-sorted) timestamp column, bounded by the ack barrier.
    pub fn get_active_count(&self, ts: Timestamp) -> u64 {
        let row_count = self.insert_record.ack();
        let mut lo = 0u64;
        let mut hi = row_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.insert_record.timestamp(mid) <= ts {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Rows fully committed so far.
    pub fn row_count(&self) -> u64 {
        self.insert_record.ack()
    }

    /// Chunks backing the acked prefix.
    pub fn num_chunk(&self) -> u64 {
        canopy_core::utils::upper_div(self.insert_record.ack(), self.config.chunk_rows as u64)
    }

    /// Top-k or range search over one vector field, honoring deletions
    /// and the read timestamp. `bitset` is the externally computed filter
    /// (set bit = row excluded); the deletion mask is composed in here.
    pub fn vector_search(
        &self,
        search_info: &SearchInfo,
        query: &VectorDataset,
        ts: Timestamp,
        bitset: &RoaringBitmap,
        out: &mut SearchResult,
    ) -> Result<()> {
        let ins_barrier = self.get_active_count(ts);
        let mut filter = bitset.clone();
        self.mask_with_delete(&mut filter, ins_barrier, ts);
        search::search_on_growing(self, search_info, query, ins_barrier, &filter, out)
    }

    /// Gathers rows of one user field. Offsets equal to
    /// `INVALID_SEG_OFFSET` yield zeroed slots. Synced vector fields are
    /// served from the interim index; everything else reads raw chunks
    /// under the shared chunk lock.
    pub fn bulk_subscript(&self, field_id: FieldId, offsets: &[i64]) -> Result<FieldData> {
        let meta = self.schema.field(field_id)?;
        if meta.is_vector() && self.indexing_record.sync_data_with_index(field_id) {
            let dim = meta.dim()? as usize;
            let mut data = vec![0f32; offsets.len() * dim];
            self.indexing_record
                .get_data_from_index(field_id, offsets, &mut data)?;
            return Ok(FieldData::FloatVector {
                dim: dim as u32,
                data,
            });
        }
        let _chunk_guard = self.chunk_mutex.read().unwrap();
        self.insert_record.column(field_id)?.bulk_subscript(offsets)
    }

    /// Gathers a system column by offset.
    pub fn bulk_subscript_system(
        &self,
        system: SystemField,
        offsets: &[i64],
    ) -> Result<SystemData> {
        let data = match system {
            SystemField::RowId => SystemData::RowIds(
                offsets
                    .iter()
                    .map(|&offset| {
                        if offset < 0 {
                            0
                        } else {
                            self.insert_record.row_ids().value(offset as u64)
                        }
                    })
                    .collect(),
            ),
            SystemField::Timestamp => SystemData::Timestamps(
                offsets
                    .iter()
                    .map(|&offset| {
                        if offset < 0 {
                            0
                        } else {
                            self.insert_record.timestamp(offset as u64)
                        }
                    })
                    .collect(),
            ),
        };
        Ok(data)
    }

    /// For each input id, every matching offset whose insert timestamp is
    /// at or below `ts` and which is not deleted as of `ts`. The returned
    /// id array repeats a key once per matching offset.
    pub fn search_ids(&self, ids: &IdArray, ts: Timestamp) -> Result<(IdArray, Vec<u64>)> {
        let pk_type = self.insert_record.pk_type();
        let pks = ids.to_keys(pk_type)?;
        let del_barrier = self.deleted_record.barrier(ts);
        let deleted = (del_barrier > 0).then(|| {
            self.deleted_record.bitmap_at(
                del_barrier,
                self.insert_record.ack(),
                ts,
                &self.insert_record,
            )
        });
        let mut out_ids = IdArray::empty_like(pk_type)?;
        let mut out_offsets = Vec::new();
        for pk in &pks {
            for offset in self.insert_record.search_pk(pk, ts) {
                if deleted
                    .as_ref()
                    .is_some_and(|bitmap| bitmap.contains(offset as u32))
                {
                    continue;
                }
                out_ids.push(pk)?;
                out_offsets.push(offset);
            }
        }
        Ok((out_ids, out_offsets))
    }

    /// Best-effort raw-chunk release for an index-synced field. Never
    /// blocks readers: a contended chunk lock simply defers the release
    /// to the next call.
    pub fn try_remove_chunks(&self, field_id: FieldId) {
        if !self.indexing_record.sync_data_with_index(field_id) {
            return;
        }
        let Ok(column) = self.insert_record.column(field_id) else {
            return;
        };
        if column.num_chunk() == 0 {
            return;
        }
        if let Ok(_guard) = self.chunk_mutex.try_write() {
            column.clear();
        }
    }

    /// Rows of one chunk of a user field, bounded by the ack barrier.
    pub fn chunk_data(&self, field_id: FieldId, chunk_id: u64) -> Result<FieldData> {
        let ack = self.insert_record.ack();
        let begin = chunk_id * self.config.chunk_rows as u64;
        let end = ((chunk_id + 1) * self.config.chunk_rows as u64).min(ack);
        if begin >= end {
            return Err(Error::invalid_input(
                format!("chunk {} is beyond the acked prefix", chunk_id),
                location!(),
            ));
        }
        let offsets: Vec<i64> = (begin..end).map(|o| o as i64).collect();
        self.bulk_subscript(field_id, &offsets)
    }

    /// Bytes of row data held in memory.
    pub fn mem_size(&self) -> usize {
        self.stats.mem_size.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for GrowingSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowingSegment")
            .field("id", &self.id)
            .field("reserved", &self.insert_record.reserved())
            .field("ack", &self.insert_record.ack())
            .field("mem_size", &self.mem_size())
            .finish()
    }
}
