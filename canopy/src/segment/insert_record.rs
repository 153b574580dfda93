// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Aggregate insert-side state: the reservation cursor, system columns,
//! per-field columns, the primary-key index and the ack barrier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use snafu::location;

use canopy_core::utils::ack::AckResponder;
use canopy_core::{DataType, Error, FieldId, PrimaryKey, Result, Schema, Timestamp};

use crate::column::{Column, FixedColumn};
use super::pk_index::PrimaryKeyIndex;

pub struct InsertRecord {
    /// Reservation cursor; `pre_insert` is its only writer.
    reserved: AtomicU64,
    ack_responder: AckResponder,
    timestamps: FixedColumn<u64>,
    row_ids: FixedColumn<i64>,
    columns: HashMap<FieldId, Column>,
    pk_index: PrimaryKeyIndex,
    pk_type: DataType,
}

impl InsertRecord {
    pub fn new(schema: &Schema, chunk_rows: usize) -> Result<Self> {
        let mut columns = HashMap::with_capacity(schema.len());
        for meta in schema.fields() {
            columns.insert(meta.id, Column::new(meta, chunk_rows)?);
        }
        Ok(Self {
            reserved: AtomicU64::new(0),
            ack_responder: AckResponder::new(),
            timestamps: FixedColumn::new(1, chunk_rows),
            row_ids: FixedColumn::new(1, chunk_rows),
            columns,
            pk_index: PrimaryKeyIndex::new(),
            pk_type: schema.primary_field().data_type,
        })
    }

    /// Reserves `n` contiguous offsets and returns the first one.
    /// Linearizable: concurrent callers get disjoint ranges.
    pub fn pre_insert(&self, n: u64) -> u64 {
        self.reserved.fetch_add(n, Ordering::SeqCst)
    }

    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Joins `[begin, begin + n)` to the committed set; the ack barrier
    /// advances once the interval connects to the prefix.
    pub fn commit(&self, begin: u64, n: u64) {
        self.ack_responder.add_segment(begin, begin + n);
    }

    /// Offsets below this are fully committed across all columns.
    pub fn ack(&self) -> u64 {
        self.ack_responder.ack()
    }

    pub fn timestamps(&self) -> &FixedColumn<u64> {
        &self.timestamps
    }

    pub fn row_ids(&self) -> &FixedColumn<i64> {
        &self.row_ids
    }

    pub fn timestamp(&self, offset: u64) -> Timestamp {
        self.timestamps.value(offset)
    }

    pub fn column(&self, field_id: FieldId) -> Result<&Column> {
        self.columns.get(&field_id).ok_or_else(|| {
            Error::invalid_input(format!("no column for field {}", field_id), location!())
        })
    }

    pub fn pk_index(&self) -> &PrimaryKeyIndex {
        &self.pk_index
    }

    pub fn pk_type(&self) -> DataType {
        self.pk_type
    }

    pub fn insert_pks(&self, pks: &[PrimaryKey], begin: u64) {
        self.pk_index.insert_batch(pks, begin);
    }

    pub fn contains_pk(&self, pk: &PrimaryKey) -> bool {
        self.pk_index.contains(pk)
    }

    /// All offsets of `pk` visible at `ts`.
    pub fn search_pk(&self, pk: &PrimaryKey, ts: Timestamp) -> Vec<u64> {
        self.pk_index.search(pk, ts, |offset| self.timestamp(offset))
    }
}
