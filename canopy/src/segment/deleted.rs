// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Append-only deletion log with a derived per-offset bitmap.

use std::sync::{Arc, Mutex, RwLock};

use roaring::RoaringBitmap;

use canopy_core::{PrimaryKey, Timestamp};

use super::insert_record::InsertRecord;

#[derive(Default)]
struct DeletionLog {
    /// Sorted ascending; `pks[i]` pairs with `timestamps[i]`.
    timestamps: Vec<Timestamp>,
    pks: Vec<PrimaryKey>,
}

struct CachedBitmap {
    del_barrier: usize,
    ins_barrier: u64,
    ts: Timestamp,
    bitmap: Arc<RoaringBitmap>,
}

/// Log of `(ts, pk)` deletions plus a memoized bitmap view.
#[derive(Default)]
pub struct DeletedRecord {
    log: RwLock<DeletionLog>,
    cache: Mutex<Option<CachedBitmap>>,
}

impl DeletedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a batch already sorted by timestamp, merging it into the
    /// globally sorted log.
    pub fn push(&self, pks: Vec<PrimaryKey>, timestamps: &[Timestamp]) {
        debug_assert_eq!(pks.len(), timestamps.len());
        debug_assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
        if pks.is_empty() {
            return;
        }
        let mut log = self.log.write().unwrap();
        // Common case: the batch lands entirely after the existing log.
        if log.timestamps.last().is_none_or(|&last| last <= timestamps[0]) {
            log.timestamps.extend_from_slice(timestamps);
            log.pks.extend(pks);
            return;
        }
        // Out-of-order batch: merge two sorted runs.
        let mut merged_ts = Vec::with_capacity(log.timestamps.len() + timestamps.len());
        let mut merged_pks = Vec::with_capacity(log.pks.len() + pks.len());
        let old_ts = std::mem::take(&mut log.timestamps);
        let old_pks = std::mem::take(&mut log.pks);
        let mut old = old_ts.into_iter().zip(old_pks).peekable();
        let mut new = timestamps.iter().copied().zip(pks).peekable();
        loop {
            let take_old = match (old.peek(), new.peek()) {
                (Some((ots, _)), Some((nts, _))) => ots <= nts,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let (ts, pk) = if take_old {
                old.next().unwrap()
            } else {
                new.next().unwrap()
            };
            merged_ts.push(ts);
            merged_pks.push(pk);
        }
        log.timestamps = merged_ts;
        log.pks = merged_pks;
    }

    /// Number of log entries with timestamp at or below `ts`.
    pub fn barrier(&self, ts: Timestamp) -> usize {
        let log = self.log.read().unwrap();
        log.timestamps.partition_point(|&t| t <= ts)
    }

    pub fn len(&self) -> usize {
        self.log.read().unwrap().timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bitmap of deleted offsets below `ins_barrier`: bit `i` is set when
    /// some logged `(pk, del_ts)` before `del_barrier` names the key at
    /// offset `i`, the row was inserted at or before `ts`, and the
    /// deletion is not older than the insert.
    ///
    /// The latest bitmap is memoized per `(del_barrier, ins_barrier, ts)`.
    pub fn bitmap_at(
        &self,
        del_barrier: usize,
        ins_barrier: u64,
        ts: Timestamp,
        insert_record: &InsertRecord,
    ) -> Arc<RoaringBitmap> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.as_ref() {
                if cached.del_barrier == del_barrier
                    && cached.ins_barrier == ins_barrier
                    && cached.ts == ts
                {
                    return cached.bitmap.clone();
                }
            }
        }

        let mut bitmap = RoaringBitmap::new();
        {
            let log = self.log.read().unwrap();
            let bound = del_barrier.min(log.timestamps.len());
            for i in 0..bound {
                let del_ts = log.timestamps[i];
                for offset in insert_record.pk_index().offsets(&log.pks[i]) {
                    if offset >= ins_barrier {
                        continue;
                    }
                    let insert_ts = insert_record.timestamp(offset);
                    if insert_ts <= ts && del_ts >= insert_ts {
                        bitmap.insert(offset as u32);
                    }
                }
            }
        }
        let bitmap = Arc::new(bitmap);
        *self.cache.lock().unwrap() = Some(CachedBitmap {
            del_barrier,
            ins_barrier,
            ts,
            bitmap: bitmap.clone(),
        });
        bitmap
    }
}
