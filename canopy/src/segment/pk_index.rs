// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Concurrent primary-key → offset multimap.

use dashmap::DashMap;

use canopy_core::{PrimaryKey, Timestamp};

/// Maps each primary key to every offset it was inserted at. Duplicate
/// keys are expected; entries are never removed.
#[derive(Debug, Default)]
pub struct PrimaryKeyIndex {
    map: DashMap<PrimaryKey, Vec<u64>>,
}

impl PrimaryKeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pk: PrimaryKey, offset: u64) {
        self.map.entry(pk).or_default().push(offset);
    }

    /// Inserts a batch occupying offsets `begin..begin + pks.len()`.
    pub fn insert_batch(&self, pks: &[PrimaryKey], begin: u64) {
        for (i, pk) in pks.iter().enumerate() {
            self.insert(pk.clone(), begin + i as u64);
        }
    }

    pub fn contains(&self, pk: &PrimaryKey) -> bool {
        self.map.contains_key(pk)
    }

    /// Every offset recorded for `pk`, unordered.
    pub fn offsets(&self, pk: &PrimaryKey) -> Vec<u64> {
        self.map.get(pk).map(|v| v.clone()).unwrap_or_default()
    }

    /// Offsets for `pk` whose insert timestamp (via `ts_of`) is at or
    /// below the read timestamp.
    pub fn search(
        &self,
        pk: &PrimaryKey,
        ts: Timestamp,
        ts_of: impl Fn(u64) -> Timestamp,
    ) -> Vec<u64> {
        self.offsets(pk)
            .into_iter()
            .filter(|&offset| ts_of(offset) <= ts)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
