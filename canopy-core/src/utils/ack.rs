// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Contiguous-prefix commit tracking.
//!
//! Writers commit half-open `[begin, end)` intervals in any order; readers
//! observe `ack`, the length of the fully covered prefix `[0, ack)`.
//!
//! # Memory Ordering
//!
//! ```text
//! Writer:                              Reader:
//! 1. Fill rows in [begin, end)
//! 2. add_segment(begin, end)
//!    ack.store(_, Release) ──────────► synchronizes-with
//!                                      3. n = ack() (Acquire load)
//!                                      4. Read any row < n
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Tracks the largest contiguous committed prefix of the offset space.
///
/// Writers serialize on a small critical section; readers are lock-free.
#[derive(Debug, Default)]
pub struct AckResponder {
    /// Committed intervals not yet merged into the prefix, begin -> end.
    pending: Mutex<BTreeMap<u64, u64>>,
    /// Length of the contiguous prefix `[0, ack)`.
    ack: AtomicU64,
}

impl AckResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `[begin, end)` into the committed set and advances the prefix
    /// when the new interval connects to it.
    pub fn add_segment(&self, begin: u64, end: u64) {
        if begin >= end {
            return;
        }
        let mut pending = self.pending.lock().unwrap();

        let mut begin = begin;
        let mut end = end;
        // Coalesce with a touching or overlapping predecessor.
        let prev = pending
            .range(..=begin)
            .next_back()
            .map(|(&b, &e)| (b, e));
        if let Some((prev_begin, prev_end)) = prev {
            if prev_end >= begin {
                begin = prev_begin;
                end = end.max(prev_end);
                pending.remove(&prev_begin);
            }
        }
        // Coalesce with successors starting inside or adjacent to the range.
        let merged: Vec<u64> = pending.range(begin..=end).map(|(&b, _)| b).collect();
        for b in merged {
            let e = pending.remove(&b).unwrap();
            end = end.max(e);
        }
        pending.insert(begin, end);

        // Drain every interval now connected to the prefix.
        let mut ack = self.ack.load(Ordering::Relaxed);
        loop {
            let front = pending.first_key_value().map(|(&b, &e)| (b, e));
            match front {
                Some((b, e)) if b <= ack => {
                    pending.remove(&b);
                    ack = ack.max(e);
                }
                _ => break,
            }
        }
        self.ack.store(ack, Ordering::Release);
    }

    /// Current contiguous prefix length.
    pub fn ack(&self) -> u64 {
        self.ack.load(Ordering::Acquire)
    }
}
