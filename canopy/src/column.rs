// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Chunked, append-only columnar storage for one field.
//!
//! Each column is a sequence of fixed-size chunks whose concatenation
//! forms a dense array indexed by row offset. Writers land rows at
//! reserved offsets; readers only address offsets below the segment's ack
//! barrier, which is published after the rows are fully written.
//!
//! # Safety Model
//!
//! Fixed-width chunks store `MaybeUninit` cells behind `UnsafeCell`:
//!
//! 1. **Disjoint writers**: offset reservations never overlap, so no two
//!    writers touch the same cell.
//! 2. **Barrier-gated readers**: a reader's offset is below the ack
//!    barrier, whose Release store in the ack responder happened after the
//!    cell was written (the Acquire load on the barrier synchronizes).
//! 3. **Append-only**: cells are written once and never mutated; `clear`
//!    requires the segment-level exclusive chunk lock.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use half::{bf16, f16};
use snafu::location;

use canopy_core::data::{ArrayValue, FieldData};
use canopy_core::{DataType, Error, FieldMeta, Result, INVALID_SEG_OFFSET};

struct FixedChunk<T> {
    cells: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T: Copy> FixedChunk<T> {
    fn new(len: usize) -> Self {
        let mut cells = Vec::with_capacity(len);
        for _ in 0..len {
            cells.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Self {
            cells: cells.into_boxed_slice(),
        }
    }
}

// SAFETY: cells are written exactly once at disjoint offsets and reads are
// gated by the ack barrier's Release/Acquire pair; see the module docs.
unsafe impl<T: Copy + Send> Send for FixedChunk<T> {}
unsafe impl<T: Copy + Send + Sync> Sync for FixedChunk<T> {}

/// Fixed-width column: `elems_per_row` elements of `T` per row.
pub struct FixedColumn<T> {
    elems_per_row: usize,
    chunk_rows: usize,
    chunks: RwLock<Vec<Arc<FixedChunk<T>>>>,
    /// High-water mark of written rows; stops advancing once the owning
    /// field syncs and inserts bypass the column.
    written_rows: AtomicU64,
}

impl<T: Copy + Default + Send + Sync> FixedColumn<T> {
    pub fn new(elems_per_row: usize, chunk_rows: usize) -> Self {
        assert!(elems_per_row > 0, "elems_per_row must be > 0");
        assert!(chunk_rows > 0, "chunk_rows must be > 0");
        Self {
            elems_per_row,
            chunk_rows,
            chunks: RwLock::new(Vec::new()),
            written_rows: AtomicU64::new(0),
        }
    }

    pub fn elems_per_row(&self) -> usize {
        self.elems_per_row
    }

    /// Writes `src` (packed rows) at row `begin`, allocating whole chunks
    /// as needed. Offsets in the range must be unreserved by any other
    /// writer.
    pub fn write_rows(&self, begin: u64, src: &[T]) {
        debug_assert_eq!(src.len() % self.elems_per_row, 0);
        let rows = (src.len() / self.elems_per_row) as u64;
        if rows == 0 {
            return;
        }
        let end = begin + rows;
        self.ensure_rows(end);

        let chunks = self.chunks.read().unwrap();
        for row in 0..rows {
            let offset = begin + row;
            let chunk = &chunks[(offset / self.chunk_rows as u64) as usize];
            let cell_base = (offset % self.chunk_rows as u64) as usize * self.elems_per_row;
            let src_base = row as usize * self.elems_per_row;
            for i in 0..self.elems_per_row {
                // SAFETY: this offset belongs to the caller's reservation
                // and no reader observes it until the ack barrier moves.
                unsafe {
                    let cell = chunks_cell(chunk, cell_base + i);
                    std::ptr::write(cell, MaybeUninit::new(src[src_base + i]));
                }
            }
        }
        drop(chunks);
        self.written_rows.fetch_max(end, Ordering::Release);
    }

    fn ensure_rows(&self, rows: u64) {
        let needed_chunks = rows.div_ceil(self.chunk_rows as u64) as usize;
        {
            let chunks = self.chunks.read().unwrap();
            if chunks.len() >= needed_chunks {
                return;
            }
        }
        let mut chunks = self.chunks.write().unwrap();
        while chunks.len() < needed_chunks {
            chunks.push(Arc::new(FixedChunk::new(
                self.chunk_rows * self.elems_per_row,
            )));
        }
    }

    /// Reads the first element of a row. The offset must be below the ack
    /// barrier and the chunk must not have been released.
    pub fn value(&self, offset: u64) -> T {
        let mut out = [T::default()];
        self.read_row_into(offset, &mut out[..1]);
        out[0]
    }

    /// Copies one full row into `out`.
    pub fn copy_row(&self, offset: u64, out: &mut [T]) {
        debug_assert_eq!(out.len(), self.elems_per_row);
        self.read_row_into(offset, out);
    }

    /// Borrowed access to one row, valid for the duration of the closure.
    pub fn with_row<R>(&self, offset: u64, f: impl FnOnce(&[T]) -> R) -> R {
        let chunks = self.chunks.read().unwrap();
        let chunk = &chunks[(offset / self.chunk_rows as u64) as usize];
        let base = (offset % self.chunk_rows as u64) as usize * self.elems_per_row;
        // SAFETY: offset is below the ack barrier, so every cell of the
        // row was initialized before the barrier was published.
        let row = unsafe {
            std::slice::from_raw_parts(
                (chunk.cells[base].get() as *const MaybeUninit<T>).cast::<T>(),
                self.elems_per_row,
            )
        };
        f(row)
    }

    fn read_row_into(&self, offset: u64, out: &mut [T]) {
        self.with_row(offset, |row| out.copy_from_slice(&row[..out.len()]));
    }

    pub fn num_chunk(&self) -> usize {
        self.chunks.read().unwrap().len()
    }

    /// Rows written so far (not necessarily contiguous).
    pub fn written_rows(&self) -> u64 {
        self.written_rows.load(Ordering::Acquire)
    }

    /// A contiguous snapshot of chunk `chunk_id`, bounded to `rows` rows.
    pub fn span(&self, chunk_id: usize, rows: usize) -> Option<FixedSpan<T>> {
        let chunks = self.chunks.read().unwrap();
        let chunk = chunks.get(chunk_id)?.clone();
        Some(FixedSpan {
            chunk,
            elems: rows.min(self.chunk_rows) * self.elems_per_row,
        })
    }

    /// Releases every chunk. Only legal when the owning segment holds the
    /// chunk lock exclusively and the field is index-synced.
    pub fn clear(&self) {
        self.chunks.write().unwrap().clear();
    }
}

fn chunks_cell<T>(chunk: &FixedChunk<T>, index: usize) -> *mut MaybeUninit<T> {
    chunk.cells[index].get()
}

/// Contiguous view over one chunk of a fixed-width column.
pub struct FixedSpan<T> {
    chunk: Arc<FixedChunk<T>>,
    elems: usize,
}

impl<T: Copy> FixedSpan<T> {
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the caller bounded the span to rows below the ack
        // barrier; the Arc keeps the chunk alive past a concurrent clear.
        unsafe {
            std::slice::from_raw_parts(
                (self.chunk.cells[0].get() as *const MaybeUninit<T>).cast::<T>(),
                self.elems,
            )
        }
    }
}

struct VarChunk<T> {
    cells: Box<[OnceLock<T>]>,
}

impl<T> VarChunk<T> {
    fn new(len: usize) -> Self {
        let mut cells = Vec::with_capacity(len);
        for _ in 0..len {
            cells.push(OnceLock::new());
        }
        Self {
            cells: cells.into_boxed_slice(),
        }
    }
}

/// Variable-length column: one heap value per row, set exactly once.
pub struct VarColumn<T> {
    chunk_rows: usize,
    chunks: RwLock<Vec<Arc<VarChunk<T>>>>,
}

impl<T: Clone + Send + Sync> VarColumn<T> {
    pub fn new(chunk_rows: usize) -> Self {
        assert!(chunk_rows > 0, "chunk_rows must be > 0");
        Self {
            chunk_rows,
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn write_rows(&self, begin: u64, values: &[T]) {
        if values.is_empty() {
            return;
        }
        let end = begin + values.len() as u64;
        self.ensure_rows(end);
        let chunks = self.chunks.read().unwrap();
        for (i, value) in values.iter().enumerate() {
            let offset = begin + i as u64;
            let chunk = &chunks[(offset / self.chunk_rows as u64) as usize];
            let cell = &chunk.cells[(offset % self.chunk_rows as u64) as usize];
            // Offsets are never reused; a set cell means a reservation bug.
            let newly_set = cell.set(value.clone()).is_ok();
            debug_assert!(newly_set, "row {} written twice", offset);
        }
    }

    fn ensure_rows(&self, rows: u64) {
        let needed_chunks = rows.div_ceil(self.chunk_rows as u64) as usize;
        {
            let chunks = self.chunks.read().unwrap();
            if chunks.len() >= needed_chunks {
                return;
            }
        }
        let mut chunks = self.chunks.write().unwrap();
        while chunks.len() < needed_chunks {
            chunks.push(Arc::new(VarChunk::new(self.chunk_rows)));
        }
    }

    /// Borrowed access to one row, valid for the duration of the closure.
    pub fn with_value<R>(&self, offset: u64, f: impl FnOnce(&T) -> R) -> R {
        let chunks = self.chunks.read().unwrap();
        let chunk = &chunks[(offset / self.chunk_rows as u64) as usize];
        let cell = chunk.cells[(offset % self.chunk_rows as u64) as usize]
            .get()
            .expect("offset below the ack barrier must be initialized");
        f(cell)
    }

    pub fn value(&self, offset: u64) -> T {
        self.with_value(offset, |v| v.clone())
    }

    pub fn num_chunk(&self) -> usize {
        self.chunks.read().unwrap().len()
    }

    pub fn clear(&self) {
        self.chunks.write().unwrap().clear();
    }
}

/// Per-field column storage, dispatched by element type.
pub enum Column {
    Bool(FixedColumn<bool>),
    Int8(FixedColumn<i8>),
    Int16(FixedColumn<i16>),
    Int32(FixedColumn<i32>),
    Int64(FixedColumn<i64>),
    Float32(FixedColumn<f32>),
    Float64(FixedColumn<f64>),
    Utf8(VarColumn<String>),
    Json(VarColumn<serde_json::Value>),
    Array(VarColumn<ArrayValue>),
    FloatVector(FixedColumn<f32>),
    Float16Vector(FixedColumn<f16>),
    BFloat16Vector(FixedColumn<bf16>),
    BinaryVector(FixedColumn<u8>),
}

impl Column {
    pub fn new(meta: &FieldMeta, chunk_rows: usize) -> Result<Self> {
        let column = match meta.data_type {
            DataType::Bool => Self::Bool(FixedColumn::new(1, chunk_rows)),
            DataType::Int8 => Self::Int8(FixedColumn::new(1, chunk_rows)),
            DataType::Int16 => Self::Int16(FixedColumn::new(1, chunk_rows)),
            DataType::Int32 => Self::Int32(FixedColumn::new(1, chunk_rows)),
            DataType::Int64 => Self::Int64(FixedColumn::new(1, chunk_rows)),
            DataType::Float32 => Self::Float32(FixedColumn::new(1, chunk_rows)),
            DataType::Float64 => Self::Float64(FixedColumn::new(1, chunk_rows)),
            DataType::Utf8 => Self::Utf8(VarColumn::new(chunk_rows)),
            DataType::Json => Self::Json(VarColumn::new(chunk_rows)),
            DataType::Array => Self::Array(VarColumn::new(chunk_rows)),
            DataType::FloatVector => {
                Self::FloatVector(FixedColumn::new(meta.dim()? as usize, chunk_rows))
            }
            DataType::Float16Vector => {
                Self::Float16Vector(FixedColumn::new(meta.dim()? as usize, chunk_rows))
            }
            DataType::BFloat16Vector => {
                Self::BFloat16Vector(FixedColumn::new(meta.dim()? as usize, chunk_rows))
            }
            DataType::BinaryVector => {
                Self::BinaryVector(FixedColumn::new(meta.dim()? as usize / 8, chunk_rows))
            }
        };
        Ok(column)
    }

    /// Writes a batch at row `begin`; the payload type must match the
    /// column type.
    pub fn append(&self, begin: u64, data: &FieldData) -> Result<()> {
        match (self, data) {
            (Self::Bool(col), FieldData::Bool(v)) => col.write_rows(begin, v),
            (Self::Int8(col), FieldData::Int8(v)) => col.write_rows(begin, v),
            (Self::Int16(col), FieldData::Int16(v)) => col.write_rows(begin, v),
            (Self::Int32(col), FieldData::Int32(v)) => col.write_rows(begin, v),
            (Self::Int64(col), FieldData::Int64(v)) => col.write_rows(begin, v),
            (Self::Float32(col), FieldData::Float32(v)) => col.write_rows(begin, v),
            (Self::Float64(col), FieldData::Float64(v)) => col.write_rows(begin, v),
            (Self::Utf8(col), FieldData::Utf8(v)) => col.write_rows(begin, v),
            (Self::Json(col), FieldData::Json(v)) => col.write_rows(begin, v),
            (Self::Array(col), FieldData::Array(v)) => col.write_rows(begin, v),
            (Self::FloatVector(col), FieldData::FloatVector { dim, data }) => {
                check_dim(col.elems_per_row(), *dim as usize)?;
                col.write_rows(begin, data);
            }
            (Self::Float16Vector(col), FieldData::Float16Vector { dim, data }) => {
                check_dim(col.elems_per_row(), *dim as usize)?;
                col.write_rows(begin, data);
            }
            (Self::BFloat16Vector(col), FieldData::BFloat16Vector { dim, data }) => {
                check_dim(col.elems_per_row(), *dim as usize)?;
                col.write_rows(begin, data);
            }
            (Self::BinaryVector(col), FieldData::BinaryVector { dim, data }) => {
                check_dim(col.elems_per_row(), *dim as usize / 8)?;
                col.write_rows(begin, data);
            }
            (col, data) => {
                return Err(Error::data_type(
                    format!(
                        "payload of {} does not match column of {}",
                        data.data_type(),
                        col.data_type()
                    ),
                    location!(),
                ));
            }
        }
        Ok(())
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::Int8(_) => DataType::Int8,
            Self::Int16(_) => DataType::Int16,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float32(_) => DataType::Float32,
            Self::Float64(_) => DataType::Float64,
            Self::Utf8(_) => DataType::Utf8,
            Self::Json(_) => DataType::Json,
            Self::Array(_) => DataType::Array,
            Self::FloatVector(_) => DataType::FloatVector,
            Self::Float16Vector(_) => DataType::Float16Vector,
            Self::BFloat16Vector(_) => DataType::BFloat16Vector,
            Self::BinaryVector(_) => DataType::BinaryVector,
        }
    }

    pub fn num_chunk(&self) -> usize {
        match self {
            Self::Bool(c) => c.num_chunk(),
            Self::Int8(c) => c.num_chunk(),
            Self::Int16(c) => c.num_chunk(),
            Self::Int32(c) => c.num_chunk(),
            Self::Int64(c) => c.num_chunk(),
            Self::Float32(c) => c.num_chunk(),
            Self::Float64(c) => c.num_chunk(),
            Self::Utf8(c) => c.num_chunk(),
            Self::Json(c) => c.num_chunk(),
            Self::Array(c) => c.num_chunk(),
            Self::FloatVector(c) => c.num_chunk(),
            Self::Float16Vector(c) => c.num_chunk(),
            Self::BFloat16Vector(c) => c.num_chunk(),
            Self::BinaryVector(c) => c.num_chunk(),
        }
    }

    pub fn clear(&self) {
        match self {
            Self::Bool(c) => c.clear(),
            Self::Int8(c) => c.clear(),
            Self::Int16(c) => c.clear(),
            Self::Int32(c) => c.clear(),
            Self::Int64(c) => c.clear(),
            Self::Float32(c) => c.clear(),
            Self::Float64(c) => c.clear(),
            Self::Utf8(c) => c.clear(),
            Self::Json(c) => c.clear(),
            Self::Array(c) => c.clear(),
            Self::FloatVector(c) => c.clear(),
            Self::Float16Vector(c) => c.clear(),
            Self::BFloat16Vector(c) => c.clear(),
            Self::BinaryVector(c) => c.clear(),
        }
    }

    pub fn as_float_vector(&self) -> Option<&FixedColumn<f32>> {
        match self {
            Self::FloatVector(c) => Some(c),
            _ => None,
        }
    }

    /// Gathers rows into a fresh payload; `INVALID_SEG_OFFSET` slots come
    /// back zeroed (empty for variable-length types).
    pub fn bulk_subscript(&self, offsets: &[i64]) -> Result<FieldData> {
        fn gather_fixed<T: Copy + Default + Send + Sync>(
            col: &FixedColumn<T>,
            offsets: &[i64],
        ) -> Vec<T> {
            let epr = col.elems_per_row();
            let mut out = vec![T::default(); offsets.len() * epr];
            for (i, &offset) in offsets.iter().enumerate() {
                if offset == INVALID_SEG_OFFSET {
                    continue;
                }
                col.copy_row(offset as u64, &mut out[i * epr..(i + 1) * epr]);
            }
            out
        }

        fn gather_var<T: Clone + Default + Send + Sync>(
            col: &VarColumn<T>,
            offsets: &[i64],
        ) -> Vec<T> {
            offsets
                .iter()
                .map(|&offset| {
                    if offset == INVALID_SEG_OFFSET {
                        T::default()
                    } else {
                        col.value(offset as u64)
                    }
                })
                .collect()
        }

        let data = match self {
            Self::Bool(c) => FieldData::Bool(gather_fixed(c, offsets)),
            Self::Int8(c) => FieldData::Int8(gather_fixed(c, offsets)),
            Self::Int16(c) => FieldData::Int16(gather_fixed(c, offsets)),
            Self::Int32(c) => FieldData::Int32(gather_fixed(c, offsets)),
            Self::Int64(c) => FieldData::Int64(gather_fixed(c, offsets)),
            Self::Float32(c) => FieldData::Float32(gather_fixed(c, offsets)),
            Self::Float64(c) => FieldData::Float64(gather_fixed(c, offsets)),
            Self::Utf8(c) => FieldData::Utf8(gather_var(c, offsets)),
            Self::Json(c) => FieldData::Json(gather_var(c, offsets)),
            Self::Array(c) => FieldData::Array(
                offsets
                    .iter()
                    .map(|&offset| {
                        if offset == INVALID_SEG_OFFSET {
                            ArrayValue::Int64(Vec::new())
                        } else {
                            c.value(offset as u64)
                        }
                    })
                    .collect(),
            ),
            Self::FloatVector(c) => FieldData::FloatVector {
                dim: c.elems_per_row() as u32,
                data: gather_fixed(c, offsets),
            },
            Self::Float16Vector(c) => FieldData::Float16Vector {
                dim: c.elems_per_row() as u32,
                data: gather_fixed(c, offsets),
            },
            Self::BFloat16Vector(c) => FieldData::BFloat16Vector {
                dim: c.elems_per_row() as u32,
                data: gather_fixed(c, offsets),
            },
            Self::BinaryVector(c) => FieldData::BinaryVector {
                dim: c.elems_per_row() as u32 * 8,
                data: gather_fixed(c, offsets),
            },
        };
        Ok(data)
    }
}

fn check_dim(column_epr: usize, payload_epr: usize) -> Result<()> {
    if column_epr != payload_epr {
        return Err(Error::invalid_input(
            format!(
                "payload row width {} does not match column row width {}",
                payload_epr, column_epr
            ),
            location!(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::FieldId;

    #[test]
    fn test_fixed_column_cross_chunk_write() {
        let col = FixedColumn::<i64>::new(1, 2);
        col.write_rows(0, &[10, 11, 12, 13, 14]);
        assert_eq!(col.num_chunk(), 3);
        assert_eq!(col.value(0), 10);
        assert_eq!(col.value(4), 14);
        assert_eq!(col.written_rows(), 5);
    }

    #[test]
    fn test_fixed_column_out_of_order_reservations() {
        let col = FixedColumn::<i32>::new(1, 4);
        col.write_rows(4, &[40, 50]);
        col.write_rows(0, &[0, 10, 20, 30]);
        for i in 0..6u64 {
            assert_eq!(col.value(i), i as i32 * 10);
        }
    }

    #[test]
    fn test_fixed_column_vector_rows() {
        let col = FixedColumn::<f32>::new(3, 2);
        col.write_rows(0, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut row = [0.0f32; 3];
        col.copy_row(1, &mut row);
        assert_eq!(row, [4.0, 5.0, 6.0]);
        col.with_row(0, |r| assert_eq!(r, &[1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_span_survives_clear() {
        let col = FixedColumn::<i64>::new(1, 2);
        col.write_rows(0, &[7, 8]);
        let span = col.span(0, 2).unwrap();
        col.clear();
        assert_eq!(span.as_slice(), &[7, 8]);
        assert_eq!(col.num_chunk(), 0);
    }

    #[test]
    fn test_var_column() {
        let col = VarColumn::<String>::new(2);
        col.write_rows(0, &["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(col.value(2), "c");
        col.with_value(0, |v| assert_eq!(v, "a"));
        assert_eq!(col.num_chunk(), 2);
    }

    #[test]
    fn test_column_append_type_mismatch() {
        let meta = FieldMeta::new(FieldId(100), "x", DataType::Int64);
        let col = Column::new(&meta, 8).unwrap();
        let err = col.append(0, &FieldData::Float32(vec![1.0]));
        assert!(matches!(err.unwrap_err(), Error::DataType { .. }));
    }

    #[test]
    fn test_column_append_dim_mismatch() {
        let meta = FieldMeta::new_vector(FieldId(101), "v", DataType::FloatVector, 4);
        let col = Column::new(&meta, 8).unwrap();
        let err = col.append(
            0,
            &FieldData::FloatVector {
                dim: 2,
                data: vec![0.0, 1.0],
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_bulk_subscript_round_trip() {
        let meta = FieldMeta::new_vector(FieldId(101), "v", DataType::FloatVector, 2);
        let col = Column::new(&meta, 2).unwrap();
        col.append(
            0,
            &FieldData::FloatVector {
                dim: 2,
                data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            },
        )
        .unwrap();
        let out = col.bulk_subscript(&[1, INVALID_SEG_OFFSET, 2]).unwrap();
        assert_eq!(
            out,
            FieldData::FloatVector {
                dim: 2,
                data: vec![3.0, 4.0, 0.0, 0.0, 5.0, 6.0],
            }
        );
    }

    #[test]
    fn test_bulk_subscript_var_types() {
        let meta = FieldMeta::new(FieldId(102), "s", DataType::Utf8);
        let col = Column::new(&meta, 4).unwrap();
        col.append(0, &FieldData::Utf8(vec!["x".into(), "y".into()]))
            .unwrap();
        let out = col.bulk_subscript(&[1, INVALID_SEG_OFFSET]).unwrap();
        assert_eq!(out, FieldData::Utf8(vec!["y".into(), String::new()]));
    }

    #[test]
    fn test_concurrent_writers_disjoint_ranges() {
        use std::sync::Arc;
        let col = Arc::new(FixedColumn::<i64>::new(1, 16));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let col = col.clone();
                std::thread::spawn(move || {
                    let begin = t * 100;
                    let rows: Vec<i64> = (begin..begin + 100).map(|v| v as i64).collect();
                    col.write_rows(begin, &rows);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..800u64 {
            assert_eq!(col.value(i), i as i64);
        }
    }
}
