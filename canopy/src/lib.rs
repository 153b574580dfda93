// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Canopy growing-segment core: a mutable in-memory segment that ingests
//! rows into chunked columns, tracks primary keys, timestamps and
//! deletions, incrementally builds an interim vector index, and serves
//! top-k and range vector queries honoring deletions and a read
//! timestamp.

pub mod column;
pub mod config;
pub mod segment;

pub use canopy_core::{
    data, error, types, DataType, Error, FieldId, FieldMeta, PrimaryKey, Result, Schema,
    SystemField, Timestamp, INVALID_SEG_OFFSET,
};
pub use canopy_index::{Metric, SearchInfo, SearchParams, SearchResult, VectorDataset};

pub use config::SegmentConfig;
pub use segment::{
    FieldLoadInfo, GrowingSegment, LoadDeletedRecordInfo, LoadFieldDataInfo, SystemData,
};
