// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Shared plumbing for the canopy growing-segment engine: error type,
//! schema/field metadata, typed field payloads and commit tracking.

pub mod data;
pub mod error;
pub mod types;
pub mod utils;

pub use error::{Error, Result};
pub use types::{
    DataType, FieldId, FieldMeta, PrimaryKey, RowOffset, Schema, SystemField, Timestamp,
    INVALID_SEG_OFFSET, ROW_ID_FIELD, START_USER_FIELD_ID, TIMESTAMP_FIELD,
};
