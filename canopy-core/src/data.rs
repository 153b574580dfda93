// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Typed per-field payloads exchanged with the segment.
//!
//! `FieldData` is the single tagged variant over all supported element
//! types; every dispatch over it is an exhaustive match so a newly added
//! type fails to compile until each consumer handles it.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use snafu::location;

use crate::types::{DataType, FieldId, PrimaryKey};
use crate::{Error, Result};

/// One row of an array-typed scalar field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayValue {
    Bool(Vec<bool>),
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
}

impl ArrayValue {
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Int64(v) => v.len() * 8,
            Self::Float64(v) => v.len() * 8,
            Self::Utf8(v) => v.iter().map(|s| s.len()).sum(),
        }
    }
}

/// A column slice for one field, `num_rows` rows long.
///
/// Vector payloads are packed row-major: row `i` occupies
/// `[i * dim, (i + 1) * dim)` of `data` (bits for binary vectors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldData {
    Bool(Vec<bool>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
    Json(Vec<serde_json::Value>),
    Array(Vec<ArrayValue>),
    FloatVector { dim: u32, data: Vec<f32> },
    Float16Vector { dim: u32, data: Vec<f16> },
    BFloat16Vector { dim: u32, data: Vec<bf16> },
    BinaryVector { dim: u32, data: Vec<u8> },
}

impl FieldData {
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
            Self::FloatVector { .. } => DataType::FloatVector,
            Self::Float16Vector { .. } => DataType::Float16Vector,
            Self::BFloat16Vector { .. } => DataType::BFloat16Vector,
            Self::BinaryVector { .. } => DataType::BinaryVector,
        }
    }

    pub fn num_rows(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Int8(v) => v.len(),
            Self::Int16(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Int64(v) => v.len(),
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Utf8(v) => v.len(),
            Self::Json(v) => v.len(),
            Self::Array(v) => v.len(),
            Self::FloatVector { dim, data } => data.len() / (*dim).max(1) as usize,
            Self::Float16Vector { dim, data } => data.len() / (*dim).max(1) as usize,
            Self::BFloat16Vector { dim, data } => data.len() / (*dim).max(1) as usize,
            Self::BinaryVector { dim, data } => data.len() / ((*dim).max(8) as usize / 8),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Payload bytes, for segment memory accounting. Json rows are costed
    /// at their serialized length.
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Int8(v) => v.len(),
            Self::Int16(v) => v.len() * 2,
            Self::Int32(v) => v.len() * 4,
            Self::Int64(v) => v.len() * 8,
            Self::Float32(v) => v.len() * 4,
            Self::Float64(v) => v.len() * 8,
            Self::Utf8(v) => v.iter().map(|s| s.len()).sum(),
            Self::Json(v) => v
                .iter()
                .map(|j| serde_json::to_string(j).map_or(0, |s| s.len()))
                .sum(),
            Self::Array(v) => v.iter().map(|a| a.byte_size()).sum(),
            Self::FloatVector { data, .. } => data.len() * 4,
            Self::Float16Vector { data, .. } => data.len() * 2,
            Self::BFloat16Vector { data, .. } => data.len() * 2,
            Self::BinaryVector { data, .. } => data.len(),
        }
    }

    /// Appends the rows of `other` onto `self`. Both sides must carry the
    /// same data type (and dimension, for vectors).
    pub fn extend(&mut self, other: FieldData) -> Result<()> {
        if self.data_type() != other.data_type() {
            return Err(Error::invalid_input(
                format!(
                    "cannot concatenate {} shard onto {}",
                    other.data_type(),
                    self.data_type()
                ),
                location!(),
            ));
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.extend(b),
            (Self::Int8(a), Self::Int8(b)) => a.extend(b),
            (Self::Int16(a), Self::Int16(b)) => a.extend(b),
            (Self::Int32(a), Self::Int32(b)) => a.extend(b),
            (Self::Int64(a), Self::Int64(b)) => a.extend(b),
            (Self::Float32(a), Self::Float32(b)) => a.extend(b),
            (Self::Float64(a), Self::Float64(b)) => a.extend(b),
            (Self::Utf8(a), Self::Utf8(b)) => a.extend(b),
            (Self::Json(a), Self::Json(b)) => a.extend(b),
            (Self::Array(a), Self::Array(b)) => a.extend(b),
            (
                Self::FloatVector { dim, data },
                Self::FloatVector {
                    dim: od,
                    data: odata,
                },
            ) => {
                check_dim(*dim, od)?;
                data.extend(odata);
            }
            (
                Self::Float16Vector { dim, data },
                Self::Float16Vector {
                    dim: od,
                    data: odata,
                },
            ) => {
                check_dim(*dim, od)?;
                data.extend(odata);
            }
            (
                Self::BFloat16Vector { dim, data },
                Self::BFloat16Vector {
                    dim: od,
                    data: odata,
                },
            ) => {
                check_dim(*dim, od)?;
                data.extend(odata);
            }
            (
                Self::BinaryVector { dim, data },
                Self::BinaryVector {
                    dim: od,
                    data: odata,
                },
            ) => {
                check_dim(*dim, od)?;
                data.extend(odata);
            }
            _ => unreachable!("type equality checked above"),
        }
        Ok(())
    }

    /// Extracts primary keys from an Int64 or Utf8 column.
    pub fn primary_keys(&self) -> Result<Vec<PrimaryKey>> {
        match self {
            Self::Int64(v) => Ok(v.iter().copied().map(PrimaryKey::Int64).collect()),
            Self::Utf8(v) => Ok(v.iter().cloned().map(PrimaryKey::Utf8).collect()),
            other => Err(Error::data_type(
                format!("{} cannot be a primary key column", other.data_type()),
                location!(),
            )),
        }
    }
}

fn check_dim(dim: u32, other: u32) -> Result<()> {
    if dim != other {
        return Err(Error::invalid_input(
            format!("vector shard dim {} does not match {}", other, dim),
            location!(),
        ));
    }
    Ok(())
}

/// A batch of per-field payloads tagged by field id.
///
/// Construction rejects duplicate field ids and row-count mismatches
/// between fields.
#[derive(Debug, Clone)]
pub struct InsertData {
    fields: Vec<(FieldId, FieldData)>,
}

impl InsertData {
    pub fn new(fields: Vec<(FieldId, FieldData)>) -> Result<Self> {
        let mut rows: Option<usize> = None;
        for (i, (id, data)) in fields.iter().enumerate() {
            if fields[..i].iter().any(|(other, _)| other == id) {
                return Err(Error::invalid_input(
                    format!("duplicate field data for field {}", id),
                    location!(),
                ));
            }
            match rows {
                None => rows = Some(data.num_rows()),
                Some(n) if n != data.num_rows() => {
                    return Err(Error::invalid_input(
                        format!(
                            "field {} carries {} rows, expected {}",
                            id,
                            data.num_rows(),
                            n
                        ),
                        location!(),
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(Self { fields })
    }

    pub fn num_rows(&self) -> usize {
        self.fields.first().map_or(0, |(_, d)| d.num_rows())
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldData> {
        self.fields
            .iter()
            .find(|(fid, _)| *fid == id)
            .map(|(_, d)| d)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldId, &FieldData)> {
        self.fields.iter().map(|(id, d)| (*id, d))
    }
}

/// Primary keys as supplied on the wire by delete and id-lookup calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IdArray {
    Int64(Vec<i64>),
    Utf8(Vec<String>),
}

impl IdArray {
    pub fn empty_like(data_type: DataType) -> Result<Self> {
        match data_type {
            DataType::Int64 => Ok(Self::Int64(Vec::new())),
            DataType::Utf8 => Ok(Self::Utf8(Vec::new())),
            other => Err(Error::data_type(
                format!("{} is not a primary key type", other),
                location!(),
            )),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int64(v) => v.len(),
            Self::Utf8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parses the ids into primary keys of the segment's primary type.
    pub fn to_keys(&self, data_type: DataType) -> Result<Vec<PrimaryKey>> {
        match (self, data_type) {
            (Self::Int64(v), DataType::Int64) => {
                Ok(v.iter().copied().map(PrimaryKey::Int64).collect())
            }
            (Self::Utf8(v), DataType::Utf8) => {
                Ok(v.iter().cloned().map(PrimaryKey::Utf8).collect())
            }
            (ids, expected) => Err(Error::data_type(
                format!(
                    "id array of {:?} does not match primary field type {}",
                    ids.data_type(),
                    expected
                ),
                location!(),
            )),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Int64(_) => DataType::Int64,
            Self::Utf8(_) => DataType::Utf8,
        }
    }

    pub fn push(&mut self, key: &PrimaryKey) -> Result<()> {
        match (self, key) {
            (Self::Int64(v), PrimaryKey::Int64(k)) => v.push(*k),
            (Self::Utf8(v), PrimaryKey::Utf8(k)) => v.push(k.clone()),
            (ids, key) => {
                return Err(Error::data_type(
                    format!(
                        "cannot push {} key into {:?} id array",
                        key.data_type(),
                        ids.data_type()
                    ),
                    location!(),
                ));
            }
        }
        Ok(())
    }
}
