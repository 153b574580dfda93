// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Scalar identifiers and schema metadata shared across the workspace.

use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::location;

use crate::{Error, Result};

/// Opaque monotonic version supplied by the caller on inserts and deletes.
pub type Timestamp = u64;

/// Dense, monotonically assigned row index within a segment. Never reused.
pub type RowOffset = u64;

/// Sentinel used in subscript offset lists; such slots yield zeroed output.
pub const INVALID_SEG_OFFSET: i64 = -1;

/// Field identifiers below this value denote system fields.
pub const START_USER_FIELD_ID: i32 = 100;

/// The row-id system column.
pub const ROW_ID_FIELD: FieldId = FieldId(0);
/// The timestamp system column.
pub const TIMESTAMP_FIELD: FieldId = FieldId(1);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FieldId(pub i32);

impl FieldId {
    pub fn is_system(&self) -> bool {
        self.0 < START_USER_FIELD_ID
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// System columns addressable through bulk subscript alongside user fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemField {
    RowId,
    Timestamp,
}

/// The value of the single primary field of a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimaryKey {
    Int64(i64),
    Utf8(String),
}

impl PrimaryKey {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Int64(_) => DataType::Int64,
            Self::Utf8(_) => DataType::Utf8,
        }
    }

    /// Heap bytes held by the key, for memory accounting.
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Int64(_) => std::mem::size_of::<i64>(),
            Self::Utf8(s) => s.len(),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64(v) => write!(f, "{}", v),
            Self::Utf8(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Utf8,
    Json,
    Array,
    FloatVector,
    Float16Vector,
    BFloat16Vector,
    BinaryVector,
}

impl DataType {
    pub fn is_vector(&self) -> bool {
        matches!(
            self,
            Self::FloatVector | Self::Float16Vector | Self::BFloat16Vector | Self::BinaryVector
        )
    }

    /// Variable-length types have no fixed per-row byte width.
    pub fn is_variable(&self) -> bool {
        matches!(self, Self::Utf8 | Self::Json | Self::Array)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Per-field metadata: identity, type and (for vectors) dimensionality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMeta {
    pub id: FieldId,
    pub name: String,
    pub data_type: DataType,
    pub dim: Option<u32>,
}

impl FieldMeta {
    pub fn new(id: FieldId, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
            dim: None,
        }
    }

    pub fn new_vector(
        id: FieldId,
        name: impl Into<String>,
        data_type: DataType,
        dim: u32,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
            dim: Some(dim),
        }
    }

    pub fn is_vector(&self) -> bool {
        self.data_type.is_vector()
    }

    pub fn is_variable(&self) -> bool {
        self.data_type.is_variable()
    }

    pub fn dim(&self) -> Result<u32> {
        self.dim.ok_or_else(|| {
            Error::invalid_input(
                format!("field {} has no dimension", self.id),
                location!(),
            )
        })
    }

    /// Per-row byte width; `None` for variable-length types.
    pub fn fixed_width(&self) -> Option<usize> {
        let dim = self.dim.unwrap_or(1) as usize;
        match self.data_type {
            DataType::Bool | DataType::Int8 => Some(1),
            DataType::Int16 => Some(2),
            DataType::Int32 | DataType::Float32 => Some(4),
            DataType::Int64 | DataType::Float64 => Some(8),
            DataType::Utf8 | DataType::Json | DataType::Array => None,
            DataType::FloatVector => Some(dim * 4),
            DataType::Float16Vector | DataType::BFloat16Vector => Some(dim * 2),
            DataType::BinaryVector => Some(dim / 8),
        }
    }
}

/// An ordered field table plus the designated primary field.
///
/// System columns (row id, timestamp) are not part of the schema; they are
/// always present on a segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldMeta>,
    primary_field: FieldId,
}

impl Schema {
    pub fn new(fields: Vec<FieldMeta>, primary_field: FieldId) -> Result<Self> {
        for (i, field) in fields.iter().enumerate() {
            if field.id.is_system() {
                return Err(Error::invalid_input(
                    format!("user field id {} collides with the system range", field.id),
                    location!(),
                ));
            }
            if fields[..i].iter().any(|f| f.id == field.id) {
                return Err(Error::invalid_input(
                    format!("duplicate field id {}", field.id),
                    location!(),
                ));
            }
            if field.is_vector() && field.dim.is_none() {
                return Err(Error::invalid_input(
                    format!("vector field {} is missing a dimension", field.id),
                    location!(),
                ));
            }
        }
        let schema = Self {
            fields,
            primary_field,
        };
        let pk = schema.field(primary_field)?;
        if !matches!(pk.data_type, DataType::Int64 | DataType::Utf8) {
            return Err(Error::invalid_input(
                format!("primary field must be Int64 or Utf8, got {}", pk.data_type),
                location!(),
            ));
        }
        Ok(schema)
    }

    pub fn field(&self, id: FieldId) -> Result<&FieldMeta> {
        self.fields.iter().find(|f| f.id == id).ok_or_else(|| {
            Error::invalid_input(format!("unknown field id {}", id), location!())
        })
    }

    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn primary_field_id(&self) -> FieldId {
        self.primary_field
    }

    pub fn primary_field(&self) -> &FieldMeta {
        // Validated at construction.
        self.fields
            .iter()
            .find(|f| f.id == self.primary_field)
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_field_schema() -> Schema {
        Schema::new(
            vec![
                FieldMeta::new(FieldId(100), "id", DataType::Int64),
                FieldMeta::new_vector(FieldId(101), "vec", DataType::FloatVector, 4),
            ],
            FieldId(100),
        )
        .unwrap()
    }

    #[test]
    fn test_schema_lookup() {
        let schema = two_field_schema();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.primary_field().name, "id");
        assert_eq!(schema.field(FieldId(101)).unwrap().dim, Some(4));
        assert!(schema.field(FieldId(7)).is_err());
    }

    #[test]
    fn test_schema_rejects_duplicate_ids() {
        let result = Schema::new(
            vec![
                FieldMeta::new(FieldId(100), "a", DataType::Int64),
                FieldMeta::new(FieldId(100), "b", DataType::Int32),
            ],
            FieldId(100),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_schema_rejects_system_range() {
        let result = Schema::new(
            vec![FieldMeta::new(FieldId(1), "ts", DataType::Int64)],
            FieldId(1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_schema_rejects_bad_primary_type() {
        let result = Schema::new(
            vec![FieldMeta::new(FieldId(100), "f", DataType::Float32)],
            FieldId(100),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_fixed_width() {
        let vec = FieldMeta::new_vector(FieldId(101), "v", DataType::FloatVector, 8);
        assert_eq!(vec.fixed_width(), Some(32));
        let bin = FieldMeta::new_vector(FieldId(102), "b", DataType::BinaryVector, 16);
        assert_eq!(bin.fixed_width(), Some(2));
        let s = FieldMeta::new(FieldId(103), "s", DataType::Utf8);
        assert_eq!(s.fixed_width(), None);
    }
}
