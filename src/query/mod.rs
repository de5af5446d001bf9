//! Aggregation over projected result rows.
//!
//! Accumulators work on rows of [`FieldValue`]s in place: `init` turns the
//! first source row into an accumulator row, `update` folds further source
//! rows into it and `finish` converts intermediate state into the final
//! value.

mod aggregation;

pub use aggregation::{DoubleSum, FieldAccumulator, SumAccumulator};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declared type of a projected field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Bool,
    Text,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        self.is_integral() || self.is_floating_point()
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, FieldType::Byte | FieldType::Short | FieldType::Int | FieldType::Long)
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double)
    }
}

/// A cell of a result row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum FieldValue {
    #[default]
    Null,
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Text(String),
    /// Intermediate state of a floating point sum.
    DoubleSum(DoubleSum),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::Byte(v) => Some(v as i64),
            FieldValue::Short(v) => Some(v as i64),
            FieldValue::Int(v) => Some(v as i64),
            FieldValue::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Float(v) => Some(v as f64),
            FieldValue::Double(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }
}

/// Aggregation failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("aggregation {function} cannot be applied to property of type {field_type:?}")]
    UnsupportedType {
        function: &'static str,
        field_type: FieldType,
    },

    #[error("column {pos} holds {found:?}, expected a {expected:?} value")]
    TypeMismatch {
        pos: usize,
        expected: FieldType,
        found: FieldValue,
    },

    #[error("column {pos} is out of range for a row of {len} columns")]
    ColumnOutOfRange { pos: usize, len: usize },
}
