//! Tabular result frames returned by datasource queries
//!
//! A [`DataFrame`] is a named collection of equally sized columns
//! ([`Field`]s). Variable queries only ever read string, number and boolean
//! columns; anything else is carried through untouched and ignored by the
//! normalization step.

use serde::{Deserialize, Serialize};

use crate::types::FieldValue;

/// Declared type of a frame column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// UTF-8 text values
    String,
    /// Double-precision numbers
    Number,
    /// Booleans
    Boolean,
    /// Timestamps
    Time,
    /// Anything the pipeline does not interpret
    Other,
}

/// A single named column of a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Field {
    /// Column name, matched case-insensitively during normalization
    pub name: String,

    /// Declared column type
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Cell values, one per row
    pub values: Vec<FieldValue>,
}

impl Field {
    /// Create a column from parts
    pub fn new(name: impl Into<String>, field_type: FieldType, values: Vec<FieldValue>) -> Self {
        Self {
            name: name.into(),
            field_type,
            values,
        }
    }

    /// Create a string column
    pub fn strings<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            FieldType::String,
            values
                .into_iter()
                .map(|s| FieldValue::Str(s.into()))
                .collect(),
        )
    }

    /// Create a number column
    pub fn numbers<I>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        Self::new(
            name,
            FieldType::Number,
            values.into_iter().map(FieldValue::Num).collect(),
        )
    }

    /// Create a boolean column
    pub fn booleans<I>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = bool>,
    {
        Self::new(
            name,
            FieldType::Boolean,
            values.into_iter().map(FieldValue::Bool).collect(),
        )
    }

    /// Cell at the given row, `None` past the end
    pub fn value_at(&self, row: usize) -> Option<&FieldValue> {
        self.values.get(row)
    }

    /// Number of rows in this column
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the column has no rows
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A tabular query result
///
/// Unknown keys are rejected on deserialize: the frame shape is what
/// distinguishes it from a find-value object inside the untagged
/// result payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataFrame {
    /// Optional frame name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Columns, equally sized
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl DataFrame {
    /// Create an empty frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the frame name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append a column
    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Number of rows, taken from the longest column
    pub fn row_count(&self) -> usize {
        self.fields.iter().map(Field::len).max().unwrap_or(0)
    }

    /// Column at the given index
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }
}
