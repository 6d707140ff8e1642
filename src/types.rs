//! Core data types used throughout the variable resolution pipeline
//!
//! This module defines the fundamental data structures shared across the system:
//!
//! # Key Types
//!
//! - **`VariableIdentifier`**: Unique identity of a variable (id + kind + state key)
//! - **`LoadingState`**: Lifecycle state of a query run (Loading, Done, Error, ...)
//! - **`MetricFindValue`**: A single normalized query result (text/value pair)
//! - **`VariableOption`**: A selectable option as stored on a variable
//! - **`FieldValue`**: Scalar cell value inside tabular query results
//! - **`TimeRange`**: Time window attached to variable query requests
//!
//! # Example
//!
//! ```rust
//! use varbeam::types::{VariableIdentifier, VariableKind, MetricFindValue};
//!
//! let identifier = VariableIdentifier::new("region", VariableKind::Query, "dash-1");
//! assert_eq!(identifier.to_string(), "dash-1/region");
//!
//! let value = MetricFindValue::text("us-east-1");
//! assert_eq!(value.text_string(), "us-east-1");
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Sentinels
// ============================================================================

/// Display text of the synthetic "all values" option.
pub const ALL_VARIABLE_TEXT: &str = "All";

/// Stored value of the synthetic "all values" option.
pub const ALL_VARIABLE_VALUE: &str = "$__all";

/// Display text of the placeholder option used when a query yields nothing.
pub const NONE_VARIABLE_TEXT: &str = "None";

/// Stored value of the placeholder option used when a query yields nothing.
pub const NONE_VARIABLE_VALUE: &str = "";

// ============================================================================
// Variable identity
// ============================================================================

/// The kind of a template variable
///
/// Only [`VariableKind::Query`] variables are processed by the query runner;
/// requests for any other kind are dropped silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    /// Options come from a datasource query
    Query,
    /// Options come from a user-supplied comma-separated list
    Custom,
    /// A single fixed value
    Constant,
    /// Free-form text input
    Textbox,
    /// Options enumerate configured datasources
    Datasource,
    /// Options are interval strings (1m, 5m, ...)
    Interval,
    /// Ad hoc key/value filters
    Adhoc,
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VariableKind::Query => "query",
            VariableKind::Custom => "custom",
            VariableKind::Constant => "constant",
            VariableKind::Textbox => "textbox",
            VariableKind::Datasource => "datasource",
            VariableKind::Interval => "interval",
            VariableKind::Adhoc => "adhoc",
        };
        write!(f, "{}", name)
    }
}

/// Unique identity of a template variable
///
/// Combines the variable id with its kind and the key of the state tree it
/// lives under (a dashboard may be opened several times; each instance keys
/// its own templating state). The full triple is the unit of preemption:
/// queueing a request for an identifier cancels any in-flight run for the
/// same identifier.
///
/// # Example
///
/// ```rust
/// use varbeam::types::{VariableIdentifier, VariableKind};
///
/// let a = VariableIdentifier::new("region", VariableKind::Query, "dash-1");
/// let b = VariableIdentifier::new("region", VariableKind::Query, "dash-2");
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableIdentifier {
    /// Variable id, unique within one state tree
    pub id: String,
    /// Kind of the variable
    pub kind: VariableKind,
    /// Key of the state tree the variable belongs to
    pub root_state_key: String,
}

impl VariableIdentifier {
    /// Create a new identifier
    pub fn new(
        id: impl Into<String>,
        kind: VariableKind,
        root_state_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            root_state_key: root_state_key.into(),
        }
    }

    /// Shorthand for a query-kind identifier, the common case in tests
    pub fn query(id: impl Into<String>, root_state_key: impl Into<String>) -> Self {
        Self::new(id, VariableKind::Query, root_state_key)
    }
}

impl fmt::Display for VariableIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.root_state_key, self.id)
    }
}

// ============================================================================
// Loading state
// ============================================================================

/// Lifecycle state of a query run
///
/// Datasource result streams may pass through `NotStarted`/`Streaming`;
/// the runner itself only ever publishes `Loading`, `Done` and `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadingState {
    /// Nothing has happened yet
    NotStarted,
    /// The run was accepted and is executing
    Loading,
    /// Partial results are arriving (ignored by the terminal-frame filter)
    Streaming,
    /// The run finished successfully
    Done,
    /// The run finished with an error
    Error,
}

impl LoadingState {
    /// Whether this state ends a run
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadingState::Done | LoadingState::Error)
    }
}

// ============================================================================
// Scalar field values
// ============================================================================

/// A scalar cell inside tabular query results
///
/// Datasources return loosely typed values; text and numbers both occur in
/// option positions and are coerced to strings late, during option building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// UTF-8 text
    Str(String),
    /// Double-precision number
    Num(f64),
    /// Boolean
    Bool(bool),
    /// Missing/null cell
    Null,
}

impl FieldValue {
    /// Borrow the string contents, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Coerce to the display string used by option building
    ///
    /// Numbers render without a trailing `.0` so `5.0` becomes `"5"`,
    /// matching how they were written in the source system.
    pub fn coerce_string(&self) -> String {
        match self {
            FieldValue::Str(s) => s.clone(),
            FieldValue::Num(n) => format_number(*n),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Null => String::new(),
        }
    }

    /// Interpret as a boolean flag, accepting numeric truthiness
    ///
    /// Used for `expandable` columns where datasources emit booleans or 0/1.
    pub fn as_bool_like(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            FieldValue::Num(n) => Some(*n != 0.0),
            _ => None,
        }
    }

    /// Whether this cell is null
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Num(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

// ============================================================================
// Metric find values
// ============================================================================

/// A single normalized query result
///
/// The flat shape every strategy's results are reduced to before option
/// building. Either side may be absent on the wire; the missing side mirrors
/// the other during option building.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricFindValue {
    /// Display text
    #[serde(default, alias = "Text", skip_serializing_if = "Option::is_none")]
    pub text: Option<FieldValue>,

    /// Stored value
    #[serde(default, alias = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<FieldValue>,

    /// Whether the entry can be drilled into (tree-style datasources)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expandable: Option<bool>,
}

impl MetricFindValue {
    /// Create a find value carrying only text
    pub fn text(text: impl Into<FieldValue>) -> Self {
        Self {
            text: Some(text.into()),
            value: None,
            expandable: None,
        }
    }

    /// Create a find value carrying text and value
    pub fn pair(text: impl Into<FieldValue>, value: impl Into<FieldValue>) -> Self {
        Self {
            text: Some(text.into()),
            value: Some(value.into()),
            expandable: None,
        }
    }

    /// Set the expandable flag
    pub fn expandable(mut self, expandable: bool) -> Self {
        self.expandable = Some(expandable);
        self
    }

    /// Display text with the mirroring rule applied
    ///
    /// Null counts as absent: falls back to the value side, then to `""`.
    pub fn text_string(&self) -> String {
        present(&self.text)
            .or_else(|| present(&self.value))
            .map(FieldValue::coerce_string)
            .unwrap_or_default()
    }

    /// Stored value with the mirroring rule applied
    pub fn value_string(&self) -> String {
        present(&self.value)
            .or_else(|| present(&self.text))
            .map(FieldValue::coerce_string)
            .unwrap_or_default()
    }
}

fn present(value: &Option<FieldValue>) -> Option<&FieldValue> {
    value.as_ref().filter(|v| !v.is_null())
}

// ============================================================================
// Variable options
// ============================================================================

/// Text or value side of an option
///
/// Single-select variables store plain strings; multi-select variables store
/// the selected subsets as lists. Serialized untagged so both shapes
/// round-trip the original wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// One value
    Single(String),
    /// Several values (multi-select current)
    Multi(Vec<String>),
}

impl OptionValue {
    /// Borrow the single value, if not a list
    pub fn as_single(&self) -> Option<&str> {
        match self {
            OptionValue::Single(s) => Some(s.as_str()),
            OptionValue::Multi(_) => None,
        }
    }

    /// All values in order, regardless of shape
    pub fn values(&self) -> Vec<&str> {
        match self {
            OptionValue::Single(s) => vec![s.as_str()],
            OptionValue::Multi(list) => list.iter().map(String::as_str).collect(),
        }
    }

    /// Whether the given value occurs on this side
    pub fn contains(&self, value: &str) -> bool {
        match self {
            OptionValue::Single(s) => s == value,
            OptionValue::Multi(list) => list.iter().any(|v| v == value),
        }
    }

    /// Whether this is an empty list or empty string
    pub fn is_empty(&self) -> bool {
        match self {
            OptionValue::Single(s) => s.is_empty(),
            OptionValue::Multi(list) => list.is_empty(),
        }
    }
}

impl Default for OptionValue {
    fn default() -> Self {
        OptionValue::Single(String::new())
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Single(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Single(s)
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(list: Vec<String>) -> Self {
        OptionValue::Multi(list)
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Single(s) => write!(f, "{}", s),
            OptionValue::Multi(list) => write!(f, "{}", list.join(" + ")),
        }
    }
}

/// A selectable option as stored on a variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableOption {
    /// Display text
    pub text: OptionValue,
    /// Stored value
    pub value: OptionValue,
    /// Whether the option is part of the current selection
    #[serde(default)]
    pub selected: bool,
    /// Marks the placeholder option injected when a query yields nothing
    #[serde(default, rename = "isNone", skip_serializing_if = "std::ops::Not::not")]
    pub is_none: bool,
}

impl VariableOption {
    /// Create an unselected option
    pub fn new(text: impl Into<OptionValue>, value: impl Into<OptionValue>) -> Self {
        Self {
            text: text.into(),
            value: value.into(),
            selected: false,
            is_none: false,
        }
    }

    /// Create an option where text and value are the same string
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(text.clone(), text)
    }

    /// The synthetic "all values" option
    pub fn all() -> Self {
        Self::new(ALL_VARIABLE_TEXT, ALL_VARIABLE_VALUE)
    }

    /// The placeholder option used when a query yields nothing
    pub fn none() -> Self {
        Self {
            text: NONE_VARIABLE_TEXT.into(),
            value: NONE_VARIABLE_VALUE.into(),
            selected: false,
            is_none: true,
        }
    }

    /// Mark the option selected
    pub fn selected(mut self) -> Self {
        self.selected = true;
        self
    }
}

/// A tag attached to a variable, produced by a tags query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableTag {
    /// Tag display text
    pub text: String,
    /// Whether the tag is active
    #[serde(default)]
    pub selected: bool,
    /// Values the tag expands to, when resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

impl VariableTag {
    /// Create an unselected tag
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            selected: false,
            values: None,
        }
    }
}

// ============================================================================
// Refresh and sort policies
// ============================================================================

/// When a query variable refreshes its options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableRefresh {
    /// Only when edited
    #[default]
    Never,
    /// On every dashboard load
    OnDashboardLoad,
    /// Whenever the dashboard time range changes
    OnTimeRangeChanged,
}

/// How built options are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableSort {
    /// Keep datasource order
    #[default]
    Disabled,
    /// Alphabetical by text, ascending
    AlphabeticalAsc,
    /// Alphabetical by text, descending
    AlphabeticalDesc,
    /// By the first digit run in the text, ascending
    NumericalAsc,
    /// By the first digit run in the text, descending
    NumericalDesc,
    /// Case-insensitive alphabetical, ascending
    AlphabeticalCaseInsensitiveAsc,
    /// Case-insensitive alphabetical, descending
    AlphabeticalCaseInsensitiveDesc,
}

// ============================================================================
// Time range
// ============================================================================

/// Time window attached to variable query requests
///
/// Variables refreshing on time-range changes query with the dashboard's
/// current range; everything else uses [`TimeRange::default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start
    pub from: DateTime<Utc>,
    /// Inclusive end
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// Create a time range, validating that `from` is not after `to`
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, InvalidTimeRange> {
        if from > to {
            return Err(InvalidTimeRange { from, to });
        }
        Ok(Self { from, to })
    }

    /// Duration covered by the range
    pub fn span(&self) -> Duration {
        self.to - self.from
    }
}

impl Default for TimeRange {
    /// The last six hours, the fixed fallback range
    fn default() -> Self {
        let to = Utc::now();
        Self {
            from: to - Duration::hours(6),
            to,
        }
    }
}

/// Error returned when a time range is constructed backwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTimeRange {
    /// Requested start
    pub from: DateTime<Utc>,
    /// Requested end
    pub to: DateTime<Utc>,
}

impl fmt::Display for InvalidTimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid time range: from {} is after to {}",
            self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTimeRange {}

// ============================================================================
// Tests
// ============================================================================
