//! Variable models held by the templating store
//!
//! A [`VariableModel`] is one template variable as stored per dashboard
//! state tree. The runner only processes [`QueryVariable`]s; the other
//! kinds exist so the store can hold a complete dashboard's variables and
//! so kind mismatches are representable (a request racing a variable that
//! changed kind aborts instead of misfiring).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    LoadingState, VariableKind, VariableOption, VariableRefresh, VariableSort, VariableTag,
};

/// A variable whose options come from a datasource query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryVariable {
    /// Variable id, unique within one state tree
    pub id: String,

    /// Name used in interpolation (`$name`)
    pub name: String,

    /// Display label shown instead of the name, when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Position among the dashboard's variables
    #[serde(default)]
    pub index: i64,

    /// Skip writing the selection into the URL
    #[serde(default, rename = "skipUrlSync")]
    pub skip_url_sync: bool,

    /// Uid of the datasource to query, `None` for the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<String>,

    /// The stored variable query, a plain string or a structured object
    #[serde(default)]
    pub query: Value,

    /// Human-readable restatement of the query, shown in editors
    #[serde(default)]
    pub definition: String,

    /// Extraction regex applied during option building, empty for none
    #[serde(default)]
    pub regex: String,

    /// Ordering of built options
    #[serde(default)]
    pub sort: VariableSort,

    /// When options refresh
    #[serde(default)]
    pub refresh: VariableRefresh,

    /// Whether several options may be selected at once
    #[serde(default)]
    pub multi: bool,

    /// Whether the synthetic "all values" option is offered
    #[serde(default, rename = "includeAll")]
    pub include_all: bool,

    /// Custom interpolation value for the "all values" option
    #[serde(default, rename = "allValue", skip_serializing_if = "Option::is_none")]
    pub all_value: Option<String>,

    /// Whether a tags query runs after the options query
    #[serde(default, rename = "useTags")]
    pub use_tags: bool,

    /// The stored tags query
    #[serde(default, rename = "tagsQuery")]
    pub tags_query: String,

    /// Options built by the last successful run
    #[serde(default)]
    pub options: Vec<VariableOption>,

    /// The current selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<VariableOption>,

    /// Tags produced by the last tags query
    #[serde(default)]
    pub tags: Vec<VariableTag>,

    /// Loading state shown by editors
    #[serde(default = "not_started")]
    pub state: LoadingState,

    /// Message of the last failed run, cleared on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn not_started() -> LoadingState {
    LoadingState::NotStarted
}

impl QueryVariable {
    /// Create a query variable with empty query and default policies
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            label: None,
            description: None,
            index: 0,
            skip_url_sync: false,
            datasource: None,
            query: Value::String(String::new()),
            definition: String::new(),
            regex: String::new(),
            sort: VariableSort::Disabled,
            refresh: VariableRefresh::Never,
            multi: false,
            include_all: false,
            all_value: None,
            use_tags: false,
            tags_query: String::new(),
            options: Vec::new(),
            current: None,
            tags: Vec::new(),
            state: LoadingState::NotStarted,
            error: None,
        }
    }

    /// Set the stored query from a plain string
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Value::String(query.into());
        self
    }

    /// Set the datasource uid
    pub fn with_datasource(mut self, uid: impl Into<String>) -> Self {
        self.datasource = Some(uid.into());
        self
    }

    /// Set the extraction regex
    pub fn with_regex(mut self, regex: impl Into<String>) -> Self {
        self.regex = regex.into();
        self
    }

    /// Set the sort policy
    pub fn with_sort(mut self, sort: VariableSort) -> Self {
        self.sort = sort;
        self
    }

    /// Set the refresh policy
    pub fn with_refresh(mut self, refresh: VariableRefresh) -> Self {
        self.refresh = refresh;
        self
    }

    /// Offer the synthetic "all values" option
    pub fn with_include_all(mut self) -> Self {
        self.include_all = true;
        self
    }

    /// Allow multiple selection
    pub fn with_multi(mut self) -> Self {
        self.multi = true;
        self
    }

    /// Enable the tags query
    pub fn with_tags_query(mut self, query: impl Into<String>) -> Self {
        self.use_tags = true;
        self.tags_query = query.into();
        self
    }

    /// Set the current selection
    pub fn with_current(mut self, current: VariableOption) -> Self {
        self.current = Some(current);
        self
    }
}

/// A variable whose options come from a comma-separated list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomVariable {
    /// Variable id
    pub id: String,
    /// Interpolation name
    pub name: String,
    /// The comma-separated option list as typed
    #[serde(default)]
    pub query: String,
    /// Whether several options may be selected at once
    #[serde(default)]
    pub multi: bool,
    /// Whether the synthetic "all values" option is offered
    #[serde(default, rename = "includeAll")]
    pub include_all: bool,
    /// Parsed options
    #[serde(default)]
    pub options: Vec<VariableOption>,
    /// The current selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<VariableOption>,
    /// Loading state shown by editors
    #[serde(default = "not_started")]
    pub state: LoadingState,
    /// Message of the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CustomVariable {
    /// Create a custom variable from its comma-separated query
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        let query = query.into();
        let options = Self::options_from_query(&query);
        Self {
            id: id.into(),
            name: name.into(),
            query,
            multi: false,
            include_all: false,
            options,
            current: None,
            state: LoadingState::NotStarted,
            error: None,
        }
    }

    /// Split a comma-separated query into options
    ///
    /// Entries of the form `text : value` split into independent sides.
    pub fn options_from_query(query: &str) -> Vec<VariableOption> {
        query
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once(" : ") {
                Some((text, value)) => VariableOption::new(text.trim(), value.trim()),
                None => VariableOption::from_text(entry),
            })
            .collect()
    }
}

/// A variable holding a single fixed value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantVariable {
    /// Variable id
    pub id: String,
    /// Interpolation name
    pub name: String,
    /// The fixed value
    #[serde(default)]
    pub value: String,
    /// Loading state shown by editors
    #[serde(default = "not_started")]
    pub state: LoadingState,
    /// Message of the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConstantVariable {
    /// Create a constant variable
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            value: value.into(),
            state: LoadingState::NotStarted,
            error: None,
        }
    }
}

/// A free-form text input variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBoxVariable {
    /// Variable id
    pub id: String,
    /// Interpolation name
    pub name: String,
    /// The typed value
    #[serde(default)]
    pub value: String,
    /// Loading state shown by editors
    #[serde(default = "not_started")]
    pub state: LoadingState,
    /// Message of the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TextBoxVariable {
    /// Create a text box variable
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            value: value.into(),
            state: LoadingState::NotStarted,
            error: None,
        }
    }
}

/// One template variable, of any supported kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VariableModel {
    /// Options come from a datasource query
    Query(QueryVariable),
    /// Options come from a comma-separated list
    Custom(CustomVariable),
    /// A single fixed value
    Constant(ConstantVariable),
    /// Free-form text input
    Textbox(TextBoxVariable),
}

impl VariableModel {
    /// Variable id
    pub fn id(&self) -> &str {
        match self {
            VariableModel::Query(v) => &v.id,
            VariableModel::Custom(v) => &v.id,
            VariableModel::Constant(v) => &v.id,
            VariableModel::Textbox(v) => &v.id,
        }
    }

    /// Interpolation name
    pub fn name(&self) -> &str {
        match self {
            VariableModel::Query(v) => &v.name,
            VariableModel::Custom(v) => &v.name,
            VariableModel::Constant(v) => &v.name,
            VariableModel::Textbox(v) => &v.name,
        }
    }

    /// Kind of this variable
    pub fn kind(&self) -> VariableKind {
        match self {
            VariableModel::Query(_) => VariableKind::Query,
            VariableModel::Custom(_) => VariableKind::Custom,
            VariableModel::Constant(_) => VariableKind::Constant,
            VariableModel::Textbox(_) => VariableKind::Textbox,
        }
    }

    /// Loading state shown by editors
    pub fn state(&self) -> LoadingState {
        match self {
            VariableModel::Query(v) => v.state,
            VariableModel::Custom(v) => v.state,
            VariableModel::Constant(v) => v.state,
            VariableModel::Textbox(v) => v.state,
        }
    }

    /// Write the loading state and failure message together
    pub fn set_state(&mut self, state: LoadingState, error: Option<String>) {
        match self {
            VariableModel::Query(v) => {
                v.state = state;
                v.error = error;
            }
            VariableModel::Custom(v) => {
                v.state = state;
                v.error = error;
            }
            VariableModel::Constant(v) => {
                v.state = state;
                v.error = error;
            }
            VariableModel::Textbox(v) => {
                v.state = state;
                v.error = error;
            }
        }
    }

    /// Borrow as a query variable, if that is the kind
    pub fn as_query(&self) -> Option<&QueryVariable> {
        match self {
            VariableModel::Query(v) => Some(v),
            _ => None,
        }
    }

    /// Mutably borrow as a query variable, if that is the kind
    pub fn as_query_mut(&mut self) -> Option<&mut QueryVariable> {
        match self {
            VariableModel::Query(v) => Some(v),
            _ => None,
        }
    }
}

impl From<QueryVariable> for VariableModel {
    fn from(v: QueryVariable) -> Self {
        VariableModel::Query(v)
    }
}

impl From<CustomVariable> for VariableModel {
    fn from(v: CustomVariable) -> Self {
        VariableModel::Custom(v)
    }
}

impl From<ConstantVariable> for VariableModel {
    fn from(v: ConstantVariable) -> Self {
        VariableModel::Constant(v)
    }
}

impl From<TextBoxVariable> for VariableModel {
    fn from(v: TextBoxVariable) -> Self {
        VariableModel::Textbox(v)
    }
}
