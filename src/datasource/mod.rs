//! Datasource boundary for variable queries
//!
//! Everything the pipeline knows about a datasource lives behind the
//! [`DataSource`] trait. A datasource declares which variable-query shapes it
//! supports via [`VariableCapabilities`]; the runner picks a strategy from
//! that declaration and only then invokes the matching hook.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────────────┐
//!              │  DataSourceRegistry  │  uid → Arc<dyn DataSource>
//!              └──────────┬───────────┘
//!                         │ get
//!                         ▼
//!              ┌──────────────────────┐
//!              │    dyn DataSource    │
//!              │  capabilities()      │
//!              │  metric_find_query() │  legacy hook
//!              │  to_data_query()     │  standard hook
//!              │  query()             │  general query path
//!              │  variable_query()    │  custom hook
//!              └──────────────────────┘
//! ```
//!
//! Hooks have default bodies that fail with
//! [`DataSourceError::UnsupportedOperation`], so an implementation only
//! overrides what it claims in its capabilities.

pub mod frame;
pub mod stubs;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DataSourceError;
use crate::types::{LoadingState, MetricFindValue, TimeRange, VariableKind};

pub use frame::{DataFrame, Field, FieldType};

// ============================================================================
// Capabilities
// ============================================================================

/// Variable-query shapes a datasource declares support for
///
/// A datasource may claim several shapes at once; the runner resolves
/// overlap with a fixed trial order (legacy, standard, custom, datasource).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VariableCapabilities {
    /// Implements `metric_find_query` directly
    pub legacy: bool,
    /// Converts variable queries into its native query type
    pub standard: bool,
    /// Ships its own variable query path
    pub custom: bool,
    /// Variable queries are plain native queries
    pub datasource: bool,
}

impl VariableCapabilities {
    /// No variable support at all
    pub fn none() -> Self {
        Self::default()
    }

    /// Legacy find-query support
    pub fn legacy() -> Self {
        Self {
            legacy: true,
            ..Self::default()
        }
    }

    /// Standard conversion-based support
    pub fn standard() -> Self {
        Self {
            standard: true,
            ..Self::default()
        }
    }

    /// Custom query-path support
    pub fn custom() -> Self {
        Self {
            custom: true,
            ..Self::default()
        }
    }

    /// Native-query support
    pub fn datasource() -> Self {
        Self {
            datasource: true,
            ..Self::default()
        }
    }

    /// Whether any shape is claimed
    pub fn any(&self) -> bool {
        self.legacy || self.standard || self.custom || self.datasource
    }
}

// ============================================================================
// Query requests
// ============================================================================

/// A single query target inside a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQuery {
    /// Reference id correlating targets with responses
    #[serde(rename = "refId")]
    pub ref_id: String,

    /// Datasource-specific query payload
    pub query: Value,
}

impl DataQuery {
    /// Wrap a raw query payload under a reference id
    pub fn new(ref_id: impl Into<String>, query: Value) -> Self {
        Self {
            ref_id: ref_id.into(),
            query,
        }
    }
}

/// Text/value pair injected into query interpolation scopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedVar {
    /// Display text
    pub text: String,
    /// Interpolation value
    pub value: String,
}

impl ScopedVar {
    /// Create a scoped variable where text and value match
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            text: value.clone(),
            value,
        }
    }
}

/// A query request handed to the general or custom query path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQueryRequest {
    /// Unique request id
    pub request_id: String,

    /// Application tag of the requesting subsystem
    pub app: String,

    /// Query targets, one per variable run
    pub targets: Vec<DataQuery>,

    /// Interpolation scope (variable itself, search filter)
    pub scoped_vars: HashMap<String, ScopedVar>,

    /// Time window the query applies to
    pub range: TimeRange,

    /// When the request was built
    pub start_time: DateTime<Utc>,
}

/// Options handed to the legacy find-query hook
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyQueryOptions {
    /// Time window the query applies to
    pub range: TimeRange,

    /// Search filter typed by the user, when present
    pub search_filter: Option<String>,

    /// Name of the variable being refreshed
    pub variable_name: String,

    /// Kind of the variable being refreshed
    pub variable_kind: VariableKind,
}

// ============================================================================
// Query responses
// ============================================================================

/// Payload of a query response
///
/// The general query path produces frames; the legacy path injects
/// already-normalized find values into the same position. Serialization is
/// untagged so both shapes round-trip the original wire format. Frames are
/// tried first: a frame object never carries `text`/`value` keys, while an
/// all-default find value would otherwise swallow any object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryResultPayload {
    /// Tabular frames from the general query path
    Frames(Vec<DataFrame>),
    /// Pre-normalized find values from the legacy path
    Values(Vec<MetricFindValue>),
}

impl QueryResultPayload {
    /// Whether the payload holds no rows at all
    pub fn is_empty(&self) -> bool {
        match self {
            QueryResultPayload::Frames(frames) => frames.iter().all(|f| f.row_count() == 0),
            QueryResultPayload::Values(values) => values.is_empty(),
        }
    }
}

impl Default for QueryResultPayload {
    fn default() -> Self {
        QueryResultPayload::Frames(Vec::new())
    }
}

/// One element of a strategy's result stream
#[derive(Debug)]
pub struct VariableQueryResponse {
    /// Lifecycle state of the producing run
    pub state: LoadingState,

    /// Result payload, meaningful on `Done`
    pub data: QueryResultPayload,

    /// Failure details, set on `Error`
    pub error: Option<DataSourceError>,
}

impl VariableQueryResponse {
    /// An intermediate loading response
    pub fn loading() -> Self {
        Self {
            state: LoadingState::Loading,
            data: QueryResultPayload::default(),
            error: None,
        }
    }

    /// An intermediate streaming response carrying partial frames
    pub fn streaming(frames: Vec<DataFrame>) -> Self {
        Self {
            state: LoadingState::Streaming,
            data: QueryResultPayload::Frames(frames),
            error: None,
        }
    }

    /// A terminal response carrying frames
    pub fn done_frames(frames: Vec<DataFrame>) -> Self {
        Self {
            state: LoadingState::Done,
            data: QueryResultPayload::Frames(frames),
            error: None,
        }
    }

    /// A terminal response carrying pre-normalized find values
    pub fn done_values(values: Vec<MetricFindValue>) -> Self {
        Self {
            state: LoadingState::Done,
            data: QueryResultPayload::Values(values),
            error: None,
        }
    }

    /// A terminal error response
    pub fn error(error: DataSourceError) -> Self {
        Self {
            state: LoadingState::Error,
            data: QueryResultPayload::default(),
            error: Some(error),
        }
    }
}

/// Stream of responses produced by a query path
pub type ResponseStream = BoxStream<'static, VariableQueryResponse>;

fn unsupported(datasource: &str, operation: &'static str) -> DataSourceError {
    DataSourceError::UnsupportedOperation {
        datasource: datasource.to_string(),
        operation,
    }
}

// ============================================================================
// DataSource trait
// ============================================================================

/// A queryable datasource
///
/// Implementations override the hooks matching their declared
/// [`VariableCapabilities`]; the defaults fail with
/// [`DataSourceError::UnsupportedOperation`] so a mismatch between claim and
/// implementation surfaces as an explicit error instead of silence.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Stable unique id of this datasource instance
    fn uid(&self) -> &str;

    /// Human-readable name, defaults to the uid
    fn name(&self) -> &str {
        self.uid()
    }

    /// Variable-query shapes this datasource supports
    fn capabilities(&self) -> VariableCapabilities;

    /// Legacy hook: resolve a find query directly to values
    async fn metric_find_query(
        &self,
        query: &Value,
        options: &LegacyQueryOptions,
    ) -> Result<Vec<MetricFindValue>, DataSourceError> {
        let _ = (query, options);
        Err(unsupported(self.uid(), "metric_find_query"))
    }

    /// Standard hook: convert a variable query into a native query target
    fn to_data_query(&self, query: &Value) -> Result<DataQuery, DataSourceError> {
        let _ = query;
        Err(unsupported(self.uid(), "to_data_query"))
    }

    /// General query path used by the standard and datasource shapes
    fn query(&self, request: DataQueryRequest) -> ResponseStream {
        let _ = request;
        let response = VariableQueryResponse::error(unsupported(self.uid(), "query"));
        stream::iter(vec![response]).boxed()
    }

    /// Dedicated variable query path used by the custom shape
    fn variable_query(&self, request: DataQueryRequest) -> ResponseStream {
        let _ = request;
        let response = VariableQueryResponse::error(unsupported(self.uid(), "variable_query"));
        stream::iter(vec![response]).boxed()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Concurrent registry of datasource instances, keyed by uid
///
/// Mirrors how dashboards reference datasources: variables store a uid (or
/// nothing, which resolves to the configured default).
pub struct DataSourceRegistry {
    sources: DashMap<String, Arc<dyn DataSource>>,
    default_uid: RwLock<Option<String>>,
}

impl DataSourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sources: DashMap::new(),
            default_uid: RwLock::new(None),
        }
    }

    /// Register a datasource under its uid
    ///
    /// The first registration also becomes the default until
    /// [`set_default`](Self::set_default) picks another one.
    pub fn register(&self, datasource: Arc<dyn DataSource>) {
        let uid = datasource.uid().to_string();
        let mut default_uid = self.default_uid.write();
        if default_uid.is_none() {
            *default_uid = Some(uid.clone());
        }
        drop(default_uid);

        tracing::debug!(datasource = %uid, "registered datasource");
        self.sources.insert(uid, datasource);
    }

    /// Mark a registered datasource as the default
    pub fn set_default(&self, uid: &str) -> Result<(), DataSourceError> {
        if !self.sources.contains_key(uid) {
            return Err(DataSourceError::NotFound(uid.to_string()));
        }
        *self.default_uid.write() = Some(uid.to_string());
        Ok(())
    }

    /// Look up a datasource by uid
    pub fn get(&self, uid: &str) -> Result<Arc<dyn DataSource>, DataSourceError> {
        self.sources
            .get(uid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DataSourceError::NotFound(uid.to_string()))
    }

    /// Look up by optional uid, falling back to the default datasource
    ///
    /// `None` and `""` both mean "the default", matching how variables store
    /// their datasource reference.
    pub fn get_or_default(&self, uid: Option<&str>) -> Result<Arc<dyn DataSource>, DataSourceError> {
        match uid {
            Some(uid) if !uid.is_empty() => self.get(uid),
            _ => {
                let default_uid = self.default_uid.read().clone();
                match default_uid {
                    Some(uid) => self.get(&uid),
                    None => Err(DataSourceError::NotFound("<default>".to_string())),
                }
            }
        }
    }

    /// Number of registered datasources
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl Default for DataSourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
