//! Stub datasource implementations
//!
//! These implementations are intended for:
//! - **Unit testing** the runner without real datasource plugins
//! - **Integration testing** full request/response scenarios
//! - **Development and prototyping** against scripted responses
//!
//! [`StubDataSource`] is fully scriptable: capabilities, canned find-query
//! results, a response script for the query paths, and an artificial delay
//! for exercising preemption mid-flight. Every hook records its invocations
//! so tests can assert on what the runner actually sent.
//!
//! # Warning
//!
//! **These stubs are NOT suitable for production use.** They never talk to a
//! real backend and exist purely to drive the pipeline in tests.
//!
//! # Example
//!
//! ```rust
//! use varbeam::datasource::stubs::StubDataSource;
//! use varbeam::datasource::DataSource;
//! use varbeam::types::MetricFindValue;
//!
//! let ds = StubDataSource::new("prom")
//!     .with_find_values(vec![MetricFindValue::text("up")]);
//! assert!(ds.capabilities().legacy);
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::DataSourceError;
use crate::types::MetricFindValue;

use super::frame::DataFrame;
use super::{
    DataQuery, DataQueryRequest, DataSource, LegacyQueryOptions, ResponseStream,
    VariableCapabilities, VariableQueryResponse,
};

/// Ref id the stub's standard conversion stamps on targets
pub const STANDARD_QUERY_REF_ID: &str = "StandardVariableQuery";

/// One scripted element of a query-path response stream
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Intermediate loading element
    Loading,
    /// Intermediate streaming element with partial frames
    Streaming(Vec<DataFrame>),
    /// Terminal element carrying frames
    DoneFrames(Vec<DataFrame>),
    /// Terminal element carrying pre-normalized values
    DoneValues(Vec<MetricFindValue>),
    /// Terminal error element
    Error(String),
}

impl ScriptedResponse {
    fn into_response(self) -> VariableQueryResponse {
        match self {
            ScriptedResponse::Loading => VariableQueryResponse::loading(),
            ScriptedResponse::Streaming(frames) => VariableQueryResponse::streaming(frames),
            ScriptedResponse::DoneFrames(frames) => VariableQueryResponse::done_frames(frames),
            ScriptedResponse::DoneValues(values) => VariableQueryResponse::done_values(values),
            ScriptedResponse::Error(message) => {
                VariableQueryResponse::error(DataSourceError::QueryFailed(message))
            }
        }
    }
}

#[derive(Debug, Clone)]
enum FindOutcome {
    Values(Vec<MetricFindValue>),
    Error(String),
}

/// A fully scriptable in-memory datasource
pub struct StubDataSource {
    uid: String,
    capabilities: VariableCapabilities,
    delay: Option<Duration>,
    find_outcome: FindOutcome,
    script: Vec<ScriptedResponse>,
    find_calls: Mutex<Vec<(Value, LegacyQueryOptions)>>,
    query_calls: Mutex<Vec<DataQueryRequest>>,
    variable_query_calls: Mutex<Vec<DataQueryRequest>>,
}

impl StubDataSource {
    /// Create a legacy-capable stub with no canned results
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            capabilities: VariableCapabilities::legacy(),
            delay: None,
            find_outcome: FindOutcome::Values(Vec::new()),
            script: Vec::new(),
            find_calls: Mutex::new(Vec::new()),
            query_calls: Mutex::new(Vec::new()),
            variable_query_calls: Mutex::new(Vec::new()),
        }
    }

    /// Replace the declared capabilities
    pub fn with_capabilities(mut self, capabilities: VariableCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Canned result for the legacy find hook
    pub fn with_find_values(mut self, values: Vec<MetricFindValue>) -> Self {
        self.find_outcome = FindOutcome::Values(values);
        self
    }

    /// Make the legacy find hook fail with the given message
    pub fn with_find_error(mut self, message: impl Into<String>) -> Self {
        self.find_outcome = FindOutcome::Error(message.into());
        self
    }

    /// Script the query-path response stream element by element
    pub fn with_script(mut self, script: Vec<ScriptedResponse>) -> Self {
        self.script = script;
        self
    }

    /// Shorthand: one terminal element carrying the given frames
    pub fn with_frames(self, frames: Vec<DataFrame>) -> Self {
        self.with_script(vec![ScriptedResponse::DoneFrames(frames)])
    }

    /// Delay each hook and each response element by the given duration
    ///
    /// Gives tests a window to preempt or cancel a run mid-flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Invocations of the legacy find hook, in order
    pub fn find_calls(&self) -> Vec<(Value, LegacyQueryOptions)> {
        self.find_calls.lock().clone()
    }

    /// Requests seen by the general query path, in order
    pub fn query_calls(&self) -> Vec<DataQueryRequest> {
        self.query_calls.lock().clone()
    }

    /// Requests seen by the custom variable query path, in order
    pub fn variable_query_calls(&self) -> Vec<DataQueryRequest> {
        self.variable_query_calls.lock().clone()
    }

    fn scripted_stream(&self) -> ResponseStream {
        let delay = self.delay;
        let responses: Vec<VariableQueryResponse> = self
            .script
            .iter()
            .cloned()
            .map(ScriptedResponse::into_response)
            .collect();

        stream::iter(responses)
            .then(move |response| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                response
            })
            .boxed()
    }
}

#[async_trait]
impl DataSource for StubDataSource {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn capabilities(&self) -> VariableCapabilities {
        self.capabilities
    }

    async fn metric_find_query(
        &self,
        query: &Value,
        options: &LegacyQueryOptions,
    ) -> Result<Vec<MetricFindValue>, DataSourceError> {
        self.find_calls
            .lock()
            .push((query.clone(), options.clone()));

        if !self.capabilities.legacy {
            return Err(DataSourceError::UnsupportedOperation {
                datasource: self.uid.clone(),
                operation: "metric_find_query",
            });
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.find_outcome {
            FindOutcome::Values(values) => Ok(values.clone()),
            FindOutcome::Error(message) => Err(DataSourceError::QueryFailed(message.clone())),
        }
    }

    fn to_data_query(&self, query: &Value) -> Result<DataQuery, DataSourceError> {
        if !self.capabilities.standard {
            return Err(DataSourceError::UnsupportedOperation {
                datasource: self.uid.clone(),
                operation: "to_data_query",
            });
        }
        Ok(DataQuery::new(STANDARD_QUERY_REF_ID, query.clone()))
    }

    fn query(&self, request: DataQueryRequest) -> ResponseStream {
        self.query_calls.lock().push(request);
        self.scripted_stream()
    }

    fn variable_query(&self, request: DataQueryRequest) -> ResponseStream {
        self.variable_query_calls.lock().push(request);
        self.scripted_stream()
    }
}
