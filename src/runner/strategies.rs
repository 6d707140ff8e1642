//! Query-runner strategies, one per datasource integration shape
//!
//! Datasources integrate variable queries in one of four ways: a dedicated
//! legacy find hook, conversion of the stored query into their native query
//! type, a custom variable query path, or plain native queries. Each shape
//! is a [`RunnerStrategy`]; [`QueryRunners`] scans them in a fixed priority
//! order and the first whose capability predicate matches wins. The order
//! is load-bearing when a datasource claims several shapes at once.

use futures::stream::{self, StreamExt};
use std::sync::Arc;

use crate::datasource::{
    DataQuery, DataQueryRequest, DataSource, LegacyQueryOptions, ResponseStream,
    VariableQueryResponse,
};
use crate::error::{DataSourceError, Result, RunnerError};
use crate::store::QueryVariable;

/// Ref id stamped on variable query targets
pub const VARIABLE_QUERY_REF_ID: &str = "VariableQuery";

/// One datasource integration shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStrategy {
    /// Dedicated `metric_find_query` hook
    Legacy,
    /// Stored query converted into the datasource's native query type
    Standard,
    /// Dedicated variable query path
    Custom,
    /// Variable queries are plain native queries
    Datasource,
}

/// Everything a strategy needs to execute one run
pub struct RunRequestArgs {
    /// Datasource to query
    pub datasource: Arc<dyn DataSource>,

    /// The raw stored variable query
    pub query: serde_json::Value,

    /// Request for the general and custom query paths
    pub request: DataQueryRequest,

    /// Options for the legacy find hook
    pub legacy_options: LegacyQueryOptions,
}

impl RunnerStrategy {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            RunnerStrategy::Legacy => "legacy",
            RunnerStrategy::Standard => "standard",
            RunnerStrategy::Custom => "custom",
            RunnerStrategy::Datasource => "datasource",
        }
    }

    /// Whether this strategy can serve the given datasource
    pub fn can_run(&self, datasource: &dyn DataSource) -> bool {
        let capabilities = datasource.capabilities();
        match self {
            RunnerStrategy::Legacy => capabilities.legacy,
            RunnerStrategy::Standard => capabilities.standard,
            RunnerStrategy::Custom => capabilities.custom,
            RunnerStrategy::Datasource => capabilities.datasource,
        }
    }

    /// Build the query target a request will carry
    ///
    /// Errors when the datasource does not actually provide the claimed
    /// capability; after correct selection that indicates a datasource
    /// whose claim and implementation disagree.
    pub fn target(
        &self,
        datasource: &dyn DataSource,
        variable: &QueryVariable,
    ) -> Result<DataQuery> {
        if !self.can_run(datasource) {
            return Err(DataSourceError::UnsupportedOperation {
                datasource: datasource.uid().to_string(),
                operation: self.name(),
            }
            .into());
        }

        match self {
            RunnerStrategy::Standard => Ok(datasource.to_data_query(&variable.query)?),
            RunnerStrategy::Legacy | RunnerStrategy::Custom | RunnerStrategy::Datasource => {
                Ok(DataQuery::new(VARIABLE_QUERY_REF_ID, variable.query.clone()))
            }
        }
    }

    /// Execute the query and return the response stream
    ///
    /// The legacy shape resolves its find hook once: a non-empty result is
    /// one `Done` response carrying values, an empty result is one `Done`
    /// response carrying no frames. Empty is not an error.
    pub fn run(&self, args: RunRequestArgs) -> ResponseStream {
        match self {
            RunnerStrategy::Legacy => {
                let RunRequestArgs {
                    datasource,
                    query,
                    legacy_options,
                    ..
                } = args;
                stream::once(async move {
                    match datasource.metric_find_query(&query, &legacy_options).await {
                        Ok(values) if values.is_empty() => {
                            VariableQueryResponse::done_frames(Vec::new())
                        }
                        Ok(values) => VariableQueryResponse::done_values(values),
                        Err(error) => VariableQueryResponse::error(error),
                    }
                })
                .boxed()
            }
            RunnerStrategy::Standard | RunnerStrategy::Datasource => {
                args.datasource.query(args.request)
            }
            RunnerStrategy::Custom => args.datasource.variable_query(args.request),
        }
    }
}

/// The strategy table, scanned in fixed priority order
///
/// Legacy wins over standard, standard over custom, custom over the plain
/// datasource shape. A datasource claiming no shape at all fails selection
/// with [`RunnerError::NoRunnerFound`] before any stream is constructed.
pub struct QueryRunners {
    strategies: Vec<RunnerStrategy>,
}

impl QueryRunners {
    /// The default table with all four strategies
    pub fn new() -> Self {
        Self {
            strategies: vec![
                RunnerStrategy::Legacy,
                RunnerStrategy::Standard,
                RunnerStrategy::Custom,
                RunnerStrategy::Datasource,
            ],
        }
    }

    /// First strategy whose predicate matches the datasource
    pub fn runner_for(&self, datasource: &dyn DataSource) -> Result<RunnerStrategy> {
        self.strategies
            .iter()
            .copied()
            .find(|strategy| strategy.can_run(datasource))
            .ok_or_else(|| RunnerError::NoRunnerFound.into())
    }
}

impl Default for QueryRunners {
    fn default() -> Self {
        Self::new()
    }
}
