//! Orchestration layer invoked by embedding applications
//!
//! [`VariableService`] wires the store, the datasource registry and the
//! runner together: it wraps each refresh in the variable's loading-state
//! transitions, resolves the datasource reference, and awaits the runner's
//! terminal event. Editor flows (changing a variable's query) validate the
//! new query before writing it and refreshing.

use std::sync::Arc;

use regex::Regex;
use serde_json::{Map, Value};

use crate::datasource::DataSourceRegistry;
use crate::error::{Error, Result, StoreError};
use crate::runner::{UpdateOptionsRequest, VariableQueryRunner};
use crate::store::TemplatingStore;
use crate::types::VariableIdentifier;

/// High-level variable operations
pub struct VariableService {
    store: Arc<TemplatingStore>,
    registry: Arc<DataSourceRegistry>,
    runner: Arc<VariableQueryRunner>,
}

impl VariableService {
    /// Wire a service from its collaborators
    pub fn new(
        store: Arc<TemplatingStore>,
        registry: Arc<DataSourceRegistry>,
        runner: Arc<VariableQueryRunner>,
    ) -> Self {
        Self {
            store,
            registry,
            runner,
        }
    }

    /// Refresh a query variable's options, with loading-state transitions
    ///
    /// Marks the variable fetching, resolves its datasource, runs the
    /// refresh to completion and marks the variable completed. On failure
    /// the variable carries the error message and the error is returned
    /// with the original message intact.
    pub async fn update_options(&self, identifier: &VariableIdentifier) -> Result<()> {
        self.store.variable_state_fetching(identifier)?;

        match self.refresh(identifier, None).await {
            Ok(()) => {
                self.store.variable_state_completed(identifier)?;
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                tracing::error!(variable = %identifier, "Error updating options: {message}");
                self.store.variable_state_failed(identifier, &message)?;
                Err(error)
            }
        }
    }

    /// Refresh options for a filter-as-you-type lookup
    ///
    /// Passes the search filter through to the runner; the selection is
    /// left untouched and no loading-state transitions are written.
    pub async fn update_query_variable_options(
        &self,
        identifier: &VariableIdentifier,
        search_filter: Option<&str>,
    ) -> Result<()> {
        self.refresh(identifier, search_filter).await
    }

    /// Change a query variable's query and refresh its options
    ///
    /// Rejects queries referencing the variable they feed before anything
    /// is written.
    pub async fn change_query_variable_query(
        &self,
        identifier: &VariableIdentifier,
        query: Value,
        definition: impl Into<String>,
    ) -> Result<()> {
        let variable = self.store.query_variable(identifier)?;
        if has_self_referencing_query(&variable.name, &query) {
            return Err(StoreError::SelfReferencingQuery(variable.name).into());
        }

        self.store
            .set_query_variable_query(identifier, query, definition)?;
        self.update_options(identifier).await
    }

    async fn refresh(
        &self,
        identifier: &VariableIdentifier,
        search_filter: Option<&str>,
    ) -> Result<()> {
        let variable = self.store.query_variable(identifier)?;
        let datasource = self.registry.get_or_default(variable.datasource.as_deref())?;

        let mut request = UpdateOptionsRequest::new(identifier.clone(), datasource);
        if let Some(filter) = search_filter {
            request = request.with_search_filter(filter);
        }

        self.runner
            .update_options(request)
            .await
            .map_err(|error| Error::General(error.to_string()))
    }
}

/// Flatten a structured query into dot-free scalar entries
///
/// Nested object keys join with `_`; array elements contribute their index
/// as a key segment. A scalar query flattens to a single `query` entry, so
/// plain string queries and structured ones inspect uniformly.
pub fn flatten_query(query: &Value) -> Map<String, Value> {
    let mut flattened = Map::new();
    match query {
        Value::Object(_) | Value::Array(_) => flatten_into(query, None, &mut flattened),
        scalar => {
            flattened.insert("query".to_string(), scalar.clone());
        }
    }
    flattened
}

fn flatten_into(value: &Value, prefix: Option<&str>, out: &mut Map<String, Value>) {
    let joined = |key: &str| match prefix {
        Some(prefix) => format!("{}_{}", prefix, key),
        None => key.to_string(),
    };

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(child, Some(&joined(key)), out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(child, Some(&joined(&index.to_string())), out);
            }
        }
        scalar => {
            if let Some(prefix) = prefix {
                out.insert(prefix.to_string(), scalar.clone());
            }
        }
    }
}

/// Whether a query references the named variable anywhere in its strings
///
/// Recognizes the three interpolation forms: `$name`, `${name}` (with
/// optional format suffix) and `[[name]]`.
pub fn has_self_referencing_query(name: &str, query: &Value) -> bool {
    let flattened = flatten_query(query);
    flattened
        .values()
        .filter_map(Value::as_str)
        .any(|text| contains_variable_reference(text, name))
}

fn contains_variable_reference(text: &str, name: &str) -> bool {
    let name = regex::escape(name);
    let pattern = format!(
        r"\$({name})\b|\$\{{({name})(?::[^}}]*)?\}}|\[\[({name})(?::\w+)?\]\]",
        name = name
    );

    // The pattern is built from an escaped name; compilation cannot fail
    // for any name the store accepts.
    Regex::new(&pattern)
        .map(|regex| regex.is_match(text))
        .unwrap_or(false)
}
