//! Varbeam - Async resolution pipeline for dashboard template variables
//!
//! This library coordinates template-variable queries against pluggable
//! datasources:
//! - Capability-based strategy dispatch (legacy / standard / custom /
//!   datasource query shapes)
//! - Per-variable preemption and explicit cancellation
//! - Normalization of tabular results into flat text/value options
//! - Regex extraction, de-duplication and sort policies for option lists
//! - A shared templating store reconciling options, tags and selection
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use varbeam::config::Config;
//! use varbeam::datasource::stubs::StubDataSource;
//! use varbeam::runner::{FixedTimeRangeProvider, RunnerDeps, VariableQueryRunner};
//! use varbeam::store::{QueryVariable, TemplatingStore};
//! use varbeam::types::{MetricFindValue, VariableIdentifier};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(TemplatingStore::new());
//! store.begin_transaction("dash-1");
//! store
//!     .add_variable(
//!         "dash-1",
//!         QueryVariable::new("v0", "region")
//!             .with_query("label_values(region)")
//!             .into(),
//!     )
//!     .unwrap();
//!
//! let runner = VariableQueryRunner::new(
//!     RunnerDeps {
//!         store: Arc::clone(&store),
//!         time_range: Arc::new(FixedTimeRangeProvider::default()),
//!     },
//!     Config::default(),
//! );
//!
//! let identifier = VariableIdentifier::query("v0", "dash-1");
//! let datasource = Arc::new(
//!     StubDataSource::new("prom").with_find_values(vec![MetricFindValue::text("us-east-1")]),
//! );
//! runner
//!     .update_options(varbeam::runner::UpdateOptionsRequest::new(
//!         identifier.clone(),
//!         datasource,
//!     ))
//!     .await
//!     .unwrap();
//!
//! let variable = store.query_variable(&identifier).unwrap();
//! assert_eq!(variable.options.len(), 1);
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod datasource;
pub mod error;
pub mod options;
pub mod runner;
pub mod store;
pub mod transform;
pub mod types;

/// Configuration management with TOML support
pub mod config;

/// High-level orchestration invoked by embedding applications
pub mod service;

// Re-export main types
pub use error::{Error, Result};
pub use runner::{
    RunnerDeps, TimeRangeProvider, UpdateOptionsEvent, UpdateOptionsRequest, VariableQueryRunner,
};
pub use service::VariableService;
pub use store::TemplatingStore;
pub use types::{LoadingState, MetricFindValue, VariableIdentifier, VariableOption};
