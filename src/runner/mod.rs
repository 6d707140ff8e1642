//! Asynchronous resolution of variable queries
//!
//! The runner is the coordination core of the crate: it accepts
//! [`UpdateOptionsRequest`]s, picks the query strategy the target
//! datasource supports ([`strategies`]), executes it with preemption and
//! cancellation semantics ([`coordinator`]), and publishes progress and
//! terminal [`UpdateOptionsEvent`]s on a shared stream that subscribers
//! filter by variable identity.

pub mod coordinator;
pub mod strategies;

use std::sync::Arc;

use crate::datasource::DataSource;
use crate::error::Error;
use crate::types::{LoadingState, TimeRange, VariableIdentifier};

pub use coordinator::{ResponseReceiver, RunnerDeps, RunnerStatsSnapshot, VariableQueryRunner};
pub use strategies::{QueryRunners, RunRequestArgs, RunnerStrategy};

/// One unit of work submitted to the runner
///
/// Consumed by exactly one run, unless a later request for the same
/// identifier supersedes it first.
#[derive(Clone)]
pub struct UpdateOptionsRequest {
    /// Variable to refresh
    pub identifier: VariableIdentifier,

    /// Datasource to query
    pub datasource: Arc<dyn DataSource>,

    /// Search text typed by the user, for filter-as-you-type lookups
    pub search_filter: Option<String>,
}

impl UpdateOptionsRequest {
    /// Create a request without a search filter
    pub fn new(identifier: VariableIdentifier, datasource: Arc<dyn DataSource>) -> Self {
        Self {
            identifier,
            datasource,
            search_filter: None,
        }
    }

    /// Attach a search filter
    ///
    /// Filtered runs update options but never touch the current selection.
    pub fn with_search_filter(mut self, filter: impl Into<String>) -> Self {
        self.search_filter = Some(filter.into());
        self
    }
}

impl std::fmt::Debug for UpdateOptionsRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateOptionsRequest")
            .field("identifier", &self.identifier)
            .field("datasource", &self.datasource.uid())
            .field("search_filter", &self.search_filter)
            .finish()
    }
}

/// Progress or terminal event of one run, published on the shared stream
///
/// `cancelled` marks a `Loading` event that represents preemption of an
/// earlier run rather than progress. Errors travel behind an `Arc` so the
/// original taxonomy survives broadcast fan-out.
#[derive(Debug, Clone)]
pub struct UpdateOptionsEvent {
    /// Variable the event belongs to
    pub identifier: VariableIdentifier,

    /// Lifecycle state this event reports
    pub state: LoadingState,

    /// Whether this `Loading` event marks preemption of an earlier run
    pub cancelled: bool,

    /// Causing error, set on `Error` events
    pub error: Option<Arc<Error>>,
}

impl UpdateOptionsEvent {
    /// A plain progress event
    pub fn loading(identifier: VariableIdentifier) -> Self {
        Self {
            identifier,
            state: LoadingState::Loading,
            cancelled: false,
            error: None,
        }
    }

    /// The preemption marker for a superseded run
    pub fn cancelled(identifier: VariableIdentifier) -> Self {
        Self {
            identifier,
            state: LoadingState::Loading,
            cancelled: true,
            error: None,
        }
    }

    /// The success terminal event
    pub fn done(identifier: VariableIdentifier) -> Self {
        Self {
            identifier,
            state: LoadingState::Done,
            cancelled: false,
            error: None,
        }
    }

    /// The failure terminal event
    pub fn error(identifier: VariableIdentifier, error: Arc<Error>) -> Self {
        Self {
            identifier,
            state: LoadingState::Error,
            cancelled: false,
            error: Some(error),
        }
    }

    /// Whether this event ends a run
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Supplies the time range attached to variable query requests
///
/// Variables refreshing on time-range changes query the range the provider
/// reports; everything else uses the fixed default range.
pub trait TimeRangeProvider: Send + Sync {
    /// The active dashboard time range
    fn range(&self) -> TimeRange;
}

/// Provider returning a fixed range, the default wiring
#[derive(Debug, Clone, Default)]
pub struct FixedTimeRangeProvider {
    range: Option<TimeRange>,
}

impl FixedTimeRangeProvider {
    /// Provider returning the given range
    pub fn with_range(range: TimeRange) -> Self {
        Self { range: Some(range) }
    }
}

impl TimeRangeProvider for FixedTimeRangeProvider {
    fn range(&self) -> TimeRange {
        self.range.unwrap_or_default()
    }
}
