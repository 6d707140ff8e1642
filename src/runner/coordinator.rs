//! The variable query coordinator
//!
//! [`VariableQueryRunner`] multiplexes every variable's "update options"
//! request over a single command channel. A dispatcher task owns the
//! in-flight table; each accepted request runs as its own spawned task
//! racing the nine-step pipeline against a per-run cancel signal. Results
//! are published on one broadcast stream that subscribers filter by
//! variable identity, so arbitrarily many unrelated variables resolve
//! concurrently while each individual identifier has at most one active
//! run.
//!
//! # Architecture
//!
//! ```text
//! queue_request ──┐
//! cancel_request ─┤  commands (mpsc)
//!                 ▼
//!          ┌─────────────┐   spawn    ┌───────────────┐
//!          │  dispatcher │──────────▶│ run task (one  │
//!          │  in-flight  │  cancel   │ per identifier)│
//!          │  table      │──watch──▶│  strategy→xform │
//!          └──────┬──────┘           └───────┬────────┘
//!                 │                          │
//!                 └────────┬─────────────────┘
//!                          ▼
//!                 events (broadcast) ──filter by id──▶ subscribers
//! ```
//!
//! # Preemption
//!
//! A new request for an identifier that is already running fires the old
//! run's cancel signal and publishes a `Loading` event flagged
//! `cancelled: true`. That event doubles as the loading marker of the
//! superseding run, so the stream a subscriber sees across a preemption is
//! exactly `[Loading, Loading{cancelled}, Done]`. The superseded run never
//! dispatches to the store and never emits a terminal event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use crate::config::Config;
use crate::datasource::{DataQueryRequest, LegacyQueryOptions, ScopedVar};
use crate::error::{DataSourceError, Error, Result, RunnerError};
use crate::store::{TemplatingStore, VariableModel};
use crate::transform::to_metric_find_values;
use crate::types::{LoadingState, TimeRange, VariableIdentifier, VariableKind, VariableRefresh};

use super::strategies::{QueryRunners, RunRequestArgs};
use super::{TimeRangeProvider, UpdateOptionsEvent, UpdateOptionsRequest};

// ============================================================================
// Dependencies and statistics
// ============================================================================

/// Collaborators the runner is constructed with
///
/// Passed in explicitly; the runner has no global state.
#[derive(Clone)]
pub struct RunnerDeps {
    /// Shared templating state
    pub store: Arc<TemplatingStore>,

    /// Source of the active dashboard time range
    pub time_range: Arc<dyn TimeRangeProvider>,
}

/// Runner statistics
#[derive(Debug, Default)]
struct RunnerStats {
    requests_queued: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    runs_preempted: AtomicU64,
    runs_cancelled: AtomicU64,
    runs_discarded: AtomicU64,
    runs_skipped: AtomicU64,
}

/// Point-in-time snapshot of the runner statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunnerStatsSnapshot {
    /// Requests accepted via `queue_request`
    pub requests_queued: u64,
    /// Runs that emitted a terminal `Done`
    pub runs_completed: u64,
    /// Runs that emitted a terminal `Error`
    pub runs_failed: u64,
    /// Runs superseded by a newer request for the same identifier
    pub runs_preempted: u64,
    /// Runs stopped by an explicit cancel
    pub runs_cancelled: u64,
    /// Runs discarded because the transaction batch restarted mid-run
    pub runs_discarded: u64,
    /// Requests dropped because the variable was not a query variable
    pub runs_skipped: u64,
}

impl RunnerStats {
    fn snapshot(&self) -> RunnerStatsSnapshot {
        RunnerStatsSnapshot {
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_preempted: self.runs_preempted.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            runs_discarded: self.runs_discarded.load(Ordering::Relaxed),
            runs_skipped: self.runs_skipped.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Commands and run context
// ============================================================================

enum Command {
    Queue(UpdateOptionsRequest),
    Cancel(VariableIdentifier),
    Finished {
        identifier: VariableIdentifier,
        generation: u64,
    },
    Shutdown,
}

/// Everything a run task needs, shared behind one `Arc`
struct RunContext {
    deps: RunnerDeps,
    runners: QueryRunners,
    app_name: String,
    default_span: Duration,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<UpdateOptionsEvent>,
    stats: Arc<RunnerStats>,
}

enum RunOutcome {
    /// All dispatches landed; emit `Done`
    Completed,
    /// The variable was not a query variable; emit nothing further
    Skipped,
    /// The transaction batch restarted mid-run; emit nothing further
    Discarded,
    /// The cancel signal fired; the preemption event already told the story
    Preempted,
}

// ============================================================================
// Runner
// ============================================================================

/// Coordinates asynchronous, cancelable, per-variable query execution
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use varbeam::config::Config;
/// use varbeam::datasource::stubs::StubDataSource;
/// use varbeam::runner::{
///     FixedTimeRangeProvider, RunnerDeps, UpdateOptionsRequest, VariableQueryRunner,
/// };
/// use varbeam::store::{QueryVariable, TemplatingStore};
/// use varbeam::types::VariableIdentifier;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = Arc::new(TemplatingStore::new());
/// store
///     .add_variable("dash-1", QueryVariable::new("v0", "region").into())
///     .unwrap();
///
/// let runner = VariableQueryRunner::new(
///     RunnerDeps {
///         store,
///         time_range: Arc::new(FixedTimeRangeProvider::default()),
///     },
///     Config::default(),
/// );
///
/// let identifier = VariableIdentifier::query("v0", "dash-1");
/// let datasource = Arc::new(StubDataSource::new("prom"));
/// runner
///     .update_options(UpdateOptionsRequest::new(identifier, datasource))
///     .await
///     .unwrap();
/// # }
/// ```
pub struct VariableQueryRunner {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<UpdateOptionsEvent>,
    stats: Arc<RunnerStats>,
}

impl VariableQueryRunner {
    /// Create a runner and spawn its dispatcher task
    pub fn new(deps: RunnerDeps, config: Config) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(config.runner.events_buffer_size.max(1));
        let stats = Arc::new(RunnerStats::default());

        let context = Arc::new(RunContext {
            deps,
            runners: QueryRunners::new(),
            app_name: config.query.app_name.clone(),
            default_span: Duration::hours(config.query.default_time_span_hours.max(0)),
            commands: commands_tx.clone(),
            events: events_tx.clone(),
            stats: Arc::clone(&stats),
        });

        let warn_threshold = config.runner.inflight_warn_threshold;
        tokio::spawn(dispatch_loop(context, commands_rx, warn_threshold));

        Self {
            commands: commands_tx,
            events: events_tx,
            stats,
        }
    }

    /// Enqueue a request; never blocks
    ///
    /// A request for an identifier that is already running preempts the
    /// in-flight run.
    pub fn queue_request(&self, request: UpdateOptionsRequest) {
        self.stats.requests_queued.fetch_add(1, Ordering::Relaxed);
        if self.commands.send(Command::Queue(request)).is_err() {
            tracing::warn!("request queued after runner destruction, dropping");
        }
    }

    /// Cancel the in-flight run for an identifier, if any
    ///
    /// Cancelling an idle identifier emits nothing.
    pub fn cancel_request(&self, identifier: &VariableIdentifier) {
        let _ = self.commands.send(Command::Cancel(identifier.clone()));
    }

    /// Subscribe to events for one identifier
    ///
    /// Subscribe before queueing, or the `Loading` event may be missed.
    pub fn get_response(&self, identifier: &VariableIdentifier) -> ResponseReceiver {
        ResponseReceiver {
            identifier: identifier.clone(),
            receiver: self.events.subscribe(),
        }
    }

    /// Queue a request and await its terminal event
    ///
    /// The one-shot adapter over the event stream: resolves on the first
    /// `Done`, rejects with the preserved error on the first `Error`. A
    /// preemption flows into the superseding run's terminal event.
    pub async fn update_options(
        &self,
        request: UpdateOptionsRequest,
    ) -> std::result::Result<(), Arc<Error>> {
        let mut responses = self.get_response(&request.identifier);
        self.queue_request(request);

        loop {
            match responses.recv().await {
                Some(event) if event.state == LoadingState::Done => return Ok(()),
                Some(event) if event.state == LoadingState::Error => {
                    return Err(event.error.unwrap_or_else(|| {
                        Arc::new(RunnerError::ChannelClosed("error event without detail".into()).into())
                    }));
                }
                Some(_) => continue,
                None => {
                    return Err(Arc::new(
                        RunnerError::ChannelClosed("runner destroyed".to_string()).into(),
                    ))
                }
            }
        }
    }

    /// Snapshot of the runner statistics
    pub fn stats(&self) -> RunnerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Tear down the dispatcher and every in-flight run
    ///
    /// Requests queued after destruction are dropped.
    pub fn destroy(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl Drop for VariableQueryRunner {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

// ============================================================================
// Response receiver
// ============================================================================

/// Event stream of one identifier, filtered off the shared broadcast
pub struct ResponseReceiver {
    identifier: VariableIdentifier,
    receiver: broadcast::Receiver<UpdateOptionsEvent>,
}

impl ResponseReceiver {
    /// Next event for this identifier, `None` once the runner is gone
    ///
    /// Events of other identifiers are skipped. A lagged receiver resumes
    /// at the oldest retained event; slow consumers never block the runner.
    pub async fn recv(&mut self) -> Option<UpdateOptionsEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.identifier == self.identifier => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        variable = %self.identifier,
                        missed,
                        "response receiver lagged behind the event stream"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next terminal event, skipping progress events
    pub async fn next_terminal(&mut self) -> Option<UpdateOptionsEvent> {
        loop {
            match self.recv().await {
                Some(event) if event.is_terminal() => return Some(event),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct InFlight {
    generation: u64,
    cancel: watch::Sender<bool>,
}

async fn dispatch_loop(
    context: Arc<RunContext>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    warn_threshold: usize,
) {
    let mut in_flight: HashMap<VariableIdentifier, InFlight> = HashMap::new();
    let mut generation: u64 = 0;

    while let Some(command) = commands.recv().await {
        match command {
            Command::Queue(request) => {
                let identifier = request.identifier.clone();

                // Preempting an in-flight run emits the cancelled Loading,
                // which doubles as the superseding run's loading marker.
                if let Some(previous) = in_flight.remove(&identifier) {
                    let _ = previous.cancel.send(true);
                    context.stats.runs_preempted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(variable = %identifier, "preempting in-flight run");
                    let _ = context
                        .events
                        .send(UpdateOptionsEvent::cancelled(identifier.clone()));
                } else {
                    let _ = context
                        .events
                        .send(UpdateOptionsEvent::loading(identifier.clone()));
                }

                generation += 1;
                let (cancel_tx, cancel_rx) = watch::channel(false);
                in_flight.insert(
                    identifier,
                    InFlight {
                        generation,
                        cancel: cancel_tx,
                    },
                );

                if warn_threshold > 0 && in_flight.len() >= warn_threshold {
                    tracing::warn!(
                        in_flight = in_flight.len(),
                        threshold = warn_threshold,
                        "high number of concurrent variable query runs"
                    );
                }

                tokio::spawn(run(Arc::clone(&context), request, generation, cancel_rx));
            }

            Command::Cancel(identifier) => {
                if let Some(previous) = in_flight.remove(&identifier) {
                    let _ = previous.cancel.send(true);
                    context.stats.runs_cancelled.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(variable = %identifier, "cancelled in-flight run");
                    let _ = context
                        .events
                        .send(UpdateOptionsEvent::cancelled(identifier));
                }
            }

            Command::Finished {
                identifier,
                generation: finished,
            } => {
                // A preempting run may have replaced the entry; only the
                // run that still owns it deregisters.
                if in_flight
                    .get(&identifier)
                    .map(|entry| entry.generation == finished)
                    .unwrap_or(false)
                {
                    in_flight.remove(&identifier);
                }
            }

            Command::Shutdown => {
                for (identifier, entry) in in_flight.drain() {
                    let _ = entry.cancel.send(true);
                    tracing::debug!(variable = %identifier, "cancelling run on shutdown");
                }
                break;
            }
        }
    }

    tracing::debug!("variable query dispatcher stopped");
}

// ============================================================================
// Per-request run
// ============================================================================

async fn run(
    context: Arc<RunContext>,
    request: UpdateOptionsRequest,
    generation: u64,
    mut cancel: watch::Receiver<bool>,
) {
    let identifier = request.identifier.clone();

    let outcome = tokio::select! {
        biased;
        _ = cancel.changed() => Ok(RunOutcome::Preempted),
        outcome = execute(&context, &request) => outcome,
    };

    // Deregister before publishing the terminal event: anyone reacting to
    // the event by queueing again must order behind this command.
    let _ = context.commands.send(Command::Finished {
        identifier: identifier.clone(),
        generation,
    });

    match outcome {
        Ok(RunOutcome::Completed) => {
            context.stats.runs_completed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(variable = %identifier, "variable options updated");
            let _ = context.events.send(UpdateOptionsEvent::done(identifier));
        }
        Ok(RunOutcome::Skipped) => {
            context.stats.runs_skipped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(RunOutcome::Discarded) => {
            context.stats.runs_discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                variable = %identifier,
                "discarding stale result, transaction batch restarted"
            );
        }
        Ok(RunOutcome::Preempted) => {
            tracing::trace!(variable = %identifier, "run preempted");
        }
        Err(error) => {
            context.stats.runs_failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(variable = %identifier, error = %error, "variable query run failed");
            let _ = context
                .events
                .send(UpdateOptionsEvent::error(identifier, Arc::new(error)));
        }
    }
}

async fn execute(context: &RunContext, request: &UpdateOptionsRequest) -> Result<RunOutcome> {
    let identifier = &request.identifier;
    let store = &context.deps.store;

    let batch_before = store.transaction_uid(&identifier.root_state_key);

    let variable = match store.variable(identifier)? {
        VariableModel::Query(variable) => variable,
        other => {
            // The variable was removed or changed kind between enqueue and
            // processing; a race, not an error.
            tracing::debug!(
                variable = %identifier,
                kind = %other.kind(),
                "skipping request for non-query variable"
            );
            return Ok(RunOutcome::Skipped);
        }
    };

    let datasource = request.datasource.as_ref();
    let strategy = context.runners.runner_for(datasource)?;
    let target = strategy.target(datasource, &variable)?;

    tracing::debug!(
        variable = %identifier,
        datasource = datasource.uid(),
        strategy = strategy.name(),
        "executing variable query"
    );

    let range = if variable.refresh == VariableRefresh::OnTimeRangeChanged {
        context.deps.time_range.range()
    } else {
        let to = Utc::now();
        TimeRange {
            from: to - context.default_span,
            to,
        }
    };

    let mut scoped_vars = HashMap::new();
    if let Some(current) = &variable.current {
        scoped_vars.insert(
            "variable".to_string(),
            ScopedVar {
                text: current.text.to_string(),
                value: current.value.to_string(),
            },
        );
    }
    if let Some(filter) = &request.search_filter {
        scoped_vars.insert("__searchFilter".to_string(), ScopedVar::new(filter.clone()));
    }

    let legacy_options = LegacyQueryOptions {
        range,
        search_filter: request.search_filter.clone(),
        variable_name: variable.name.clone(),
        variable_kind: VariableKind::Query,
    };

    let args = RunRequestArgs {
        datasource: Arc::clone(&request.datasource),
        query: variable.query.clone(),
        request: DataQueryRequest {
            request_id: Uuid::new_v4().to_string(),
            app: context.app_name.clone(),
            targets: vec![target],
            scoped_vars,
            range,
            start_time: Utc::now(),
        },
        legacy_options: legacy_options.clone(),
    };

    // Only the first terminal response matters; the stream is dropped as
    // soon as it arrives, releasing the underlying subscription.
    let mut stream = strategy.run(args);
    let terminal = loop {
        match stream.next().await {
            Some(response) if response.state.is_terminal() => break response,
            Some(_) => continue,
            None => return Err(RunnerError::NoTerminalResponse.into()),
        }
    };
    drop(stream);

    if terminal.state == LoadingState::Error {
        let error = terminal.error.unwrap_or_else(|| {
            DataSourceError::QueryFailed("terminal error response without detail".to_string())
        });
        return Err(error.into());
    }

    let values = to_metric_find_values(terminal.data)?;

    // Results of a restarted transaction batch must not land.
    let batch_after = store.transaction_uid(&identifier.root_state_key);
    if batch_before != batch_after {
        return Ok(RunOutcome::Discarded);
    }

    store.update_variable_options(identifier, &values, &variable.regex)?;

    if variable.use_tags {
        let tags_query = serde_json::Value::String(variable.tags_query.clone());
        let tags = request
            .datasource
            .metric_find_query(&tags_query, &legacy_options)
            .await?;
        store.update_variable_tags(identifier, &tags)?;
    }

    // Filter-as-you-type lookups refresh options only; the selection is
    // reconciled on full runs.
    if request.search_filter.is_none() {
        store.validate_selection(identifier, None)?;
    }

    Ok(RunOutcome::Completed)
}

// ============================================================================
// Tests
// ============================================================================
