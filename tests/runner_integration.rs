//! End-to-End Runner Integration Tests
//!
//! Exercises the variable query runner through its public surface:
//!
//! 1. **Happy path** - exactly `[Loading, Done]` with options written
//! 2. **Preemption** - `[Loading, Loading{cancelled}, Done]`, superseded
//!    run never dispatches
//! 3. **Explicit cancel** - cancelled Loading, then silence
//! 4. **Search filter** - options refresh without selection validation
//! 5. **Strategy selection failure** - terminal Error with pinned message
//! 6. **Legacy empty result** - Done, options become the None sentinel
//! 7. **Stale transaction batch** - result discarded without dispatches
//! 8. **Independent identifiers** - concurrent unrelated runs do not
//!    interfere

use std::sync::Arc;
use std::time::Duration;

use varbeam::config::Config;
use varbeam::datasource::stubs::{ScriptedResponse, StubDataSource};
use varbeam::datasource::VariableCapabilities;
use varbeam::runner::{
    FixedTimeRangeProvider, ResponseReceiver, RunnerDeps, UpdateOptionsEvent,
    UpdateOptionsRequest, VariableQueryRunner,
};
use varbeam::store::{ConstantVariable, QueryVariable, TemplatingStore};
use varbeam::types::{
    LoadingState, MetricFindValue, OptionValue, VariableIdentifier, VariableOption,
};

const KEY: &str = "dash-1";

// =============================================================================
// Test Helpers
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Store with one query variable and a runner wired to it
fn harness(variable: QueryVariable) -> (Arc<TemplatingStore>, VariableQueryRunner) {
    init_tracing();
    let store = Arc::new(TemplatingStore::new());
    store.begin_transaction(KEY);
    store
        .add_variable(KEY, variable.into())
        .expect("variable registration");

    let runner = VariableQueryRunner::new(
        RunnerDeps {
            store: Arc::clone(&store),
            time_range: Arc::new(FixedTimeRangeProvider::default()),
        },
        Config::default(),
    );
    (store, runner)
}

fn identifier(id: &str) -> VariableIdentifier {
    VariableIdentifier::query(id, KEY)
}

fn finds(texts: &[&str]) -> Vec<MetricFindValue> {
    texts.iter().map(|t| MetricFindValue::text(*t)).collect()
}

fn option_texts(options: &[VariableOption]) -> Vec<String> {
    options.iter().map(|o| o.text.to_string()).collect()
}

async fn recv(receiver: &mut ResponseReceiver) -> UpdateOptionsEvent {
    tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn assert_silent(receiver: &mut ResponseReceiver, for_ms: u64) {
    let outcome = tokio::time::timeout(Duration::from_millis(for_ms), receiver.recv()).await;
    assert!(outcome.is_err(), "expected no event, got {:?}", outcome);
}

// =============================================================================
// Happy Path
// =============================================================================

#[tokio::test]
async fn test_happy_path_emits_exactly_loading_then_done() {
    let (store, runner) = harness(QueryVariable::new("v0", "region"));
    let id = identifier("v0");
    let datasource = Arc::new(
        StubDataSource::new("prom").with_find_values(finds(&["us-east-1", "us-west-2"])),
    );

    let mut responses = runner.get_response(&id);
    runner.queue_request(UpdateOptionsRequest::new(id.clone(), datasource));

    let first = recv(&mut responses).await;
    assert_eq!(first.state, LoadingState::Loading);
    assert!(!first.cancelled);

    let second = recv(&mut responses).await;
    assert_eq!(second.state, LoadingState::Done);

    assert_silent(&mut responses, 200).await;

    let variable = store.query_variable(&id).unwrap();
    assert_eq!(
        option_texts(&variable.options),
        vec!["us-east-1", "us-west-2"]
    );
    // Selection was validated against the fresh options
    let current = variable.current.expect("current set by validation");
    assert_eq!(current.value, OptionValue::Single("us-east-1".into()));
}

#[tokio::test]
async fn test_repeated_runs_are_idempotent() {
    let (store, runner) = harness(QueryVariable::new("v0", "region"));
    let id = identifier("v0");
    let datasource =
        Arc::new(StubDataSource::new("prom").with_find_values(finds(&["a", "b", "c"])));

    for _ in 0..2 {
        runner
            .update_options(UpdateOptionsRequest::new(id.clone(), datasource.clone()))
            .await
            .unwrap();
    }

    let variable = store.query_variable(&id).unwrap();
    assert_eq!(option_texts(&variable.options), vec!["a", "b", "c"]);
    assert_eq!(runner.stats().runs_completed, 2);
}

#[tokio::test]
async fn test_tags_query_runs_after_options_when_configured() {
    let variable = QueryVariable::new("v0", "region").with_tags_query("tag_names()");
    let (store, runner) = harness(variable);
    let id = identifier("v0");
    let datasource =
        Arc::new(StubDataSource::new("prom").with_find_values(finds(&["datacenter"])));

    runner
        .update_options(UpdateOptionsRequest::new(id.clone(), datasource.clone()))
        .await
        .unwrap();

    // One options query, one tags query, in that order
    let calls = datasource.find_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0, serde_json::Value::String("tag_names()".into()));

    let stored = store.query_variable(&id).unwrap();
    assert_eq!(stored.tags.len(), 1);
    assert_eq!(stored.tags[0].text, "datacenter");
    assert!(stored.current.is_some());
}

// =============================================================================
// Preemption and Cancellation
// =============================================================================

#[tokio::test]
async fn test_new_request_preempts_in_flight_run() {
    let (store, runner) = harness(QueryVariable::new("v0", "region"));
    let id = identifier("v0");

    let slow = Arc::new(
        StubDataSource::new("slow")
            .with_find_values(finds(&["stale"]))
            .with_delay(Duration::from_millis(300)),
    );
    let fast = Arc::new(StubDataSource::new("fast").with_find_values(finds(&["fresh"])));

    let mut responses = runner.get_response(&id);
    runner.queue_request(UpdateOptionsRequest::new(id.clone(), slow));
    tokio::time::sleep(Duration::from_millis(50)).await;
    runner.queue_request(UpdateOptionsRequest::new(id.clone(), fast));

    let first = recv(&mut responses).await;
    assert_eq!(first.state, LoadingState::Loading);
    assert!(!first.cancelled);

    let second = recv(&mut responses).await;
    assert_eq!(second.state, LoadingState::Loading);
    assert!(second.cancelled, "preemption must be flagged");

    let third = recv(&mut responses).await;
    assert_eq!(third.state, LoadingState::Done);

    // The superseded run's results never land, even after its delay
    tokio::time::sleep(Duration::from_millis(400)).await;
    let variable = store.query_variable(&id).unwrap();
    assert_eq!(option_texts(&variable.options), vec!["fresh"]);
    assert_eq!(runner.stats().runs_preempted, 1);
}

#[tokio::test]
async fn test_explicit_cancel_emits_cancelled_loading_and_nothing_else() {
    let (store, runner) = harness(QueryVariable::new("v0", "region"));
    let id = identifier("v0");
    let slow = Arc::new(
        StubDataSource::new("slow")
            .with_find_values(finds(&["never-lands"]))
            .with_delay(Duration::from_millis(300)),
    );

    let mut responses = runner.get_response(&id);
    runner.queue_request(UpdateOptionsRequest::new(id.clone(), slow));
    tokio::time::sleep(Duration::from_millis(50)).await;
    runner.cancel_request(&id);

    let first = recv(&mut responses).await;
    assert_eq!(first.state, LoadingState::Loading);
    assert!(!first.cancelled);

    let second = recv(&mut responses).await;
    assert!(second.cancelled);

    // No terminal event, no dispatches
    assert_silent(&mut responses, 500).await;
    let variable = store.query_variable(&id).unwrap();
    assert!(variable.options.is_empty());
    assert_eq!(runner.stats().runs_cancelled, 1);
}

#[tokio::test]
async fn test_cancel_with_nothing_in_flight_is_silent() {
    let (_store, runner) = harness(QueryVariable::new("v0", "region"));
    let id = identifier("v0");

    let mut responses = runner.get_response(&id);
    runner.cancel_request(&id);

    assert_silent(&mut responses, 200).await;
}

// =============================================================================
// Search Filter
// =============================================================================

#[tokio::test]
async fn test_search_filter_refreshes_options_but_not_selection() {
    let variable = QueryVariable::new("v0", "region")
        .with_current(VariableOption::from_text("kept").selected());
    let (store, runner) = harness(variable);
    let id = identifier("v0");
    let datasource =
        Arc::new(StubDataSource::new("prom").with_find_values(finds(&["us-east-1"])));

    runner
        .update_options(
            UpdateOptionsRequest::new(id.clone(), datasource.clone())
                .with_search_filter("us-"),
        )
        .await
        .unwrap();

    // The filter rode along on the legacy options
    let calls = datasource.find_calls();
    assert_eq!(calls[0].1.search_filter.as_deref(), Some("us-"));

    // Options refreshed, selection untouched
    let stored = store.query_variable(&id).unwrap();
    assert_eq!(option_texts(&stored.options), vec!["us-east-1"]);
    let current = stored.current.unwrap();
    assert_eq!(current.text, OptionValue::Single("kept".into()));
}

// =============================================================================
// Error Surfacing
// =============================================================================

#[tokio::test]
async fn test_unmatched_capabilities_surface_as_terminal_error() {
    let (_store, runner) = harness(QueryVariable::new("v0", "region"));
    let id = identifier("v0");
    let datasource = Arc::new(
        StubDataSource::new("empty").with_capabilities(VariableCapabilities::none()),
    );

    let mut responses = runner.get_response(&id);
    runner.queue_request(UpdateOptionsRequest::new(id.clone(), datasource));

    let _loading = recv(&mut responses).await;
    let terminal = recv(&mut responses).await;
    assert_eq!(terminal.state, LoadingState::Error);
    assert!(terminal
        .error
        .unwrap()
        .to_string()
        .contains("Couldn't find a query runner that matches supplied arguments."));
    assert_eq!(runner.stats().runs_failed, 1);
}

#[tokio::test]
async fn test_datasource_failure_preserves_the_original_message() {
    let (_store, runner) = harness(QueryVariable::new("v0", "region"));
    let id = identifier("v0");
    let datasource = Arc::new(StubDataSource::new("prom").with_find_error("connection refused"));

    let error = runner
        .update_options(UpdateOptionsRequest::new(id, datasource))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("connection refused"));
}

#[tokio::test]
async fn test_frames_without_string_field_are_a_transform_error() {
    let (_store, runner) = harness(QueryVariable::new("v0", "region"));
    let id = identifier("v0");
    let frame = varbeam::datasource::DataFrame::new()
        .with_field(varbeam::datasource::Field::numbers("value", [1.0, 2.0]));
    let datasource = Arc::new(
        StubDataSource::new("prom")
            .with_capabilities(VariableCapabilities::datasource())
            .with_frames(vec![frame]),
    );

    let error = runner
        .update_options(UpdateOptionsRequest::new(id, datasource))
        .await
        .unwrap_err();
    assert!(error
        .to_string()
        .contains("Couldn't find any field of type string in the results."));
}

// =============================================================================
// Empty Results and Sentinels
// =============================================================================

#[tokio::test]
async fn test_legacy_empty_result_yields_the_none_sentinel() {
    let (store, runner) = harness(QueryVariable::new("v0", "region"));
    let id = identifier("v0");
    let datasource = Arc::new(StubDataSource::new("prom").with_find_values(Vec::new()));

    runner
        .update_options(UpdateOptionsRequest::new(id.clone(), datasource))
        .await
        .unwrap();

    let variable = store.query_variable(&id).unwrap();
    assert_eq!(variable.options.len(), 1);
    assert!(variable.options[0].is_none);
}

#[tokio::test]
async fn test_intermediate_stream_responses_are_ignored() {
    let (store, runner) = harness(QueryVariable::new("v0", "region"));
    let id = identifier("v0");

    let frame = varbeam::datasource::DataFrame::new()
        .with_field(varbeam::datasource::Field::strings("text", ["final"]));
    let datasource = Arc::new(
        StubDataSource::new("prom")
            .with_capabilities(VariableCapabilities::datasource())
            .with_script(vec![
                ScriptedResponse::Loading,
                ScriptedResponse::Streaming(vec![varbeam::datasource::DataFrame::new()
                    .with_field(varbeam::datasource::Field::strings("text", ["partial"]))]),
                ScriptedResponse::DoneFrames(vec![frame]),
            ]),
    );

    runner
        .update_options(UpdateOptionsRequest::new(id.clone(), datasource))
        .await
        .unwrap();

    // Only the terminal frame's payload lands
    let variable = store.query_variable(&id).unwrap();
    assert_eq!(option_texts(&variable.options), vec!["final"]);
}

// =============================================================================
// Races
// =============================================================================

#[tokio::test]
async fn test_non_query_variable_gets_loading_and_nothing_further() {
    let (store, runner) = harness(QueryVariable::new("v0", "region"));
    store
        .add_variable(KEY, ConstantVariable::new("c0", "env", "prod").into())
        .unwrap();
    let id = identifier("c0");

    let mut responses = runner.get_response(&id);
    runner.queue_request(UpdateOptionsRequest::new(
        id.clone(),
        Arc::new(StubDataSource::new("prom")),
    ));

    let first = recv(&mut responses).await;
    assert_eq!(first.state, LoadingState::Loading);
    assert_silent(&mut responses, 300).await;
}

#[tokio::test]
async fn test_restarted_transaction_batch_discards_the_result() {
    let (store, runner) = harness(QueryVariable::new("v0", "region"));
    let id = identifier("v0");
    let slow = Arc::new(
        StubDataSource::new("slow")
            .with_find_values(finds(&["stale"]))
            .with_delay(Duration::from_millis(200)),
    );

    let mut responses = runner.get_response(&id);
    runner.queue_request(UpdateOptionsRequest::new(id.clone(), slow));
    let _loading = recv(&mut responses).await;

    // The whole variable-initialization batch restarts mid-run
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.begin_transaction(KEY);

    // Nothing lands and no terminal event is published
    assert_silent(&mut responses, 500).await;
    let variable = store.query_variable(&id).unwrap();
    assert!(variable.options.is_empty());
    assert_eq!(runner.stats().runs_discarded, 1);
}

#[tokio::test]
async fn test_unrelated_identifiers_run_fully_independently() {
    let (store, runner) = harness(QueryVariable::new("v0", "region"));
    store
        .add_variable(KEY, QueryVariable::new("v1", "zone").into())
        .unwrap();
    let slow_id = identifier("v0");
    let fast_id = identifier("v1");

    let slow = Arc::new(
        StubDataSource::new("slow")
            .with_find_values(finds(&["slow-value"]))
            .with_delay(Duration::from_millis(200)),
    );
    let fast = Arc::new(StubDataSource::new("fast").with_find_values(finds(&["fast-value"])));

    let mut slow_responses = runner.get_response(&slow_id);
    let mut fast_responses = runner.get_response(&fast_id);
    runner.queue_request(UpdateOptionsRequest::new(slow_id.clone(), slow));
    runner.queue_request(UpdateOptionsRequest::new(fast_id.clone(), fast));

    // The fast run completes while the slow one is still in flight
    let first = recv(&mut fast_responses).await;
    assert_eq!(first.state, LoadingState::Loading);
    let second = recv(&mut fast_responses).await;
    assert_eq!(second.state, LoadingState::Done);

    let first = recv(&mut slow_responses).await;
    assert_eq!(first.state, LoadingState::Loading);
    assert!(!first.cancelled, "unrelated request must not preempt");
    let second = recv(&mut slow_responses).await;
    assert_eq!(second.state, LoadingState::Done);

    assert_eq!(
        option_texts(&store.query_variable(&slow_id).unwrap().options),
        vec!["slow-value"]
    );
    assert_eq!(
        option_texts(&store.query_variable(&fast_id).unwrap().options),
        vec!["fast-value"]
    );
}

#[tokio::test]
async fn test_destroy_tears_down_in_flight_runs() {
    let (store, runner) = harness(QueryVariable::new("v0", "region"));
    let id = identifier("v0");
    let slow = Arc::new(
        StubDataSource::new("slow")
            .with_find_values(finds(&["never-lands"]))
            .with_delay(Duration::from_millis(200)),
    );

    runner.queue_request(UpdateOptionsRequest::new(id.clone(), slow));
    tokio::time::sleep(Duration::from_millis(50)).await;
    runner.destroy();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.query_variable(&id).unwrap().options.is_empty());
}
