//! Shared templating state
//!
//! [`TemplatingStore`] holds every dashboard's variables, keyed by the root
//! state key of the dashboard instance. All mutation goes through dispatch
//! methods on the store; the runner never read-modifies-writes variable
//! state directly. Reads return cloned snapshots, so a snapshot taken
//! before an await point stays consistent regardless of what lands in the
//! store while the caller is suspended.
//!
//! Each state tree carries a transaction uid that rotates when a dashboard
//! (re)initializes its variables. The runner samples the uid when a request
//! starts and again before dispatching results; a rotation in between means
//! the whole batch was restarted and the results are stale.

pub mod model;

use std::collections::HashMap;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::options::metric_names_to_option_values;
use crate::types::{
    LoadingState, MetricFindValue, OptionValue, VariableIdentifier, VariableOption, VariableTag,
};

pub use model::{ConstantVariable, CustomVariable, QueryVariable, TextBoxVariable, VariableModel};

lazy_static! {
    /// Variable names are restricted to word characters
    static ref WORD_CHARACTERS_ONLY: Regex = Regex::new(r"^\w+$").expect("static name pattern");
}

/// Templating state of one dashboard instance
#[derive(Debug, Default)]
struct KeyedState {
    variables: HashMap<String, VariableModel>,
    transaction_uid: Option<String>,
}

/// Store of all templating state, keyed by root state key
///
/// Thread-safe; every method takes `&self`. Intended to be shared behind an
/// `Arc` between the runner, the service layer and embedding code.
pub struct TemplatingStore {
    state: RwLock<HashMap<String, KeyedState>>,
}

impl TemplatingStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Start a new variable-initialization transaction for a state tree
    ///
    /// Rotates the transaction uid; results of runs started under the old
    /// uid are discarded when they try to land.
    pub fn begin_transaction(&self, root_state_key: &str) -> String {
        let uid = Uuid::new_v4().to_string();
        let mut state = self.state.write();
        let keyed = state.entry(root_state_key.to_string()).or_default();
        keyed.transaction_uid = Some(uid.clone());

        tracing::debug!(key = %root_state_key, transaction = %uid, "started templating transaction");
        uid
    }

    /// Current transaction uid of a state tree, `None` before the first batch
    pub fn transaction_uid(&self, root_state_key: &str) -> Option<String> {
        self.state
            .read()
            .get(root_state_key)
            .and_then(|keyed| keyed.transaction_uid.clone())
    }

    // ------------------------------------------------------------------
    // Variable registration and snapshots
    // ------------------------------------------------------------------

    /// Add a variable to a state tree, validating its name
    pub fn add_variable(&self, root_state_key: &str, model: VariableModel) -> Result<()> {
        self.validate_name(root_state_key, model.name(), Some(model.id()))?;

        let mut state = self.state.write();
        let keyed = state.entry(root_state_key.to_string()).or_default();
        keyed.variables.insert(model.id().to_string(), model);
        Ok(())
    }

    /// Remove a variable, returning whether it existed
    pub fn remove_variable(&self, identifier: &VariableIdentifier) -> bool {
        let mut state = self.state.write();
        state
            .get_mut(&identifier.root_state_key)
            .map(|keyed| keyed.variables.remove(&identifier.id).is_some())
            .unwrap_or(false)
    }

    /// Snapshot of a variable by identifier
    pub fn variable(&self, identifier: &VariableIdentifier) -> Result<VariableModel> {
        let state = self.state.read();
        state
            .get(&identifier.root_state_key)
            .and_then(|keyed| keyed.variables.get(&identifier.id))
            .cloned()
            .ok_or_else(|| StoreError::VariableNotFound(identifier.id.clone()).into())
    }

    /// Snapshot of a query variable, erroring on other kinds
    pub fn query_variable(&self, identifier: &VariableIdentifier) -> Result<QueryVariable> {
        let model = self.variable(identifier)?;
        let kind = model.kind();
        match model {
            VariableModel::Query(variable) => Ok(variable),
            _ => Err(StoreError::WrongVariableKind {
                id: identifier.id.clone(),
                actual: kind.to_string(),
                expected: "query".to_string(),
            }
            .into()),
        }
    }

    /// Validate a variable name for editor flows
    ///
    /// `exclude_id` skips the duplicate check against the variable being
    /// renamed.
    pub fn validate_name(
        &self,
        root_state_key: &str,
        name: &str,
        exclude_id: Option<&str>,
    ) -> Result<()> {
        if name.starts_with("__") {
            return Err(StoreError::ReservedNamePrefix.into());
        }
        if !WORD_CHARACTERS_ONLY.is_match(name) {
            return Err(StoreError::InvalidNameCharacters.into());
        }

        let state = self.state.read();
        if let Some(keyed) = state.get(root_state_key) {
            let duplicate = keyed
                .variables
                .values()
                .any(|model| model.name() == name && Some(model.id()) != exclude_id);
            if duplicate {
                return Err(StoreError::DuplicateName.into());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatches used by the runner
    // ------------------------------------------------------------------

    /// Write freshly computed options onto a query variable
    ///
    /// Runs the option builder with the variable's sort policy, then applies
    /// the store-side decoration: the All sentinel is prepended when the
    /// variable offers it, and an empty list becomes the single None
    /// sentinel so `options` is never empty after a successful run.
    pub fn update_variable_options(
        &self,
        identifier: &VariableIdentifier,
        results: &[MetricFindValue],
        templated_regex: &str,
    ) -> Result<()> {
        let (sort, include_all) = {
            let variable = self.query_variable(identifier)?;
            (variable.sort, variable.include_all)
        };

        let mut options = metric_names_to_option_values(results, sort, templated_regex)?;
        if include_all {
            options.insert(0, VariableOption::all());
        }
        if options.is_empty() {
            options.push(VariableOption::none());
        }

        tracing::debug!(
            variable = %identifier,
            options = options.len(),
            "updated variable options"
        );

        self.with_query_variable(identifier, |variable| {
            variable.options = options;
        })
    }

    /// Write tags produced by a tags query onto a query variable
    pub fn update_variable_tags(
        &self,
        identifier: &VariableIdentifier,
        values: &[MetricFindValue],
    ) -> Result<()> {
        let tags: Vec<VariableTag> = values
            .iter()
            .map(|value| VariableTag::new(value.text_string()))
            .collect();

        tracing::debug!(variable = %identifier, tags = tags.len(), "updated variable tags");

        self.with_query_variable(identifier, |variable| {
            variable.tags = tags;
        })
    }

    /// Set the current selection and re-sync every option's selected flag
    pub fn set_current_value(
        &self,
        identifier: &VariableIdentifier,
        option: VariableOption,
    ) -> Result<()> {
        self.with_query_variable(identifier, |variable| {
            let current = option.selected();
            for existing in &mut variable.options {
                let selected = match existing.value.as_single() {
                    Some(value) => current.value.contains(value),
                    None => false,
                };
                existing.selected = selected;
            }
            variable.current = Some(current);
        })
    }

    /// Reconcile the current selection against the present option list
    ///
    /// No options means nothing to reconcile and no write. A multi-value
    /// selection keeps its intersection with the options when non-empty.
    /// A single-value selection is kept when an option matches it by text;
    /// otherwise `default_value` picks an option by value; otherwise the
    /// first option wins.
    pub fn validate_selection(
        &self,
        identifier: &VariableIdentifier,
        default_value: Option<&str>,
    ) -> Result<()> {
        let variable = self.query_variable(identifier)?;
        if variable.options.is_empty() {
            return Ok(());
        }

        let chosen = match &variable.current {
            Some(current) if matches!(current.value, OptionValue::Multi(_)) => {
                self.reconcile_multi(&variable, current)
            }
            other => {
                let current_text = other
                    .as_ref()
                    .and_then(|current| current.text.as_single())
                    .unwrap_or("");
                self.reconcile_single(&variable, current_text, default_value)
            }
        };

        self.set_current_value(identifier, chosen)
    }

    fn reconcile_multi(
        &self,
        variable: &QueryVariable,
        current: &VariableOption,
    ) -> VariableOption {
        let selected: Vec<&VariableOption> = variable
            .options
            .iter()
            .filter(|option| match option.value.as_single() {
                Some(value) => current.value.contains(value),
                None => false,
            })
            .collect();

        if selected.is_empty() {
            return variable.options[0].clone();
        }

        let texts: Vec<String> = selected
            .iter()
            .map(|option| option.text.to_string())
            .collect();
        let values: Vec<String> = selected
            .iter()
            .map(|option| option.value.to_string())
            .collect();
        VariableOption::new(texts, values)
    }

    fn reconcile_single(
        &self,
        variable: &QueryVariable,
        current_text: &str,
        default_value: Option<&str>,
    ) -> VariableOption {
        if !current_text.is_empty() {
            if let Some(by_text) = variable
                .options
                .iter()
                .find(|option| option.text.as_single() == Some(current_text))
            {
                return by_text.clone();
            }
        }

        if let Some(default_value) = default_value {
            if let Some(by_value) = variable
                .options
                .iter()
                .find(|option| option.value.as_single() == Some(default_value))
            {
                return by_value.clone();
            }
        }

        variable.options[0].clone()
    }

    // ------------------------------------------------------------------
    // Loading-state transitions
    // ------------------------------------------------------------------

    /// Mark a variable as fetching options
    pub fn variable_state_fetching(&self, identifier: &VariableIdentifier) -> Result<()> {
        self.with_variable(identifier, |model| {
            model.set_state(LoadingState::Loading, None);
        })
    }

    /// Mark a variable's fetch as completed, clearing any previous error
    pub fn variable_state_completed(&self, identifier: &VariableIdentifier) -> Result<()> {
        self.with_variable(identifier, |model| {
            model.set_state(LoadingState::Done, None);
        })
    }

    /// Mark a variable's fetch as failed with the causing message
    pub fn variable_state_failed(
        &self,
        identifier: &VariableIdentifier,
        message: impl Into<String>,
    ) -> Result<()> {
        let message = message.into();
        self.with_variable(identifier, |model| {
            model.set_state(LoadingState::Error, Some(message));
        })
    }

    // ------------------------------------------------------------------
    // Editor writes
    // ------------------------------------------------------------------

    /// Write a new query and definition onto a query variable
    pub fn set_query_variable_query(
        &self,
        identifier: &VariableIdentifier,
        query: serde_json::Value,
        definition: impl Into<String>,
    ) -> Result<()> {
        let definition = definition.into();
        self.with_query_variable(identifier, |variable| {
            variable.query = query;
            variable.definition = definition;
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn with_variable<F>(&self, identifier: &VariableIdentifier, f: F) -> Result<()>
    where
        F: FnOnce(&mut VariableModel),
    {
        let mut state = self.state.write();
        let model = state
            .get_mut(&identifier.root_state_key)
            .and_then(|keyed| keyed.variables.get_mut(&identifier.id))
            .ok_or_else(|| StoreError::VariableNotFound(identifier.id.clone()))?;
        f(model);
        Ok(())
    }

    fn with_query_variable<F>(&self, identifier: &VariableIdentifier, f: F) -> Result<()>
    where
        F: FnOnce(&mut QueryVariable),
    {
        let mut state = self.state.write();
        let model = state
            .get_mut(&identifier.root_state_key)
            .and_then(|keyed| keyed.variables.get_mut(&identifier.id))
            .ok_or_else(|| StoreError::VariableNotFound(identifier.id.clone()))?;

        let kind = model.kind();
        match model.as_query_mut() {
            Some(variable) => {
                f(variable);
                Ok(())
            }
            None => Err(StoreError::WrongVariableKind {
                id: identifier.id.clone(),
                actual: kind.to_string(),
                expected: "query".to_string(),
            }
            .into()),
        }
    }
}

impl Default for TemplatingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::{VariableSort, NONE_VARIABLE_TEXT};

    const KEY: &str = "dash-1";

    fn store_with(variable: QueryVariable) -> (TemplatingStore, VariableIdentifier) {
        let identifier = VariableIdentifier::query(variable.id.clone(), KEY);
        let store = TemplatingStore::new();
        store.add_variable(KEY, variable.into()).unwrap();
        (store, identifier)
    }

    fn finds(texts: &[&str]) -> Vec<MetricFindValue> {
        texts.iter().map(|t| MetricFindValue::text(*t)).collect()
    }

    #[test]
    fn test_variable_snapshot_and_missing() {
        let (store, identifier) = store_with(QueryVariable::new("v0", "region"));
        assert_eq!(store.variable(&identifier).unwrap().id(), "v0");

        let missing = VariableIdentifier::query("ghost", KEY);
        let err = store.variable(&missing).unwrap_err();
        assert_eq!(err.to_string(), "Store error: Couldn't find variable with id: ghost");
    }

    #[test]
    fn test_transaction_uid_rotates() {
        let store = TemplatingStore::new();
        assert!(store.transaction_uid(KEY).is_none());

        let first = store.begin_transaction(KEY);
        assert_eq!(store.transaction_uid(KEY).as_deref(), Some(first.as_str()));

        let second = store.begin_transaction(KEY);
        assert_ne!(first, second);
    }

    #[test]
    fn test_name_validation() {
        let (store, _) = store_with(QueryVariable::new("v0", "region"));

        let err = store.validate_name(KEY, "__system", None).unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::ReservedNamePrefix)
        ));

        let err = store.validate_name(KEY, "my variable", None).unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::InvalidNameCharacters)
        ));

        let err = store.validate_name(KEY, "region", None).unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::DuplicateName)));

        // Renaming a variable to its own name is not a duplicate
        store.validate_name(KEY, "region", Some("v0")).unwrap();
        store.validate_name(KEY, "zone", None).unwrap();
    }

    #[test]
    fn test_update_options_applies_sort_and_regex() {
        let variable = QueryVariable::new("v0", "region")
            .with_sort(VariableSort::AlphabeticalAsc)
            .with_regex("/us-.*/");
        let (store, identifier) = store_with(variable);

        store
            .update_variable_options(
                &identifier,
                &finds(&["us-west-2", "eu-central-1", "us-east-1"]),
                "/us-.*/",
            )
            .unwrap();

        let variable = store.query_variable(&identifier).unwrap();
        let texts: Vec<_> = variable
            .options
            .iter()
            .map(|o| o.text.as_single().unwrap())
            .collect();
        assert_eq!(texts, vec!["us-east-1", "us-west-2"]);
    }

    #[test]
    fn test_update_options_decorates_with_all_sentinel() {
        let variable = QueryVariable::new("v0", "region").with_include_all();
        let (store, identifier) = store_with(variable);

        store
            .update_variable_options(&identifier, &finds(&["a", "b"]), "")
            .unwrap();

        let variable = store.query_variable(&identifier).unwrap();
        assert_eq!(variable.options.len(), 3);
        assert_eq!(variable.options[0], VariableOption::all());
    }

    #[test]
    fn test_update_options_empty_becomes_none_sentinel() {
        let (store, identifier) = store_with(QueryVariable::new("v0", "region"));

        store.update_variable_options(&identifier, &[], "").unwrap();

        let variable = store.query_variable(&identifier).unwrap();
        assert_eq!(variable.options.len(), 1);
        assert!(variable.options[0].is_none);
        assert_eq!(
            variable.options[0].text,
            OptionValue::Single(NONE_VARIABLE_TEXT.to_string())
        );
    }

    #[test]
    fn test_update_options_rejects_other_kinds() {
        let store = TemplatingStore::new();
        store
            .add_variable(KEY, ConstantVariable::new("v0", "env", "prod").into())
            .unwrap();

        let identifier = VariableIdentifier::query("v0", KEY);
        let err = store
            .update_variable_options(&identifier, &[], "")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::WrongVariableKind { .. })
        ));
    }

    #[test]
    fn test_update_tags() {
        let variable = QueryVariable::new("v0", "region").with_tags_query("tag_names()");
        let (store, identifier) = store_with(variable);

        store
            .update_variable_tags(&identifier, &finds(&["datacenter", "rack"]))
            .unwrap();

        let variable = store.query_variable(&identifier).unwrap();
        assert_eq!(variable.tags.len(), 2);
        assert_eq!(variable.tags[0].text, "datacenter");
        assert!(!variable.tags[0].selected);
    }

    #[test]
    fn test_set_current_syncs_selected_flags() {
        let (store, identifier) = store_with(QueryVariable::new("v0", "region"));
        store
            .update_variable_options(&identifier, &finds(&["a", "b", "c"]), "")
            .unwrap();

        store
            .set_current_value(&identifier, VariableOption::from_text("b"))
            .unwrap();

        let variable = store.query_variable(&identifier).unwrap();
        let selected: Vec<_> = variable.options.iter().map(|o| o.selected).collect();
        assert_eq!(selected, vec![false, true, false]);
        assert!(variable.current.as_ref().unwrap().selected);
    }

    #[test]
    fn test_validate_selection_no_options_is_a_no_op() {
        let (store, identifier) = store_with(QueryVariable::new("v0", "region"));
        store.validate_selection(&identifier, None).unwrap();
        assert!(store.query_variable(&identifier).unwrap().current.is_none());
    }

    #[test]
    fn test_validate_selection_keeps_current_matched_by_text() {
        let variable = QueryVariable::new("v0", "region")
            .with_current(VariableOption::from_text("b").selected());
        let (store, identifier) = store_with(variable);
        store
            .update_variable_options(&identifier, &finds(&["a", "b"]), "")
            .unwrap();

        store.validate_selection(&identifier, None).unwrap();

        let variable = store.query_variable(&identifier).unwrap();
        let current = variable.current.unwrap();
        assert_eq!(current.text, OptionValue::Single("b".into()));
        assert!(current.selected);
    }

    #[test]
    fn test_validate_selection_falls_back_to_default_then_first() {
        let variable = QueryVariable::new("v0", "region")
            .with_current(VariableOption::from_text("gone").selected());
        let (store, identifier) = store_with(variable);
        store
            .update_variable_options(&identifier, &finds(&["a", "b"]), "")
            .unwrap();

        store.validate_selection(&identifier, Some("b")).unwrap();
        let current = store.query_variable(&identifier).unwrap().current.unwrap();
        assert_eq!(current.value, OptionValue::Single("b".into()));

        store
            .set_current_value(&identifier, VariableOption::from_text("gone"))
            .unwrap();
        store.validate_selection(&identifier, None).unwrap();
        let current = store.query_variable(&identifier).unwrap().current.unwrap();
        assert_eq!(current.value, OptionValue::Single("a".into()));
    }

    #[test]
    fn test_validate_selection_multi_keeps_intersection() {
        let current = VariableOption::new(
            vec!["a".to_string(), "gone".to_string()],
            vec!["a".to_string(), "gone".to_string()],
        );
        let variable = QueryVariable::new("v0", "region")
            .with_multi()
            .with_current(current.selected());
        let (store, identifier) = store_with(variable);
        store
            .update_variable_options(&identifier, &finds(&["a", "b"]), "")
            .unwrap();

        store.validate_selection(&identifier, None).unwrap();

        let variable = store.query_variable(&identifier).unwrap();
        let current = variable.current.unwrap();
        assert_eq!(current.value, OptionValue::Multi(vec!["a".to_string()]));
        assert!(variable.options[0].selected);
        assert!(!variable.options[1].selected);
    }

    #[test]
    fn test_validate_selection_multi_empty_intersection_takes_first() {
        let current = VariableOption::new(vec!["gone".to_string()], vec!["gone".to_string()]);
        let variable = QueryVariable::new("v0", "region")
            .with_multi()
            .with_current(current);
        let (store, identifier) = store_with(variable);
        store
            .update_variable_options(&identifier, &finds(&["a", "b"]), "")
            .unwrap();

        store.validate_selection(&identifier, None).unwrap();

        let current = store.query_variable(&identifier).unwrap().current.unwrap();
        assert_eq!(current.value, OptionValue::Single("a".into()));
    }

    #[test]
    fn test_state_transitions() {
        let (store, identifier) = store_with(QueryVariable::new("v0", "region"));

        store.variable_state_fetching(&identifier).unwrap();
        assert_eq!(
            store.variable(&identifier).unwrap().state(),
            LoadingState::Loading
        );

        store
            .variable_state_failed(&identifier, "datasource unreachable")
            .unwrap();
        let model = store.variable(&identifier).unwrap();
        assert_eq!(model.state(), LoadingState::Error);
        assert_eq!(
            model.as_query().unwrap().error.as_deref(),
            Some("datasource unreachable")
        );

        store.variable_state_completed(&identifier).unwrap();
        let model = store.variable(&identifier).unwrap();
        assert_eq!(model.state(), LoadingState::Done);
        assert!(model.as_query().unwrap().error.is_none());
    }
}
