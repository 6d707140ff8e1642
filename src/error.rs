//! Error types for the variable resolution pipeline

use thiserror::Error;

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Datasource error
    #[error("Datasource error: {0}")]
    DataSource(#[from] DataSourceError),

    /// Query runner error
    #[error("Query runner error: {0}")]
    Runner(#[from] RunnerError),

    /// Result transform error
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// Templating store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// General error
    #[error("{0}")]
    General(String),
}

/// Datasource boundary errors
#[derive(Error, Debug)]
pub enum DataSourceError {
    /// No datasource registered under the requested uid
    #[error("Datasource not found: {0}")]
    NotFound(String),

    /// The datasource does not implement the invoked operation
    #[error("Datasource '{datasource}' does not support {operation}")]
    UnsupportedOperation {
        /// Datasource uid
        datasource: String,
        /// Name of the missing operation
        operation: &'static str,
    },

    /// The datasource reported a query failure
    #[error("Query failed: {0}")]
    QueryFailed(String),
}

/// Query runner errors
#[derive(Error, Debug)]
pub enum RunnerError {
    /// No strategy matched the datasource's capabilities
    #[error("Couldn't find a query runner that matches supplied arguments.")]
    NoRunnerFound,

    /// The runner was destroyed while requests were pending
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// The datasource result stream ended without a terminal response
    #[error("Result stream completed without a terminal response")]
    NoTerminalResponse,
}

/// Result normalization errors
#[derive(Error, Debug)]
pub enum TransformError {
    /// The result frames carry no string-typed field to build options from
    #[error("Couldn't find any field of type string in the results.")]
    NoStringField,

    /// The variable's extraction regex does not compile
    #[error("'{0}' is not a valid regular expression.")]
    InvalidRegex(String),
}

/// Templating store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// No variable registered under the requested identifier
    #[error("Couldn't find variable with id: {0}")]
    VariableNotFound(String),

    /// The variable exists but is not of the expected kind
    #[error("Variable '{id}' is of kind {actual}, expected {expected}")]
    WrongVariableKind {
        /// Variable id
        id: String,
        /// Kind found in the store
        actual: String,
        /// Kind the operation requires
        expected: String,
    },

    /// Variable names may not use the reserved global prefix
    #[error("Template names cannot begin with '__', that's reserved for global variables")]
    ReservedNamePrefix,

    /// Variable names are restricted to word characters
    #[error("Only word and digit characters are allowed in variable names")]
    InvalidNameCharacters,

    /// Another variable already uses the requested name
    #[error("Variable with the same name already exists")]
    DuplicateName,

    /// A variable query may not reference the variable it feeds
    #[error("Query cannot contain a reference to itself. Variable: ${0}")]
    SelfReferencingQuery(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
