//! Error taxonomy shared by every simulation crate.

use thiserror::Error;
use uuid::Uuid;

use crate::model::UserId;

/// Validation errors for domain invariants and configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// Bounded score outside its declared range.
    #[error("{field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    /// Numeric field must be finite.
    #[error("non-finite value for {0}")]
    NonFinite(&'static str),
    /// Budgets and prices must be non-negative.
    #[error("negative monetary value for {0}")]
    NegativeMoney(&'static str),
    /// Bids must be strictly positive.
    #[error("bid must be > 0")]
    NonPositiveBid,
    /// Stored label does not name a known variant.
    #[error("unknown {kind} label `{label}`")]
    UnknownLabel { kind: &'static str, label: String },
    /// Ad category index outside 0..=9.
    #[error("category index {0} is out of range")]
    CategoryIndex(i64),
    /// Only pending reports can be resolved.
    #[error("report {0} is not pending")]
    ReportNotPending(Uuid),
    /// Action whose report is not part of the same result.
    #[error("action {action} references report {report} outside this result")]
    OrphanAction { action: Uuid, report: Uuid },
    /// Flag without a suppressing action behind it.
    #[error("flag {flag} is not backed by a suppressing action")]
    UnbackedFlag { flag: Uuid },
    /// Report without exactly one action.
    #[error("report {0} must have exactly one action")]
    UnresolvedReport(Uuid),
    /// Stored text that does not decode (JSON, decimal, timestamp).
    #[error("malformed {field}: {message}")]
    Malformed { field: &'static str, message: String },
    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Config(String),
}

/// Failures reading from the repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("cannot open repository: {0}")]
    Connection(String),
    #[error("query `{operation}` failed: {message}")]
    Query {
        operation: &'static str,
        message: String,
    },
    #[error("invalid {entity} row `{id}`: {source}")]
    InvalidRow {
        entity: &'static str,
        id: String,
        #[source]
        source: ValidationError,
    },
}

/// Failures committing a step result. The write is rolled back as a whole.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("write `{operation}` failed: {message}")]
    Write {
        operation: &'static str,
        message: String,
    },
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("user `{0}` is not active")]
    UserNotActive(UserId),
    #[error("inconsistent step result: {0}")]
    Inconsistent(#[from] ValidationError),
}

/// Remote scoring failures. Always recovered by the caller with a default.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredictionError {
    #[error("{model} model unreachable: {message}")]
    Transport {
        model: &'static str,
        message: String,
    },
    #[error("{model} model returned HTTP {status}")]
    Status { model: &'static str, status: u16 },
    #[error("{model} model returned a malformed payload: {message}")]
    Malformed {
        model: &'static str,
        message: String,
    },
}

/// Any failure that can abort a single user's step.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
