use thiserror::Error;

use crate::schema::ColumnType;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Problems with the environment supplied configuration, detected before any
/// record is consumed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Env(#[from] envconfig::Error),
    #[error("missing required configuration {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("failed to read secret {name} from {path}: {source}")]
    SecretFile {
        name: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            name,
            reason: reason.into(),
        }
    }
}

/// The outcome of a failed delivery, already classified. Raw transport errors
/// never reach the sink controller.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(#[source] BoxError),
    #[error("fatal delivery failure: {0}")]
    Fatal(#[source] BoxError),
}

impl DeliveryError {
    pub fn transient(error: impl Into<BoxError>) -> Self {
        DeliveryError::Transient(error.into())
    }

    pub fn fatal(error: impl Into<BoxError>) -> Self {
        DeliveryError::Fatal(error.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Transient(_) => "transient",
            DeliveryError::Fatal(_) => "fatal",
        }
    }
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("column {column} has type {existing} but the batch carries {inferred} values")]
    TypeConflict {
        column: String,
        existing: ColumnType,
        inferred: &'static str,
    },
    #[error("field {field} carries both {first} and {second} values in the same batch")]
    MixedTypes {
        field: String,
        first: &'static str,
        second: &'static str,
    },
    #[error("fields {0:?} do not exist at the destination and schema auto update is disabled")]
    UnknownFields(Vec<String>),
    #[error("{0:?} is not a usable column name")]
    InvalidColumnName(String),
    #[error("field {0:?} collides with a column reserved for record metadata")]
    ReservedColumn(String),
    #[error("destination table {0} does not exist and schema auto update is disabled")]
    MissingTable(String),
    #[error("failed to inspect or update the destination schema: {0}")]
    Store(#[source] DeliveryError),
}

impl From<SchemaError> for DeliveryError {
    fn from(error: SchemaError) -> Self {
        match error {
            // Keep the store's own classification, a lost connection while reading
            // the catalog is as retryable as one during the insert
            SchemaError::Store(inner) => inner,
            other => DeliveryError::fatal(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("failed to commit partition {partition} up to offset {offset}: {source}")]
    Store {
        partition: i32,
        offset: i64,
        #[source]
        source: BoxError,
    },
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message has no payload")]
    Empty,
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is a json {0}, expected an object")]
    NotAnObject(&'static str),
}

/// Errors that stop a partition. Each variant carries what an operator needs
/// to resume by hand from the last committed offset.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("partition {partition} halted delivering offsets {first_offset}..={last_offset} (last committed: {last_committed:?}): {source}")]
    DeliveryHalted {
        partition: i32,
        first_offset: i64,
        last_offset: i64,
        last_committed: Option<i64>,
        #[source]
        source: DeliveryError,
    },
    #[error("partition {partition} gave up after {attempts} attempts delivering offsets {first_offset}..={last_offset} (last committed: {last_committed:?}): {source}")]
    RetriesExhausted {
        partition: i32,
        first_offset: i64,
        last_offset: i64,
        last_committed: Option<i64>,
        attempts: u32,
        #[source]
        source: DeliveryError,
    },
    #[error("partition {partition} gave up after {attempts} attempts committing offset {offset}: {source}")]
    CommitHalted {
        partition: i32,
        offset: i64,
        attempts: u32,
        #[source]
        source: CommitError,
    },
}

impl SinkError {
    /// The first and last offset of the batch that could not be completed.
    pub fn offset_range(&self) -> (i64, i64) {
        match self {
            SinkError::DeliveryHalted {
                first_offset,
                last_offset,
                ..
            }
            | SinkError::RetriesExhausted {
                first_offset,
                last_offset,
                ..
            } => (*first_offset, *last_offset),
            SinkError::CommitHalted { offset, .. } => (*offset, *offset),
        }
    }
}
