// sampledb-core/src/error.rs
// Error types shared by every module of the core

use thiserror::Error;

/// Errors raised by the query, aggregation and batching core
#[derive(Debug, Error)]
pub enum SampleDbError {
    /// Root field of a path is not declared and missing fields are not allowed
    #[error("Unknown field '{0}'")]
    UnknownField(String),

    /// A value failed validation against the declared type of a field
    #[error("Field '{field}' expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    /// Mutation attempted on a protected field
    #[error("Field '{0}' is read-only")]
    ReadOnlyField(String),

    /// Index spec mixes frame-level and sample-level fields
    #[error("Compound index cannot mix frame fields and sample fields: {0:?}")]
    UnsupportedCompoundIndex(Vec<String>),

    /// `next()` was called on a content-size batcher without reporting the
    /// size of the previous batch first
    #[error("Backpressure for the previous batch must be registered before requesting the next batch")]
    BackpressureContractViolation,

    /// Unrecognized sharding policy
    #[error("Unsupported shard policy '{0}'; expected 'slice' or 'id'")]
    ShardPolicy(String),

    /// A path is syntactically valid but not legal for this collection
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// A view stage could not be appended
    #[error("Invalid stage {stage}: {reason}")]
    InvalidStage { stage: String, reason: String },

    /// A shard worker panicked
    #[error("Shard worker {0} panicked")]
    ShardWorker(usize),

    #[error("Aggregation error: {0}")]
    AggregationError(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persisted catalog failed its magic or checksum test
    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write failures reported by a store's bulk-write primitive
///
/// `applied` is the number of leading operations of an ordered batch that
/// were committed before the failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MutationError {
    /// `$push`/`$addToSet` targeted a field whose stored value is null
    #[error("Cannot add to field '{path}' because it is null (operation {applied})")]
    NullArrayField { path: String, applied: usize },

    /// `$push`/`$addToSet` targeted a field that holds a non-array value
    #[error("Field '{path}' is not an array (operation {applied})")]
    NotAnArray { path: String, applied: usize },

    #[error("Write failed after {applied} operations: {reason}")]
    WriteFailed { reason: String, applied: usize },
}

impl MutationError {
    /// Number of operations committed before the failure
    pub fn applied(&self) -> usize {
        match self {
            MutationError::NullArrayField { applied, .. }
            | MutationError::NotAnArray { applied, .. }
            | MutationError::WriteFailed { applied, .. } => *applied,
        }
    }

    /// Shift `applied` by the operations of a batch that preceded this one
    pub fn offset_by(self, preceding: usize) -> Self {
        match self {
            MutationError::NullArrayField { path, applied } => MutationError::NullArrayField {
                path,
                applied: applied + preceding,
            },
            MutationError::NotAnArray { path, applied } => MutationError::NotAnArray {
                path,
                applied: applied + preceding,
            },
            MutationError::WriteFailed { reason, applied } => MutationError::WriteFailed {
                reason,
                applied: applied + preceding,
            },
        }
    }
}

impl From<serde_json::Error> for SampleDbError {
    fn from(err: serde_json::Error) -> Self {
        SampleDbError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for SampleDbError {
    fn from(err: bincode::Error) -> Self {
        SampleDbError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SampleDbError>;
