//! Error types for haversine-udf
//!
//! Every failure carries enough context to tell the user what to do next.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// haversine-udf error types
#[derive(Error, Debug)]
pub enum Error {
    /// Method identifier does not name any registered backend
    #[error("Unknown method '{method}'\nAvailable methods: {available}")]
    UnknownMethod {
        /// Identifier as supplied by the caller
        method: String,
        /// Comma separated list of selectable identifiers
        available: String,
    },

    /// Backend is known but its runtime prerequisite is missing on this host
    #[error("Backend '{method}' is unavailable on this host: {reason}")]
    BackendUnavailable {
        /// Method identifier
        method: String,
        /// Missing prerequisite (GPU adapter, JIT target, ABI version, ...)
        reason: String,
    },

    /// Compiled/JIT backend failed to build its artifact
    #[error("Compilation failed for backend '{method}': {reason}\nNo fallback backend is selected automatically.")]
    CompilationFailure {
        /// Method identifier
        method: String,
        /// Compiler diagnostic
        reason: String,
    },

    /// GPU memory allocation, transfer or dispatch failure
    #[error("GPU device error: {0}")]
    DeviceError(String),

    /// Input columns of one batch disagree on length
    #[error("Data shape error: {0}\nThe data source violated the equal-length column contract.")]
    DataShapeError(String),

    /// Input dataset does not match the coordinate-pair schema
    #[error("Schema error: {0}\nExpected Float64 columns x0, y0, x1, y1.")]
    SchemaError(String),

    /// Query parsing error
    #[error("SQL parse error: {0}")]
    ParseError(String),

    /// Storage error (Parquet/Arrow)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Invalid argument supplied to an engine operation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the error means "no such selectable backend"
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UnknownMethod { .. } | Self::BackendUnavailable { .. }
        )
    }

    /// Process exit code a harness should use for this error
    ///
    /// - `2`: method selection (unknown or unavailable backend)
    /// - `3`: input dataset (I/O, storage, schema)
    /// - `1`: everything else
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::UnknownMethod { .. } | Self::BackendUnavailable { .. } => 2,
            Self::Io(_) | Self::StorageError(_) | Self::SchemaError(_) => 3,
            _ => 1,
        }
    }
}
