//! Error types for sbt-core.

use thiserror::Error;

/// Top-level error type for tree operations.
#[derive(Debug, Error)]
pub enum SbtError {
    /// A persisted tree with no leaves is not a valid tree.
    #[error("structural error: tree has no leaves")]
    EmptyTree,

    /// An internal node is missing the `min_n_below` metadata required to
    /// bound similarity scores. The tree needs a repair pass.
    #[error("structural error: node '{0}' has no min_n_below metadata, run a repair pass")]
    MissingMinNBelow(String),

    /// A node or leaf payload was requested but no storage is attached.
    #[error("storage error: no storage attached for '{0}'")]
    NoStorage(String),

    /// Storage backend could not find the requested key.
    #[error("storage error: key '{0}' not found")]
    NotFound(String),

    /// The description file names a storage backend this build does not know.
    #[error("storage error: unknown backend '{0}'")]
    UnknownBackend(String),

    /// Loaded factory configuration conflicts with the one supplied.
    #[error("configuration error: factory mismatch (loaded {loaded:?}, expected {expected:?})")]
    FactoryMismatch {
        /// Configuration found in the description file.
        loaded: (u32, usize, usize),
        /// Configuration the caller asked for.
        expected: (u32, usize, usize),
    },

    /// The description file carries a version tag we cannot parse.
    #[error("unsupported tree format version {0}")]
    UnsupportedVersion(u32),

    /// The description file does not match any known layout.
    #[error("unrecognized tree description file")]
    UnrecognizedFormat,

    /// I/O error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Binary payload encoding/decoding error.
    #[error("payload codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Result type for tree operations.
pub type Result<T> = std::result::Result<T, SbtError>;
