use thiserror::Error;

use crate::manifest::DumpId;
use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy surfaced to the command layer. Adapters report raw
/// transport errors; the registry and resolver translate them into one
/// of these kinds before they reach `main`, which only maps kinds to
/// exit codes and messages.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage or database unreachable: {0}")]
    Connectivity(String),

    #[error("identifier collision on '{0}' after retry; id generator may be defective")]
    IdentifierCollision(DumpId),

    #[error("dump not found: '{0}'")]
    NotFound(String),

    #[error("dump '{0}' is not complete; its stash may have failed mid-upload")]
    IncompleteArtifact(DumpId),

    #[error("dump '{id}' is corrupt: manifest checksum {expected} does not match payload checksum {actual}")]
    CorruptArtifact {
        id: DumpId,
        expected: String,
        actual: String,
    },

    #[error("target database '{0}' is not empty; refusing to load over existing data")]
    TargetNotEmpty(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("load failed: {0}")]
    Load(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Stable process exit code for each error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Storage(_) => 1,
            Error::Configuration(_) => 2,
            Error::Connectivity(_) => 3,
            Error::IdentifierCollision(_) => 4,
            Error::NotFound(_) => 5,
            Error::IncompleteArtifact(_) => 6,
            Error::CorruptArtifact { .. } => 7,
            Error::TargetNotEmpty(_) => 8,
            Error::Extraction(_) => 9,
            Error::Load(_) => 10,
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => Error::NotFound(key),
            StorageError::Unreachable(msg) => Error::Connectivity(msg),
            StorageError::InvalidBucket(msg) => Error::Configuration(msg),
            StorageError::Io(msg) => Error::Storage(msg),
        }
    }
}
