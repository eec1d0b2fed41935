use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorelockError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Unknown prover: {0}")]
    UnknownProver(String),

    #[error("Invalid regex for prover {prover}: {source}")]
    ProverRegex {
        prover: String,
        #[source]
        source: regex::Error,
    },

    #[error("Expected result not found in {0}")]
    ExpectNotFound(PathBuf),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Daemon rejected the acquire request")]
    Rejected,

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(uuid::Uuid),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CorelockError>;
