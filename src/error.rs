//! Fatal setup errors. Per-query failures are `StoreError`s and never leave
//! the worker loop.

use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("worker count must be positive")]
    InvalidWorkers,

    #[error("run duration must be positive")]
    InvalidDuration,

    #[error("status interval must be positive")]
    InvalidStatusInterval,

    #[error("query-shape catalog is empty")]
    EmptyCatalog,

    #[error("unknown store engine: {0}")]
    UnknownEngine(String),

    #[error("unresolvable store descriptor: {0}")]
    Descriptor(#[source] StoreError),

    #[error("store probe failed: {0}")]
    Probe(#[source] StoreError),

    #[error("orchestrator has already run; create a new one per run")]
    AlreadyRun,

    #[error("config file {path}: {source}")]
    ConfigFile {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SetupResult<T> = std::result::Result<T, SetupError>;
