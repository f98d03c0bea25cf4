//! Store abstraction: trait, types, and builder factory.

pub mod config;
#[cfg(any(test, feature = "store-mock"))]
pub mod mock;
#[cfg(feature = "store-mongodb")]
pub mod mongodb;

use crate::query::QuerySpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type WorkerId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    MongoDb,
    #[cfg(any(test, feature = "store-mock"))]
    Mock,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::MongoDb => f.write_str("mongodb"),
            #[cfg(any(test, feature = "store-mock"))]
            Engine::Mock => f.write_str("mock"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub params: BTreeMap<String, String>,
}

impl ConnectOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Opaque address/credential bundle for the store under test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub engine: Engine,
    #[serde(default)]
    pub options: ConnectOptions,
}

impl StoreDescriptor {
    pub fn new(engine: Engine, options: ConnectOptions) -> Self {
        Self { engine, options }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("timeout")]
    Timeout,
    #[error("query: {0}")]
    Query(String),
    #[error("other: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Disconnected(_) | Self::Timeout)
    }
}

/// Outcome of classifying a failed query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection or network trouble: the worker replaces its connection.
    Connection,
    /// Anything else: counted and otherwise ignored.
    Query,
}

/// What a successful query returned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryOutcome {
    pub documents: u64,
}

/// One live connection owned by exactly one worker.
#[async_trait::async_trait]
pub trait Connection: Send {
    async fn execute(&mut self, spec: &QuerySpec) -> Result<QueryOutcome, StoreError>;
    async fn ping(&mut self) -> Result<(), StoreError>;
    async fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// Connection factory plus the policy deciding which failures are
/// connection-related.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, worker_id: WorkerId) -> Result<Box<dyn Connection>, StoreError>;

    fn classify(&self, err: &StoreError) -> ErrorClass {
        if err.is_recoverable() {
            ErrorClass::Connection
        } else {
            ErrorClass::Query
        }
    }
}

pub struct StoreBuilder;

impl StoreBuilder {
    pub fn open(descriptor: &StoreDescriptor) -> Result<Arc<dyn Store>, StoreError> {
        match descriptor.engine {
            Engine::MongoDb => {
                #[cfg(feature = "store-mongodb")]
                {
                    crate::store::mongodb::open(&descriptor.options)
                }
                #[cfg(not(feature = "store-mongodb"))]
                {
                    Err(StoreError::Connect("mongodb feature disabled".into()))
                }
            }
            #[cfg(any(test, feature = "store-mock"))]
            Engine::Mock => crate::store::mock::open(&descriptor.options),
        }
    }
}
