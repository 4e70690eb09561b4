//! Infrastructure layer for the relay
//!
//! Adapters for the collaborators the core only sees through traits:
//! mapping lookup, exchange persistence and session verification.

pub mod database;
pub mod log_messages;
pub mod log_store;
pub mod mapping_store;
pub mod session;

pub use database::Database;
pub use log_store::{InMemoryLogStore, LogStore, PostgresLogStore};
pub use mapping_store::{InMemoryMappingStore, MappingStore, PostgresMappingStore};
pub use session::{HttpSessionValidator, SessionError, SessionIdentity, SessionValidator, StaticSessionValidator};

use thiserror::Error;

/// Failures of a backing store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stored row is invalid: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for crate::proxy::ProxyError {
    fn from(error: StoreError) -> Self {
        Self::StoreUnavailable(error.to_string())
    }
}
