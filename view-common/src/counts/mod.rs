//! # Counts
//!
//! The durable, authoritative view count per entity. Counts only ever move by
//! an additive delta so a retried flush can never overwrite concurrent writes.
use async_trait::async_trait;
use thiserror::Error;

use crate::event::EntityType;

mod memory;
mod postgres;

pub use self::memory::MemoryCountStore;
pub use self::postgres::{CountTables, PgCountStore};

#[derive(Error, Debug)]
pub enum CountStoreError {
    #[error("{entity_type} {entity_id} does not exist")]
    EntityNotFound {
        entity_type: EntityType,
        entity_id: String,
    },
    #[error("{0:?} is not a valid SQL identifier")]
    InvalidIdentifier(String),
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("durable write did not finish in time")]
    Timeout,
    #[error("count store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CountStore: Send + Sync {
    /// Atomically add `delta` to the stored view count of one entity.
    async fn add_views(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        delta: i64,
    ) -> Result<(), CountStoreError>;
}
