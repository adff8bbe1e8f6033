//! Durable-state abstraction.
//!
//! The runtime persists four tables: the authorization cache, the local
//! authorization list, the installed charging profiles and an internal
//! key-value config. Embedders may plug a database-backed implementation;
//! the bundled [`InMemoryStore`] keeps everything in process memory, which
//! is also what the tests run against.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::messages::types::{AuthorizationStatus, ChargingProfile};

pub use memory::InMemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Row of the authorization cache and local list tables.
#[derive(Debug, Clone, PartialEq)]
pub struct TagRecord {
    pub id_tag: String,
    pub parent_id_tag: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub status: AuthorizationStatus,
}

/// Persistence operations required by the role runtimes.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    // Authorization cache
    async fn cache_get(&self, id_tag: &str) -> StorageResult<Option<TagRecord>>;
    async fn cache_upsert(&self, record: TagRecord) -> StorageResult<()>;
    async fn cache_delete(&self, id_tag: &str) -> StorageResult<()>;
    async fn cache_clear(&self) -> StorageResult<()>;
    async fn cache_len(&self) -> StorageResult<usize>;
    /// Drop the oldest-inserted entry. Eviction is FIFO by insertion.
    async fn cache_evict_oldest(&self) -> StorageResult<()>;

    // Local authorization list
    async fn local_list_get(&self, id_tag: &str) -> StorageResult<Option<TagRecord>>;
    async fn local_list_replace(&self, records: Vec<TagRecord>) -> StorageResult<()>;
    async fn local_list_upsert(&self, record: TagRecord) -> StorageResult<()>;
    async fn local_list_delete(&self, id_tag: &str) -> StorageResult<()>;
    async fn local_list_len(&self) -> StorageResult<usize>;

    // Charging profiles, keyed by (connector id, profile)
    async fn profiles_load(&self) -> StorageResult<Vec<(u32, ChargingProfile)>>;
    async fn profiles_store(&self, connector_id: u32, profile: ChargingProfile)
        -> StorageResult<()>;
    async fn profiles_delete(&self, charging_profile_id: i32) -> StorageResult<()>;

    // Internal key-value config (list version, boot counters, uptime)
    async fn kv_get(&self, key: &str) -> StorageResult<Option<String>>;
    async fn kv_set(&self, key: &str, value: &str) -> StorageResult<()>;
}
