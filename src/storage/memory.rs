//! In-memory store for development and testing.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{PersistentStore, StorageResult, TagRecord};
use crate::messages::types::ChargingProfile;

/// Cache entry plus its insertion sequence number, the FIFO eviction key.
struct CacheSlot {
    record: TagRecord,
    inserted_at: u64,
}

#[derive(Default)]
pub struct InMemoryStore {
    cache: DashMap<String, CacheSlot>,
    local_list: DashMap<String, TagRecord>,
    profiles: DashMap<i32, (u32, ChargingProfile)>,
    kv: DashMap<String, String>,
    insert_counter: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for InMemoryStore {
    async fn cache_get(&self, id_tag: &str) -> StorageResult<Option<TagRecord>> {
        Ok(self.cache.get(id_tag).map(|slot| slot.record.clone()))
    }

    async fn cache_upsert(&self, record: TagRecord) -> StorageResult<()> {
        // An update keeps the original insertion order, like a SQL UPDATE
        // keeps the autoincrement key.
        let inserted_at = self
            .cache
            .get(&record.id_tag)
            .map(|slot| slot.inserted_at)
            .unwrap_or_else(|| self.insert_counter.fetch_add(1, Ordering::SeqCst));
        self.cache.insert(
            record.id_tag.clone(),
            CacheSlot {
                record,
                inserted_at,
            },
        );
        Ok(())
    }

    async fn cache_delete(&self, id_tag: &str) -> StorageResult<()> {
        self.cache.remove(id_tag);
        Ok(())
    }

    async fn cache_clear(&self) -> StorageResult<()> {
        self.cache.clear();
        Ok(())
    }

    async fn cache_len(&self) -> StorageResult<usize> {
        Ok(self.cache.len())
    }

    async fn cache_evict_oldest(&self) -> StorageResult<()> {
        let oldest = self
            .cache
            .iter()
            .min_by_key(|slot| slot.inserted_at)
            .map(|slot| slot.key().clone());
        if let Some(key) = oldest {
            self.cache.remove(&key);
        }
        Ok(())
    }

    async fn local_list_get(&self, id_tag: &str) -> StorageResult<Option<TagRecord>> {
        Ok(self.local_list.get(id_tag).map(|r| r.clone()))
    }

    async fn local_list_replace(&self, records: Vec<TagRecord>) -> StorageResult<()> {
        self.local_list.clear();
        for record in records {
            self.local_list.insert(record.id_tag.clone(), record);
        }
        Ok(())
    }

    async fn local_list_upsert(&self, record: TagRecord) -> StorageResult<()> {
        self.local_list.insert(record.id_tag.clone(), record);
        Ok(())
    }

    async fn local_list_delete(&self, id_tag: &str) -> StorageResult<()> {
        self.local_list.remove(id_tag);
        Ok(())
    }

    async fn local_list_len(&self) -> StorageResult<usize> {
        Ok(self.local_list.len())
    }

    async fn profiles_load(&self) -> StorageResult<Vec<(u32, ChargingProfile)>> {
        Ok(self
            .profiles
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn profiles_store(
        &self,
        connector_id: u32,
        profile: ChargingProfile,
    ) -> StorageResult<()> {
        self.profiles
            .insert(profile.charging_profile_id, (connector_id, profile));
        Ok(())
    }

    async fn profiles_delete(&self, charging_profile_id: i32) -> StorageResult<()> {
        self.profiles.remove(&charging_profile_id);
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.kv.get(key).map(|v| v.clone()))
    }

    async fn kv_set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::types::AuthorizationStatus;

    fn record(tag: &str) -> TagRecord {
        TagRecord {
            id_tag: tag.to_string(),
            parent_id_tag: None,
            expiry: None,
            status: AuthorizationStatus::Accepted,
        }
    }

    #[tokio::test]
    async fn cache_eviction_is_fifo() {
        let store = InMemoryStore::new();
        store.cache_upsert(record("A")).await.unwrap();
        store.cache_upsert(record("B")).await.unwrap();
        store.cache_upsert(record("C")).await.unwrap();

        // Updating A must not refresh its insertion order.
        store.cache_upsert(record("A")).await.unwrap();

        store.cache_evict_oldest().await.unwrap();
        assert!(store.cache_get("A").await.unwrap().is_none());
        assert!(store.cache_get("B").await.unwrap().is_some());
        assert!(store.cache_get("C").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn local_list_replace_is_atomic_swap() {
        let store = InMemoryStore::new();
        store.local_list_upsert(record("OLD")).await.unwrap();
        store
            .local_list_replace(vec![record("N1"), record("N2")])
            .await
            .unwrap();
        assert!(store.local_list_get("OLD").await.unwrap().is_none());
        assert_eq!(store.local_list_len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn kv_roundtrip() {
        let store = InMemoryStore::new();
        assert!(store.kv_get("LocalListVersion").await.unwrap().is_none());
        store.kv_set("LocalListVersion", "3").await.unwrap();
        assert_eq!(
            store.kv_get("LocalListVersion").await.unwrap().as_deref(),
            Some("3")
        );
    }
}
