//! Authorization cache.
//!
//! Bounded store of idTag authorizations learned online. Expired entries
//! are treated as absent and removed on lookup; insertion beyond the bound
//! evicts the oldest entry.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error};

use crate::config::OcppConfig;
use crate::messages::types::{AuthorizationStatus, ClearCacheStatus, IdTagInfo};
use crate::storage::{PersistentStore, TagRecord};

pub struct AuthentCache {
    ocpp_config: Arc<OcppConfig>,
    store: Arc<dyn PersistentStore>,
    max_entries: usize,
}

impl AuthentCache {
    pub fn new(
        ocpp_config: Arc<OcppConfig>,
        store: Arc<dyn PersistentStore>,
        max_entries: usize,
    ) -> Self {
        Self {
            ocpp_config,
            store,
            max_entries,
        }
    }

    /// Look for a tag, dropping it when expired.
    pub async fn check(&self, id_tag: &str) -> Option<IdTagInfo> {
        let record = match self.store.cache_get(id_tag).await {
            Ok(record) => record?,
            Err(e) => {
                error!(id_tag, error = %e, "Cache lookup failed");
                return None;
            }
        };

        if let Some(expiry) = record.expiry {
            if expiry < Utc::now() {
                debug!(id_tag, "Cache entry expired, deleting");
                if let Err(e) = self.store.cache_delete(id_tag).await {
                    error!(id_tag, error = %e, "Could not delete expired cache entry");
                }
                return None;
            }
        }

        Some(IdTagInfo {
            expiry_date: record.expiry,
            parent_id_tag: record.parent_id_tag,
            status: record.status,
        })
    }

    /// Insert or refresh a tag. `ConcurrentTx` is normalized to `Accepted`
    /// since concurrency is a property of the transaction, not the tag.
    pub async fn update(&self, id_tag: &str, tag_info: &IdTagInfo) {
        let status = match tag_info.status {
            AuthorizationStatus::ConcurrentTx => AuthorizationStatus::Accepted,
            other => other,
        };
        let record = TagRecord {
            id_tag: id_tag.to_string(),
            parent_id_tag: tag_info.parent_id_tag.clone(),
            expiry: tag_info.expiry_date,
            status,
        };
        if let Err(e) = self.store.cache_upsert(record).await {
            error!(id_tag, error = %e, "Could not update cache entry");
            return;
        }
        debug!(id_tag, "Cache entry updated");

        // Keep the cache within its bound.
        loop {
            match self.store.cache_len().await {
                Ok(len) if len > self.max_entries => {
                    if let Err(e) = self.store.cache_evict_oldest().await {
                        error!(error = %e, "Cache eviction failed");
                        break;
                    }
                }
                Ok(_) => break,
                Err(e) => {
                    error!(error = %e, "Cache size query failed");
                    break;
                }
            }
        }
    }

    pub async fn clear(&self) {
        if let Err(e) = self.store.cache_clear().await {
            error!(error = %e, "Could not clear cache");
        }
    }

    /// ClearCache request: rejected when the cache feature is disabled.
    pub async fn handle_clear_cache(&self) -> ClearCacheStatus {
        if self.ocpp_config.authorization_cache_enabled() {
            self.clear().await;
            ClearCacheStatus::Accepted
        } else {
            ClearCacheStatus::Rejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use chrono::Duration;

    fn cache(max_entries: usize) -> AuthentCache {
        AuthentCache::new(
            Arc::new(OcppConfig::new()),
            Arc::new(InMemoryStore::new()),
            max_entries,
        )
    }

    fn accepted() -> IdTagInfo {
        IdTagInfo::accepted()
    }

    #[tokio::test]
    async fn expired_entries_are_absent_and_deleted() {
        let cache = cache(10);
        let expired = IdTagInfo {
            expiry_date: Some(Utc::now() - Duration::minutes(1)),
            parent_id_tag: None,
            status: AuthorizationStatus::Accepted,
        };
        cache.update("TAG", &expired).await;
        assert!(cache.check("TAG").await.is_none());
        // Deleted, not just filtered.
        assert!(cache.store.cache_get("TAG").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_tx_normalized_to_accepted() {
        let cache = cache(10);
        let info = IdTagInfo {
            expiry_date: None,
            parent_id_tag: None,
            status: AuthorizationStatus::ConcurrentTx,
        };
        cache.update("TAG", &info).await;
        let cached = cache.check("TAG").await.unwrap();
        assert_eq!(cached.status, AuthorizationStatus::Accepted);
    }

    #[tokio::test]
    async fn bound_is_enforced() {
        let cache = cache(2);
        cache.update("A", &accepted()).await;
        cache.update("B", &accepted()).await;
        cache.update("C", &accepted()).await;
        assert_eq!(cache.store.cache_len().await.unwrap(), 2);
        assert!(cache.check("A").await.is_none());
        assert!(cache.check("C").await.is_some());
    }

    #[tokio::test]
    async fn clear_cache_respects_feature_flag() {
        let cache = cache(10);
        cache.update("A", &accepted()).await;
        assert_eq!(cache.handle_clear_cache().await, ClearCacheStatus::Accepted);
        assert!(cache.check("A").await.is_none());

        cache
            .ocpp_config
            .set_configuration("AuthorizationCacheEnabled", "false");
        assert_eq!(cache.handle_clear_cache().await, ClearCacheStatus::Rejected);
    }
}
