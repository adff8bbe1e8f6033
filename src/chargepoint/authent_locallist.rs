//! Local authorization list.
//!
//! Versioned list of idTags pushed by the central system through
//! SendLocalList. Version 0 means no list installed; updates are either a
//! full atomic replacement or a differential upsert/delete batch.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::OcppConfig;
use crate::messages::localauth::{GetLocalListVersionResponse, SendLocalListRequest, SendLocalListResponse};
use crate::messages::types::{AuthorizationData, IdTagInfo, UpdateStatus, UpdateType};
use crate::storage::{PersistentStore, TagRecord};

/// Internal-config key persisting the list version across boots.
pub const LOCAL_LIST_VERSION_KEY: &str = "LocalListVersion";

pub struct AuthentLocalList {
    ocpp_config: Arc<OcppConfig>,
    store: Arc<dyn PersistentStore>,
    version: AtomicI32,
}

impl AuthentLocalList {
    pub async fn new(ocpp_config: Arc<OcppConfig>, store: Arc<dyn PersistentStore>) -> Self {
        let version = match store.kv_get(LOCAL_LIST_VERSION_KEY).await {
            Ok(Some(value)) => value.parse().unwrap_or(0),
            Ok(None) => {
                if let Err(e) = store.kv_set(LOCAL_LIST_VERSION_KEY, "0").await {
                    error!(error = %e, "Could not initialize local list version");
                }
                0
            }
            Err(e) => {
                error!(error = %e, "Could not load local list version");
                0
            }
        };
        Self {
            ocpp_config,
            store,
            version: AtomicI32::new(version),
        }
    }

    pub fn version(&self) -> i32 {
        self.version.load(Ordering::SeqCst)
    }

    /// Look for a tag. Expired entries are reported absent but kept; only
    /// a list update removes them.
    pub async fn check(&self, id_tag: &str) -> Option<IdTagInfo> {
        let record = match self.store.local_list_get(id_tag).await {
            Ok(record) => record?,
            Err(e) => {
                error!(id_tag, error = %e, "Local list lookup failed");
                return None;
            }
        };
        if let Some(expiry) = record.expiry {
            if expiry < Utc::now() {
                return None;
            }
        }
        Some(IdTagInfo {
            expiry_date: record.expiry,
            parent_id_tag: record.parent_id_tag,
            status: record.status,
        })
    }

    pub async fn handle_get_local_list_version(&self) -> GetLocalListVersionResponse {
        let list_version = if self.ocpp_config.local_auth_list_enabled() {
            self.version()
        } else {
            -1
        };
        info!(list_version, "Local list version requested");
        GetLocalListVersionResponse { list_version }
    }

    pub async fn handle_send_local_list(&self, request: SendLocalListRequest) -> SendLocalListResponse {
        info!(
            list_version = request.list_version,
            update_type = ?request.update_type,
            "Local list update requested"
        );

        let status = self.apply_update(request).await;
        info!(?status, "Local list update status");
        SendLocalListResponse { status }
    }

    async fn apply_update(&self, request: SendLocalListRequest) -> UpdateStatus {
        if !self.ocpp_config.local_auth_list_enabled() {
            return UpdateStatus::NotSupported;
        }
        if request.list_version < 0 {
            return UpdateStatus::Failed;
        }

        let entries = request.local_authorization_list.unwrap_or_default();
        if entries.len() > self.ocpp_config.send_local_list_max_length() as usize {
            warn!(
                count = entries.len(),
                "Local list update exceeds SendLocalListMaxLength"
            );
            return UpdateStatus::Failed;
        }

        let applied = match request.update_type {
            UpdateType::Full => self.full_update(entries).await,
            UpdateType::Differential => {
                if request.list_version <= self.version() {
                    return UpdateStatus::VersionMismatch;
                }
                self.differential_update(entries).await
            }
        };

        if !applied {
            return UpdateStatus::Failed;
        }

        self.version.store(request.list_version, Ordering::SeqCst);
        if let Err(e) = self
            .store
            .kv_set(LOCAL_LIST_VERSION_KEY, &request.list_version.to_string())
            .await
        {
            error!(error = %e, "Unable to save local list version");
        }
        UpdateStatus::Accepted
    }

    async fn full_update(&self, entries: Vec<AuthorizationData>) -> bool {
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            // A full update must carry the authorization status of every tag.
            let Some(info) = entry.id_tag_info else {
                warn!(id_tag = entry.id_tag.as_str(), "Full update entry without idTagInfo");
                return false;
            };
            records.push(to_record(entry.id_tag, info));
        }
        match self.store.local_list_replace(records).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Full local list update failed");
                false
            }
        }
    }

    async fn differential_update(&self, entries: Vec<AuthorizationData>) -> bool {
        for entry in entries {
            let result = match entry.id_tag_info {
                Some(info) => {
                    self.store
                        .local_list_upsert(to_record(entry.id_tag, info))
                        .await
                }
                None => self.store.local_list_delete(&entry.id_tag).await,
            };
            if let Err(e) = result {
                error!(error = %e, "Differential local list update failed");
                return false;
            }
        }
        true
    }
}

fn to_record(id_tag: String, info: IdTagInfo) -> TagRecord {
    TagRecord {
        id_tag,
        parent_id_tag: info.parent_id_tag,
        expiry: info.expiry_date,
        status: info.status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::types::AuthorizationStatus;
    use crate::storage::InMemoryStore;

    async fn local_list() -> AuthentLocalList {
        AuthentLocalList::new(Arc::new(OcppConfig::new()), Arc::new(InMemoryStore::new())).await
    }

    fn entry(tag: &str, status: Option<AuthorizationStatus>) -> AuthorizationData {
        AuthorizationData {
            id_tag: tag.to_string(),
            id_tag_info: status.map(|status| IdTagInfo {
                expiry_date: None,
                parent_id_tag: None,
                status,
            }),
        }
    }

    fn request(
        version: i32,
        update_type: UpdateType,
        entries: Vec<AuthorizationData>,
    ) -> SendLocalListRequest {
        SendLocalListRequest {
            list_version: version,
            local_authorization_list: Some(entries),
            update_type,
        }
    }

    #[tokio::test]
    async fn full_update_replaces_and_sets_version() {
        let list = local_list().await;
        let response = list
            .handle_send_local_list(request(
                5,
                UpdateType::Full,
                vec![entry("A", Some(AuthorizationStatus::Accepted))],
            ))
            .await;
        assert_eq!(response.status, UpdateStatus::Accepted);
        assert_eq!(list.version(), 5);
        assert!(list.check("A").await.is_some());

        // A later full update may carry any version, even a lower one.
        let response = list
            .handle_send_local_list(request(
                3,
                UpdateType::Full,
                vec![entry("B", Some(AuthorizationStatus::Blocked))],
            ))
            .await;
        assert_eq!(response.status, UpdateStatus::Accepted);
        assert_eq!(list.version(), 3);
        assert!(list.check("A").await.is_none());
    }

    #[tokio::test]
    async fn full_update_requires_id_tag_info() {
        let list = local_list().await;
        let response = list
            .handle_send_local_list(request(1, UpdateType::Full, vec![entry("A", None)]))
            .await;
        assert_eq!(response.status, UpdateStatus::Failed);
        assert_eq!(list.version(), 0);
    }

    #[tokio::test]
    async fn differential_requires_newer_version() {
        let list = local_list().await;
        list.handle_send_local_list(request(
            5,
            UpdateType::Full,
            vec![entry("A", Some(AuthorizationStatus::Accepted))],
        ))
        .await;

        let response = list
            .handle_send_local_list(request(
                5,
                UpdateType::Differential,
                vec![entry("B", Some(AuthorizationStatus::Accepted))],
            ))
            .await;
        assert_eq!(response.status, UpdateStatus::VersionMismatch);

        let response = list
            .handle_send_local_list(request(
                6,
                UpdateType::Differential,
                vec![
                    entry("B", Some(AuthorizationStatus::Accepted)),
                    entry("A", None), // delete
                ],
            ))
            .await;
        assert_eq!(response.status, UpdateStatus::Accepted);
        assert_eq!(list.version(), 6);
        assert!(list.check("A").await.is_none());
        assert!(list.check("B").await.is_some());
    }

    #[tokio::test]
    async fn disabled_feature_reports_not_supported() {
        let list = local_list().await;
        list.ocpp_config
            .set_configuration("LocalAuthListEnabled", "false");
        let response = list
            .handle_send_local_list(request(
                1,
                UpdateType::Full,
                vec![entry("A", Some(AuthorizationStatus::Accepted))],
            ))
            .await;
        assert_eq!(response.status, UpdateStatus::NotSupported);
        assert_eq!(
            list.handle_get_local_list_version().await.list_version,
            -1
        );
    }

    #[tokio::test]
    async fn negative_version_fails() {
        let list = local_list().await;
        let response = list
            .handle_send_local_list(request(-2, UpdateType::Full, vec![]))
            .await;
        assert_eq!(response.status, UpdateStatus::Failed);
    }
}
