//! Authorization manager.
//!
//! Three-tier idTag lookup: local list, then cache, then an online
//! Authorize call, with offline fallback policies driven by the OCPP
//! configuration keys.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::authent_cache::AuthentCache;
use super::authent_locallist::AuthentLocalList;
use crate::config::OcppConfig;
use crate::messages::core::AuthorizeRequest;
use crate::messages::iso15118::Iso15118IdTokenInfo;
use crate::messages::types::{AuthorizationStatus, IdTagInfo};
use crate::rpc::{RpcClient, RpcError};

/// Online side of the authorization procedure.
#[async_trait]
pub trait RemoteAuthorizer: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn authorize(&self, id_tag: &str) -> Result<IdTagInfo, RpcError>;
}

#[async_trait]
impl RemoteAuthorizer for RpcClient {
    fn is_connected(&self) -> bool {
        RpcClient::is_connected(self)
    }

    async fn authorize(&self, id_tag: &str) -> Result<IdTagInfo, RpcError> {
        let response = self
            .call(&AuthorizeRequest {
                id_tag: id_tag.to_string(),
            })
            .await?;
        Ok(response.id_tag_info)
    }
}

pub struct AuthentManager {
    ocpp_config: Arc<OcppConfig>,
    cache: Arc<AuthentCache>,
    local_list: Arc<AuthentLocalList>,
    remote: Arc<dyn RemoteAuthorizer>,
}

impl AuthentManager {
    pub fn new(
        ocpp_config: Arc<OcppConfig>,
        cache: Arc<AuthentCache>,
        local_list: Arc<AuthentLocalList>,
        remote: Arc<dyn RemoteAuthorizer>,
    ) -> Self {
        Self {
            ocpp_config,
            cache,
            local_list,
            remote,
        }
    }

    /// Authorize an idTag. Returns the status and the parent idTag
    /// (empty when none).
    pub async fn authorize(&self, id_tag: &str) -> (AuthorizationStatus, String) {
        let mut is_connected = self.remote.is_connected();
        let mut parent_id = String::new();
        let mut status;

        loop {
            let mut retry = false;
            status = AuthorizationStatus::Invalid;
            let mut found: Option<IdTagInfo> = None;

            // Local data is consulted when pre-authorization is allowed
            // online, or offline authorization is allowed offline.
            let use_local = (is_connected && self.ocpp_config.local_pre_authorize())
                || (!is_connected && self.ocpp_config.local_authorize_offline());

            if use_local {
                if self.ocpp_config.local_auth_list_enabled() {
                    found = self.local_list.check(id_tag).await;
                    debug!(id_tag, found = found.is_some(), "Local list lookup");
                }

                if found.is_none() && self.ocpp_config.authorization_cache_enabled() {
                    let mut cached = self.cache.check(id_tag).await;
                    if let Some(info) = &cached {
                        if is_connected && info.status != AuthorizationStatus::Accepted {
                            // Not accepted locally: refresh the status online.
                            cached = None;
                        }
                    }
                    debug!(id_tag, found = cached.is_some(), "Cache lookup");
                    found = cached;
                }
            }

            match found {
                Some(info) => {
                    status = info.status;
                    parent_id = info.parent_id_tag.unwrap_or_default();
                }
                None if is_connected => {
                    debug!(id_tag, "Asking authorization to the central system");
                    match self.remote.authorize(id_tag).await {
                        Ok(info) => {
                            status = info.status;
                            parent_id = info.parent_id_tag.clone().unwrap_or_default();
                            self.update(id_tag, &info).await;
                        }
                        Err(e) => {
                            warn!(id_tag, error = %e, "No response to Authorize, using offline procedure");
                            is_connected = false;
                            retry = true;
                        }
                    }
                }
                None => {
                    if self.ocpp_config.allow_offline_tx_for_unknown_id() {
                        debug!(id_tag, "Unknown idTag accepted offline");
                        status = AuthorizationStatus::Accepted;
                        parent_id.clear();
                    }
                }
            }

            if !retry {
                break;
            }
        }

        info!(id_tag, ?status, "Authorization result");
        (status, parent_id)
    }

    /// Record an authorization result in the cache, unless the tag is
    /// governed by the local list.
    pub async fn update(&self, id_tag: &str, tag_info: &IdTagInfo) {
        if !self.ocpp_config.authorization_cache_enabled() {
            return;
        }
        let in_local_list = self.ocpp_config.local_auth_list_enabled()
            && self.local_list.check(id_tag).await.is_some();
        if !in_local_list {
            self.cache.update(id_tag, tag_info).await;
        }
    }

    /// ISO 15118 token authorization: local data only, no online call.
    pub async fn iso15118_authorize(&self, token_id: &str) -> AuthorizationStatus {
        let mut status = AuthorizationStatus::Invalid;

        if self.ocpp_config.local_authorize_offline() {
            let mut found = None;
            if self.ocpp_config.local_auth_list_enabled() {
                found = self.local_list.check(token_id).await;
            }
            if found.is_none() && self.ocpp_config.authorization_cache_enabled() {
                found = self.cache.check(token_id).await;
            }
            match found {
                Some(info) => status = info.status,
                None => {
                    if self.ocpp_config.allow_offline_tx_for_unknown_id() {
                        status = AuthorizationStatus::Accepted;
                    }
                }
            }
        }

        info!(token_id, ?status, "ISO 15118 authorization result");
        status
    }

    /// Record an ISO 15118 token authorization in the cache.
    pub async fn iso15118_update(&self, token_id: &str, token_info: &Iso15118IdTokenInfo) {
        let info = IdTagInfo {
            expiry_date: token_info.cache_expiry_date_time,
            parent_id_tag: None,
            status: token_info.status,
        };
        self.update(token_id, &info).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeRemote {
        connected: AtomicBool,
        responses: std::sync::Mutex<Vec<Result<IdTagInfo, RpcError>>>,
        calls: AtomicUsize,
    }

    impl FakeRemote {
        fn new(connected: bool) -> Self {
            Self {
                connected: AtomicBool::new(connected),
                responses: std::sync::Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn push(&self, response: Result<IdTagInfo, RpcError>) {
            self.responses.lock().unwrap().push(response);
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteAuthorizer for FakeRemote {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn authorize(&self, _id_tag: &str) -> Result<IdTagInfo, RpcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(RpcError::Timeout)
            } else {
                responses.remove(0)
            }
        }
    }

    struct Fixture {
        manager: AuthentManager,
        remote: Arc<FakeRemote>,
        config: Arc<OcppConfig>,
        local_list: Arc<AuthentLocalList>,
    }

    async fn fixture(connected: bool) -> Fixture {
        let config = Arc::new(OcppConfig::new());
        config.set_configuration("LocalPreAuthorize", "true");
        let store: Arc<dyn crate::storage::PersistentStore> = Arc::new(InMemoryStore::new());
        let cache = Arc::new(AuthentCache::new(config.clone(), store.clone(), 100));
        let local_list = Arc::new(AuthentLocalList::new(config.clone(), store.clone()).await);
        let remote = Arc::new(FakeRemote::new(connected));
        let manager = AuthentManager::new(
            config.clone(),
            cache,
            local_list.clone(),
            remote.clone(),
        );
        Fixture {
            manager,
            remote,
            config,
            local_list,
        }
    }

    async fn seed_local_list(fixture: &Fixture, tag: &str, status: AuthorizationStatus) {
        use crate::messages::localauth::SendLocalListRequest;
        use crate::messages::types::{AuthorizationData, UpdateType};
        fixture
            .local_list
            .handle_send_local_list(SendLocalListRequest {
                list_version: 1,
                update_type: UpdateType::Full,
                local_authorization_list: Some(vec![AuthorizationData {
                    id_tag: tag.to_string(),
                    id_tag_info: Some(IdTagInfo {
                        expiry_date: None,
                        parent_id_tag: None,
                        status,
                    }),
                }]),
            })
            .await;
    }

    #[tokio::test]
    async fn local_list_hit_avoids_wire_traffic() {
        let fixture = fixture(true).await;
        seed_local_list(&fixture, "TAG1", AuthorizationStatus::Accepted).await;

        let (status, _) = fixture.manager.authorize("TAG1").await;
        assert_eq!(status, AuthorizationStatus::Accepted);
        assert_eq!(fixture.remote.call_count(), 0);
    }

    #[tokio::test]
    async fn online_result_is_cached_for_next_lookup() {
        let fixture = fixture(true).await;
        fixture.remote.push(Ok(IdTagInfo {
            expiry_date: None,
            parent_id_tag: Some("P".into()),
            status: AuthorizationStatus::Accepted,
        }));

        let (status, parent) = fixture.manager.authorize("TAG2").await;
        assert_eq!(status, AuthorizationStatus::Accepted);
        assert_eq!(parent, "P");
        assert_eq!(fixture.remote.call_count(), 1);

        // Second lookup: served from the cache, no wire traffic.
        let (status, parent) = fixture.manager.authorize("TAG2").await;
        assert_eq!(status, AuthorizationStatus::Accepted);
        assert_eq!(parent, "P");
        assert_eq!(fixture.remote.call_count(), 1);
    }

    #[tokio::test]
    async fn timeout_falls_back_to_offline_procedure() {
        let fixture = fixture(true).await;
        fixture.remote.push(Err(RpcError::Timeout));
        fixture
            .config
            .set_configuration("AllowOfflineTxForUnknownId", "true");

        let (status, _) = fixture.manager.authorize("TAG3").await;
        assert_eq!(status, AuthorizationStatus::Accepted);
        assert_eq!(fixture.remote.call_count(), 1);
    }

    #[tokio::test]
    async fn offline_unknown_tag_rejected_by_default() {
        let fixture = fixture(false).await;
        let (status, _) = fixture.manager.authorize("NOBODY").await;
        assert_eq!(status, AuthorizationStatus::Invalid);
        assert_eq!(fixture.remote.call_count(), 0);
    }

    #[tokio::test]
    async fn non_accepted_cache_entry_refreshed_online() {
        let fixture = fixture(true).await;
        // First answer blocks the tag; it lands in the cache.
        fixture.remote.push(Ok(IdTagInfo {
            expiry_date: None,
            parent_id_tag: None,
            status: AuthorizationStatus::Blocked,
        }));
        let (status, _) = fixture.manager.authorize("TAG4").await;
        assert_eq!(status, AuthorizationStatus::Blocked);

        // While connected, a blocked cache entry triggers an online refresh.
        fixture.remote.push(Ok(IdTagInfo {
            expiry_date: None,
            parent_id_tag: None,
            status: AuthorizationStatus::Accepted,
        }));
        let (status, _) = fixture.manager.authorize("TAG4").await;
        assert_eq!(status, AuthorizationStatus::Accepted);
        assert_eq!(fixture.remote.call_count(), 2);
    }

    #[tokio::test]
    async fn local_list_tag_never_enters_cache() {
        let fixture = fixture(true).await;
        seed_local_list(&fixture, "LISTED", AuthorizationStatus::Accepted).await;
        fixture
            .manager
            .update("LISTED", &IdTagInfo::accepted())
            .await;
        assert!(fixture.manager.cache.check("LISTED").await.is_none());
    }
}
