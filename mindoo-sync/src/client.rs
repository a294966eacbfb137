//! Sync client: authenticated, retrying access to a remote peer.
//!
//! Transport failures and timeouts retry with exponential backoff
//! (`retry_delay_ms * 2^k`, up to `retry_attempts`); `InvalidToken`,
//! `UserRevoked` and `InvalidSignature` never retry. Dropping an in-flight
//! call cancels it.

use std::sync::Arc;
use std::time::Duration;

use mindoo_core::Tenant;
use mindoo_crypto::{sign, RsaPrivateKey, SigningKey};
use mindoo_store::{
    BloomSummary, CompactionStatus, EntryType, ResolveOptions, ScanFilters, ScanPage, StoreEntry,
    StoreEntryMetadata,
};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::SyncError;
use crate::wire::*;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct SyncClientConfig {
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout: Duration,
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 500,
            timeout: Duration::from_millis(30_000),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    tenant_id: String,
    username: String,
    signing_key: Arc<SigningKey>,
    encryption_key: Arc<RsaPrivateKey>,
    config: SyncClientConfig,
    token: RwLock<Option<String>>,
}

impl SyncClient {
    pub fn new(
        base_url: impl Into<String>,
        tenant_id: impl Into<String>,
        username: impl Into<String>,
        signing_key: Arc<SigningKey>,
        encryption_key: Arc<RsaPrivateKey>,
    ) -> Self {
        Self::with_config(
            base_url,
            tenant_id,
            username,
            signing_key,
            encryption_key,
            SyncClientConfig::default(),
        )
    }

    pub fn with_config(
        base_url: impl Into<String>,
        tenant_id: impl Into<String>,
        username: impl Into<String>,
        signing_key: Arc<SigningKey>,
        encryption_key: Arc<RsaPrivateKey>,
        config: SyncClientConfig,
    ) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http: reqwest::Client::new(),
            base_url,
            tenant_id: tenant_id.into(),
            username: username.into(),
            signing_key,
            encryption_key,
            config,
            token: RwLock::new(None),
        }
    }

    /// Build a client for the tenant's signed-in user.
    pub fn for_tenant(tenant: &Tenant, base_url: impl Into<String>) -> Result<Self, SyncError> {
        Ok(Self::new(
            base_url,
            tenant.tenant_id(),
            tenant.current_user().username(),
            tenant.current_user().signing_key()?,
            tenant.current_user().encryption_key()?,
        ))
    }

    fn scope(&self, db_id: &str) -> Scope {
        Scope {
            tenant_id: self.tenant_id.clone(),
            db_id: db_id.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------

    /// Run the challenge/response flow and cache the returned token.
    pub async fn authenticate(&self) -> Result<(), SyncError> {
        let challenge: ChallengeResponse = self
            .request(
                Method::POST,
                "/auth/challenge",
                Some(&ChallengeRequest {
                    username: self.username.clone(),
                }),
                false,
            )
            .await?;

        let signature = sign::sign(&self.signing_key, challenge.challenge.as_bytes());
        let response: AuthenticateResponse = self
            .request(
                Method::POST,
                "/auth/authenticate",
                Some(&AuthenticateRequest {
                    challenge: challenge.challenge,
                    signature,
                }),
                false,
            )
            .await?;

        if !response.success {
            return Err(named_error(response.error.as_deref().unwrap_or("ServerError")));
        }
        let token = response
            .token
            .ok_or_else(|| SyncError::Server("authenticate returned no token".into()))?;
        *self.token.write().await = Some(token);
        Ok(())
    }

    async fn ensure_token(&self) -> Result<(), SyncError> {
        if self.token.read().await.is_some() {
            return Ok(());
        }
        self.authenticate().await
    }

    // -----------------------------------------------------------------------
    // Capabilities
    // -----------------------------------------------------------------------

    /// Negotiate capabilities; a server without the endpoint is assumed to
    /// speak the legacy protocol.
    pub async fn get_capabilities(
        &self,
        db_id: &str,
    ) -> Result<NetworkSyncCapabilities, SyncError> {
        let path = format!("/sync/capabilities?dbId={}", db_id);
        match self
            .request::<(), CapabilitiesResponse>(Method::GET, &path, None, false)
            .await
        {
            Ok(response) => Ok(response.capabilities),
            Err(SyncError::UserNotFound) => Ok(NetworkSyncCapabilities::legacy()),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Data plane
    // -----------------------------------------------------------------------

    pub async fn find_new_entries(
        &self,
        db_id: &str,
        have_ids: &[String],
    ) -> Result<Vec<StoreEntryMetadata>, SyncError> {
        let response: EntryMetadataResponse = self
            .authed_post(
                "/sync/findNewEntries",
                &FindNewEntriesRequest {
                    scope: self.scope(db_id),
                    have_ids: have_ids.to_vec(),
                },
            )
            .await?;
        Ok(response.entries)
    }

    pub async fn find_new_entries_for_doc(
        &self,
        db_id: &str,
        have_ids: &[String],
        doc_id: &str,
    ) -> Result<Vec<StoreEntryMetadata>, SyncError> {
        let response: EntryMetadataResponse = self
            .authed_post(
                "/sync/findNewEntriesForDoc",
                &FindNewEntriesForDocRequest {
                    scope: self.scope(db_id),
                    have_ids: have_ids.to_vec(),
                    doc_id: doc_id.to_string(),
                },
            )
            .await?;
        Ok(response.entries)
    }

    pub async fn find_entries(
        &self,
        db_id: &str,
        entry_type: EntryType,
        from_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<StoreEntryMetadata>, SyncError> {
        let response: EntryMetadataResponse = self
            .authed_post(
                "/sync/findEntries",
                &FindEntriesRequest {
                    scope: self.scope(db_id),
                    entry_type,
                    creation_date_from: from_ms,
                    creation_date_until: until_ms,
                },
            )
            .await?;
        Ok(response.entries)
    }

    pub async fn scan_entries_since(
        &self,
        db_id: &str,
        cursor: Option<&str>,
        limit: usize,
        filters: Option<&ScanFilters>,
    ) -> Result<ScanPage, SyncError> {
        let response: ScanEntriesSinceResponse = self
            .authed_post(
                "/sync/scanEntriesSince",
                &ScanEntriesSinceRequest {
                    scope: self.scope(db_id),
                    cursor: cursor.map(str::to_string),
                    limit,
                    filters: filters.cloned(),
                },
            )
            .await?;
        Ok(ScanPage {
            entries: response.entries,
            next_cursor: response.next_cursor,
            has_more: response.has_more,
        })
    }

    pub async fn get_id_bloom_summary(&self, db_id: &str) -> Result<BloomSummary, SyncError> {
        let response: BloomSummaryResponse = self
            .authed_post(
                "/sync/getIdBloomSummary",
                &ScopedRequest {
                    scope: self.scope(db_id),
                },
            )
            .await?;
        Ok(response.summary)
    }

    pub async fn get_compaction_status(&self, db_id: &str) -> Result<CompactionStatus, SyncError> {
        let response: CompactionStatusResponse = self
            .authed_post(
                "/sync/getCompactionStatus",
                &ScopedRequest {
                    scope: self.scope(db_id),
                },
            )
            .await?;
        Ok(response.status)
    }

    /// Fetch full entries; the server's RSA wrapping is removed here.
    pub async fn get_entries(
        &self,
        db_id: &str,
        ids: &[String],
    ) -> Result<Vec<StoreEntry>, SyncError> {
        let response: GetEntriesResponse = self
            .authed_post(
                "/sync/getEntries",
                &GetEntriesRequest {
                    scope: self.scope(db_id),
                    ids: ids.to_vec(),
                },
            )
            .await?;
        response
            .entries
            .into_iter()
            .map(|wrapped| wrapped.unwrap(&self.encryption_key))
            .collect()
    }

    pub async fn put_entries(&self, db_id: &str, entries: &[StoreEntry]) -> Result<(), SyncError> {
        let _: serde_json::Value = self
            .authed_post(
                "/sync/putEntries",
                &PutEntriesRequest {
                    scope: self.scope(db_id),
                    entries: entries.to_vec(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn has_entries(
        &self,
        db_id: &str,
        ids: &[String],
    ) -> Result<Vec<String>, SyncError> {
        let response: IdsResponse = self
            .authed_post(
                "/sync/hasEntries",
                &HasEntriesRequest {
                    scope: self.scope(db_id),
                    ids: ids.to_vec(),
                },
            )
            .await?;
        Ok(response.ids)
    }

    pub async fn get_all_ids(&self, db_id: &str) -> Result<Vec<String>, SyncError> {
        self.ensure_token().await?;
        let path = format!(
            "/sync/getAllIds?tenantId={}&dbId={}",
            self.tenant_id, db_id
        );
        let response: IdsResponse = self.request::<(), _>(Method::GET, &path, None, true).await?;
        Ok(response.ids)
    }

    pub async fn resolve_dependencies(
        &self,
        db_id: &str,
        start_id: &str,
        options: Option<&ResolveOptions>,
    ) -> Result<Vec<String>, SyncError> {
        let response: IdsResponse = self
            .authed_post(
                "/sync/resolveDependencies",
                &ResolveDependenciesRequest {
                    scope: self.scope(db_id),
                    start_id: start_id.to_string(),
                    options: options.cloned(),
                },
            )
            .await?;
        Ok(response.ids)
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    async fn authed_post<T: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, SyncError> {
        self.ensure_token().await?;
        self.request(Method::POST, path, Some(body), true).await
    }

    /// One logical request with retry. Only `Timeout` and `NetworkError`
    /// retry; backoff doubles per attempt.
    async fn request<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
        with_token: bool,
    ) -> Result<R, SyncError> {
        let mut attempt = 0u32;
        loop {
            match self.send_once(method.clone(), path, body, with_token).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retriable() && attempt < self.config.retry_attempts => {
                    let delay = self.config.retry_delay_ms.saturating_mul(1 << attempt);
                    tracing::debug!(path, attempt, delay_ms = delay, error = %e, "retrying request");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
        with_token: bool,
    ) -> Result<R, SyncError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url).timeout(self.config.timeout);
        if with_token {
            if let Some(token) = self.token.read().await.as_ref() {
                request = request.bearer_auth(token);
            }
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<R>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn status_error(status: StatusCode, body: &str) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED => SyncError::InvalidToken,
        StatusCode::FORBIDDEN => SyncError::UserRevoked,
        StatusCode::NOT_FOUND => SyncError::UserNotFound,
        _ => {
            let name = serde_json::from_str::<ErrorBody>(body)
                .map(|b| b.error)
                .unwrap_or_default();
            named_error(if name.is_empty() { "ServerError" } else { &name })
        }
    }
}

fn named_error(name: &str) -> SyncError {
    match name {
        "InvalidToken" => SyncError::InvalidToken,
        "UserRevoked" => SyncError::UserRevoked,
        "UserNotFound" => SyncError::UserNotFound,
        "ChallengeExpired" => SyncError::ChallengeExpired,
        "InvalidSignature" => SyncError::InvalidSignature,
        "Timeout" => SyncError::Timeout,
        "Cancelled" => SyncError::Cancelled,
        other => SyncError::Server(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Remote store adapter
// ---------------------------------------------------------------------------

/// A remote database exposed through the store trait, so the document
/// engine can pull from and push to a server exactly like a local peer.
pub struct RemoteStore {
    client: Arc<SyncClient>,
    db_id: String,
}

impl RemoteStore {
    pub fn new(client: Arc<SyncClient>, db_id: impl Into<String>) -> Self {
        Self {
            client,
            db_id: db_id.into(),
        }
    }
}

fn store_err(e: SyncError) -> mindoo_store::StoreError {
    mindoo_store::StoreError::Io(e.to_string())
}

#[async_trait::async_trait]
impl mindoo_store::ContentAddressedStore for RemoteStore {
    fn store_id(&self) -> &str {
        &self.db_id
    }

    async fn put_entries(&self, entries: &[StoreEntry]) -> Result<(), mindoo_store::StoreError> {
        self.client
            .put_entries(&self.db_id, entries)
            .await
            .map_err(store_err)
    }

    async fn get_entries(
        &self,
        ids: &[String],
    ) -> Result<Vec<StoreEntry>, mindoo_store::StoreError> {
        self.client
            .get_entries(&self.db_id, ids)
            .await
            .map_err(store_err)
    }

    async fn find_new_entries(
        &self,
        have_ids: &[String],
    ) -> Result<Vec<StoreEntryMetadata>, mindoo_store::StoreError> {
        self.client
            .find_new_entries(&self.db_id, have_ids)
            .await
            .map_err(store_err)
    }

    async fn find_new_entries_for_doc(
        &self,
        have_ids: &[String],
        doc_id: &str,
    ) -> Result<Vec<StoreEntryMetadata>, mindoo_store::StoreError> {
        self.client
            .find_new_entries_for_doc(&self.db_id, have_ids, doc_id)
            .await
            .map_err(store_err)
    }

    async fn find_entries(
        &self,
        entry_type: EntryType,
        from_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<StoreEntryMetadata>, mindoo_store::StoreError> {
        self.client
            .find_entries(&self.db_id, entry_type, from_ms, until_ms)
            .await
            .map_err(store_err)
    }

    async fn scan_entries_since(
        &self,
        cursor: Option<&str>,
        limit: usize,
        filters: Option<&ScanFilters>,
    ) -> Result<ScanPage, mindoo_store::StoreError> {
        self.client
            .scan_entries_since(&self.db_id, cursor, limit, filters)
            .await
            .map_err(store_err)
    }

    async fn get_id_bloom_summary(&self) -> Result<BloomSummary, mindoo_store::StoreError> {
        self.client
            .get_id_bloom_summary(&self.db_id)
            .await
            .map_err(store_err)
    }

    async fn get_compaction_status(&self) -> Result<CompactionStatus, mindoo_store::StoreError> {
        self.client
            .get_compaction_status(&self.db_id)
            .await
            .map_err(store_err)
    }

    async fn resolve_dependencies(
        &self,
        start_id: &str,
        options: Option<&ResolveOptions>,
    ) -> Result<Vec<String>, mindoo_store::StoreError> {
        self.client
            .resolve_dependencies(&self.db_id, start_id, options)
            .await
            .map_err(store_err)
    }

    async fn get_all_ids(&self) -> Result<Vec<String>, mindoo_store::StoreError> {
        self.client.get_all_ids(&self.db_id).await.map_err(store_err)
    }

    async fn has_entries(&self, ids: &[String]) -> Result<Vec<String>, mindoo_store::StoreError> {
        self.client
            .has_entries(&self.db_id, ids)
            .await
            .map_err(store_err)
    }
}
