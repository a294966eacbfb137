//! Sync server: the REST surface over one hosted tenant.
//!
//! Auth is challenge/response against the directory; data-plane calls are
//! JWT-authenticated and scoped to `{tenantId, dbId}`. On egress the server
//! wraps entry ciphertext to the caller's RSA key; on ingress it rejects
//! any batch containing an entry whose author the directory does not trust.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use mindoo_core::Tenant;
use mindoo_crypto::{envelope, sign};
use mindoo_store::ContentAddressedStore;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{self, ChallengeStore, DEFAULT_CHALLENGE_TTL, DEFAULT_TOKEN_TTL};
use crate::error::SyncError;
use crate::wire::*;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ServerConfig {
    pub jwt_secret: Vec<u8>,
    pub challenge_ttl: Duration,
    pub token_ttl: Duration,
}

impl ServerConfig {
    pub fn new(jwt_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            challenge_ttl: DEFAULT_CHALLENGE_TTL,
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }
}

pub struct ServerState {
    tenant: Arc<Tenant>,
    challenges: ChallengeStore,
    config: ServerConfig,
}

impl ServerState {
    pub fn new(tenant: Arc<Tenant>, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            challenges: ChallengeStore::new(config.challenge_ttl),
            tenant,
            config,
        })
    }
}

type Shared = Arc<ServerState>;
type HandlerResult<T> = Result<Json<T>, Response>;

/// Authenticated username, injected into request extensions by the auth
/// middleware.
#[derive(Clone, Debug)]
pub struct AuthedUser(pub String);

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: Shared) -> Router {
    let data_plane = Router::new()
        .route("/sync/findNewEntries", post(find_new_entries))
        .route("/sync/findNewEntriesForDoc", post(find_new_entries_for_doc))
        .route("/sync/findEntries", post(find_entries))
        .route("/sync/scanEntriesSince", post(scan_entries_since))
        .route("/sync/getIdBloomSummary", post(get_id_bloom_summary))
        .route("/sync/getCompactionStatus", post(get_compaction_status))
        .route("/sync/getEntries", post(get_entries))
        .route("/sync/putEntries", post(put_entries))
        .route("/sync/hasEntries", post(has_entries))
        .route("/sync/getAllIds", get(get_all_ids))
        .route("/sync/resolveDependencies", post(resolve_dependencies))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/auth/challenge", post(auth_challenge))
        .route("/auth/authenticate", post(auth_authenticate))
        .route("/sync/capabilities", get(capabilities))
        .merge(data_plane)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Shared,
) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_response(e: SyncError) -> Response {
    let status = match &e {
        SyncError::InvalidToken => StatusCode::UNAUTHORIZED,
        SyncError::UserRevoked => StatusCode::FORBIDDEN,
        SyncError::UserNotFound => StatusCode::NOT_FOUND,
        SyncError::InvalidSignature
        | SyncError::ChallengeExpired
        | SyncError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::debug!(error = %e, status = %status, "request failed");
    (status, Json(ErrorBody { error: e.wire_name().to_string() })).into_response()
}

// ---------------------------------------------------------------------------
// Auth endpoints
// ---------------------------------------------------------------------------

async fn auth_challenge(
    State(state): State<Shared>,
    Json(req): Json<ChallengeRequest>,
) -> Json<ChallengeResponse> {
    let challenge = state.challenges.issue(&req.username).await;
    Json(ChallengeResponse { challenge })
}

async fn auth_authenticate(
    State(state): State<Shared>,
    Json(req): Json<AuthenticateRequest>,
) -> Json<AuthenticateResponse> {
    match authenticate_inner(&state, &req).await {
        Ok(token) => Json(AuthenticateResponse {
            success: true,
            token: Some(token),
            error: None,
        }),
        Err(e) => Json(AuthenticateResponse {
            success: false,
            token: None,
            error: Some(e.wire_name().to_string()),
        }),
    }
}

async fn authenticate_inner(
    state: &ServerState,
    req: &AuthenticateRequest,
) -> Result<String, SyncError> {
    let username = state.challenges.consume(&req.challenge).await?;
    let directory = state.tenant.directory().await?;
    let user = directory
        .get_user_public_keys(&username)
        .await?
        .ok_or(SyncError::UserNotFound)?;

    let key = sign::verifying_key_from_pem(&user.signing_public_key_pem)
        .map_err(|_| SyncError::InvalidSignature)?;
    if !sign::verify_ok(&key, req.challenge.as_bytes(), &req.signature) {
        tracing::warn!(username = %username, "challenge signature rejected");
        return Err(SyncError::InvalidSignature);
    }
    auth::issue_token(&state.config.jwt_secret, &username, state.config.token_ttl)
}

async fn capabilities(Query(_q): Query<CapabilitiesQuery>) -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        capabilities: NetworkSyncCapabilities::current(),
    })
}

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

async fn auth_middleware(
    State(state): State<Shared>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let Some(token) = token else {
        return error_response(SyncError::InvalidToken);
    };
    let username = match auth::verify_token(&state.config.jwt_secret, &token) {
        Ok(username) => username,
        Err(e) => return error_response(e),
    };

    // A valid token is not enough: the user must still be trusted now.
    match state.tenant.directory().await {
        Ok(directory) => match directory.get_user_public_keys(&username).await {
            Ok(Some(_)) => {}
            Ok(None) => return error_response(SyncError::UserRevoked),
            Err(e) => return error_response(SyncError::Db(e)),
        },
        Err(e) => return error_response(SyncError::Db(e)),
    }

    req.extensions_mut().insert(AuthedUser(username));
    next.run(req).await
}

// ---------------------------------------------------------------------------
// Data-plane endpoints
// ---------------------------------------------------------------------------

async fn open_store(
    state: &ServerState,
    scope: &Scope,
) -> Result<Arc<dyn ContentAddressedStore>, SyncError> {
    if scope.tenant_id != state.tenant.tenant_id() {
        return Err(SyncError::InvalidInput(format!(
            "unknown tenant '{}'",
            scope.tenant_id
        )));
    }
    Ok(state.tenant.open_db(&scope.db_id).await?.store().clone())
}

async fn find_new_entries(
    State(state): State<Shared>,
    Json(req): Json<FindNewEntriesRequest>,
) -> HandlerResult<EntryMetadataResponse> {
    let store = open_store(&state, &req.scope).await.map_err(error_response)?;
    let entries = store
        .find_new_entries(&req.have_ids)
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(EntryMetadataResponse { entries }))
}

async fn find_new_entries_for_doc(
    State(state): State<Shared>,
    Json(req): Json<FindNewEntriesForDocRequest>,
) -> HandlerResult<EntryMetadataResponse> {
    let store = open_store(&state, &req.scope).await.map_err(error_response)?;
    let entries = store
        .find_new_entries_for_doc(&req.have_ids, &req.doc_id)
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(EntryMetadataResponse { entries }))
}

async fn find_entries(
    State(state): State<Shared>,
    Json(req): Json<FindEntriesRequest>,
) -> HandlerResult<EntryMetadataResponse> {
    let store = open_store(&state, &req.scope).await.map_err(error_response)?;
    let entries = store
        .find_entries(req.entry_type, req.creation_date_from, req.creation_date_until)
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(EntryMetadataResponse { entries }))
}

async fn scan_entries_since(
    State(state): State<Shared>,
    Json(req): Json<ScanEntriesSinceRequest>,
) -> HandlerResult<ScanEntriesSinceResponse> {
    let store = open_store(&state, &req.scope).await.map_err(error_response)?;
    let page = store
        .scan_entries_since(req.cursor.as_deref(), req.limit, req.filters.as_ref())
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(ScanEntriesSinceResponse {
        entries: page.entries,
        next_cursor: page.next_cursor,
        has_more: page.has_more,
    }))
}

async fn get_id_bloom_summary(
    State(state): State<Shared>,
    Json(req): Json<ScopedRequest>,
) -> HandlerResult<BloomSummaryResponse> {
    let store = open_store(&state, &req.scope).await.map_err(error_response)?;
    let summary = store
        .get_id_bloom_summary()
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(BloomSummaryResponse { summary }))
}

async fn get_compaction_status(
    State(state): State<Shared>,
    Json(req): Json<ScopedRequest>,
) -> HandlerResult<CompactionStatusResponse> {
    let store = open_store(&state, &req.scope).await.map_err(error_response)?;
    let status = store
        .get_compaction_status()
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(CompactionStatusResponse { status }))
}

async fn get_entries(
    State(state): State<Shared>,
    Extension(AuthedUser(username)): Extension<AuthedUser>,
    Json(req): Json<GetEntriesRequest>,
) -> HandlerResult<GetEntriesResponse> {
    let store = open_store(&state, &req.scope).await.map_err(error_response)?;

    // Egress wrapping: look up the caller's RSA key in the directory.
    let directory = state.tenant.directory().await.map_err(|e| error_response(e.into()))?;
    let user = directory
        .get_user_public_keys(&username)
        .await
        .map_err(|e| error_response(e.into()))?
        .ok_or_else(|| error_response(SyncError::UserNotFound))?;
    let recipient = envelope::encryption_public_key_from_pem(&user.encryption_public_key_pem)
        .map_err(|_| error_response(SyncError::Server("bad directory key".into())))?;

    let entries = store
        .get_entries(&req.ids)
        .await
        .map_err(|e| error_response(e.into()))?;
    let mut wrapped = Vec::with_capacity(entries.len());
    for entry in &entries {
        wrapped.push(NetworkEncryptedEntry::wrap(entry, &recipient).map_err(error_response)?);
    }
    Ok(Json(GetEntriesResponse { entries: wrapped }))
}

async fn put_entries(
    State(state): State<Shared>,
    Json(req): Json<PutEntriesRequest>,
) -> HandlerResult<serde_json::Value> {
    let store = open_store(&state, &req.scope).await.map_err(error_response)?;

    // Ingress validation: every author must verify and be trusted; the
    // whole batch is rejected on the first failure.
    let directory = state.tenant.directory().await.map_err(|e| error_response(e.into()))?;
    for entry in &req.entries {
        let author = sign::verifying_key_from_pem(&entry.created_by_public_key)
            .map_err(|_| error_response(SyncError::InvalidSignature))?;
        if !sign::verify_ok(&author, &entry.encrypted_data, &entry.signature) {
            tracing::warn!(entry = %entry.id, "pushed entry has invalid signature");
            return Err(error_response(SyncError::InvalidSignature));
        }
        let trusted = directory
            .is_trusted_signing_key(&entry.created_by_public_key)
            .await
            .map_err(|e| error_response(e.into()))?;
        if !trusted {
            tracing::warn!(entry = %entry.id, "pushed entry signed by untrusted key");
            return Err(error_response(SyncError::InvalidSignature));
        }
    }

    store
        .put_entries(&req.entries)
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(serde_json::json!({})))
}

async fn has_entries(
    State(state): State<Shared>,
    Json(req): Json<HasEntriesRequest>,
) -> HandlerResult<IdsResponse> {
    let store = open_store(&state, &req.scope).await.map_err(error_response)?;
    let ids = store
        .has_entries(&req.ids)
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(IdsResponse { ids }))
}

async fn get_all_ids(
    State(state): State<Shared>,
    Query(scope): Query<Scope>,
) -> HandlerResult<IdsResponse> {
    let store = open_store(&state, &scope).await.map_err(error_response)?;
    let ids = store
        .get_all_ids()
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(IdsResponse { ids }))
}

async fn resolve_dependencies(
    State(state): State<Shared>,
    Json(req): Json<ResolveDependenciesRequest>,
) -> HandlerResult<IdsResponse> {
    let store = open_store(&state, &req.scope).await.map_err(error_response)?;
    let ids = store
        .resolve_dependencies(&req.start_id, req.options.as_ref())
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(IdsResponse { ids }))
}
