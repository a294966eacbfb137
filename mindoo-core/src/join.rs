//! Join flow: request → approve → join.
//!
//! A requester emits a join request (the public half of their identity);
//! the admin registers them in the directory and re-wraps the tenant key
//! and the public-infos key under a PBKDF2 key derived from an out-of-band
//! share password; the requester unwraps both, installs them in the key
//! bag and opens the tenant.
//!
//! Both payloads also travel as `mdb://` URIs:
//! `mdb://join-request/<base>` and `mdb://join-response/<base>`, where
//! `<base>` is the URL-safe base64 encoding of the JSON payload.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use mindoo_crypto::{wrap, EncryptedKey};
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::identity::{PrivateUserIdentity, PublicUserIdentity, TenantIdentity};
use crate::keybag::{KeyBag, KeyKind};
use crate::tenant::{Tenant, TenantConfig, PUBLIC_INFOS_KEY_ID};

pub const JOIN_VERSION: u8 = 1;

const URI_SCHEME: &str = "mdb://";

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub v: u8,
    pub username: String,
    pub signing_public_key_pem: String,
    pub encryption_public_key_pem: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub v: u8,
    pub tenant_id: String,
    pub admin_signing_public_key_pem: String,
    pub admin_encryption_public_key_pem: String,
    pub encrypted_tenant_key: EncryptedKey,
    pub encrypted_public_infos_key: EncryptedKey,
}

// ---------------------------------------------------------------------------
// URIs
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MindooUriKind {
    JoinRequest,
    JoinResponse,
}

impl MindooUriKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JoinRequest => "join-request",
            Self::JoinResponse => "join-response",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "join-request" => Some(Self::JoinRequest),
            "join-response" => Some(Self::JoinResponse),
            _ => None,
        }
    }
}

pub fn is_mindoo_uri(uri: &str) -> bool {
    decode_mindoo_uri(uri).is_ok()
}

pub fn encode_mindoo_uri<T: Serialize>(kind: MindooUriKind, payload: &T) -> Result<String, DbError> {
    let json = serde_json::to_vec(payload)
        .map_err(|e| DbError::InvalidInput(format!("unencodable payload: {}", e)))?;
    Ok(format!(
        "{}{}/{}",
        URI_SCHEME,
        kind.as_str(),
        URL_SAFE_NO_PAD.encode(json)
    ))
}

pub fn decode_mindoo_uri(uri: &str) -> Result<(MindooUriKind, serde_json::Value), DbError> {
    let rest = uri
        .strip_prefix(URI_SCHEME)
        .ok_or_else(|| DbError::InvalidInput(format!("not a mindoo URI: {}", uri)))?;
    let (kind, base) = rest
        .split_once('/')
        .ok_or_else(|| DbError::InvalidInput("mindoo URI has no payload".into()))?;
    let kind = MindooUriKind::from_str(kind)
        .ok_or_else(|| DbError::InvalidInput(format!("unknown mindoo URI type: {}", kind)))?;
    let json = URL_SAFE_NO_PAD
        .decode(base.as_bytes())
        .map_err(|_| DbError::InvalidInput("bad base64 in mindoo URI".into()))?;
    let value = serde_json::from_slice(&json)
        .map_err(|e| DbError::InvalidInput(format!("bad JSON in mindoo URI: {}", e)))?;
    Ok((kind, value))
}

fn payload_from_uri<T: for<'de> Deserialize<'de>>(
    uri: &str,
    expected: MindooUriKind,
) -> Result<T, DbError> {
    let (kind, value) = decode_mindoo_uri(uri)?;
    if kind != expected {
        return Err(DbError::InvalidInput(format!(
            "expected a {} URI, got {}",
            expected.as_str(),
            kind.as_str()
        )));
    }
    serde_json::from_value(value)
        .map_err(|e| DbError::InvalidInput(format!("malformed {} payload: {}", expected.as_str(), e)))
}

impl JoinRequest {
    pub fn to_uri(&self) -> Result<String, DbError> {
        encode_mindoo_uri(MindooUriKind::JoinRequest, self)
    }

    pub fn from_uri(uri: &str) -> Result<Self, DbError> {
        let request: Self = payload_from_uri(uri, MindooUriKind::JoinRequest)?;
        request.check_version()?;
        Ok(request)
    }

    fn check_version(&self) -> Result<(), DbError> {
        if self.v != JOIN_VERSION {
            return Err(DbError::InvalidInput(format!(
                "unsupported join request version {}",
                self.v
            )));
        }
        Ok(())
    }
}

impl JoinResponse {
    pub fn to_uri(&self) -> Result<String, DbError> {
        encode_mindoo_uri(MindooUriKind::JoinResponse, self)
    }

    pub fn from_uri(uri: &str) -> Result<Self, DbError> {
        let response: Self = payload_from_uri(uri, MindooUriKind::JoinResponse)?;
        if response.v != JOIN_VERSION {
            return Err(DbError::InvalidInput(format!(
                "unsupported join response version {}",
                response.v
            )));
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// Pure function of the requester's public half.
pub fn create_join_request(user: &PrivateUserIdentity) -> JoinRequest {
    JoinRequest {
        v: JOIN_VERSION,
        username: user.public.username.clone(),
        signing_public_key_pem: user.public.signing_public_key_pem.clone(),
        encryption_public_key_pem: user.public.encryption_public_key_pem.clone(),
    }
}

/// Admin side: register the requester and re-wrap the shared keys under
/// `share_password` (transmitted out-of-band).
pub async fn approve_join_request(
    tenant: &Tenant,
    request: &JoinRequest,
    share_password: &str,
) -> Result<JoinResponse, DbError> {
    request.check_version()?;
    if !tenant.current_user_is_admin()? {
        return Err(DbError::AdminOnly);
    }
    let admin_signing_key = tenant.current_user().signing_key()?;

    let requester = PublicUserIdentity {
        username: request.username.clone(),
        admin_signature: None,
        signing_public_key_pem: request.signing_public_key_pem.clone(),
        encryption_public_key_pem: request.encryption_public_key_pem.clone(),
    };
    tenant
        .directory()
        .await?
        .register_user(&requester, &admin_signing_key)
        .await?;

    let tenant_key = tenant
        .keys()
        .get(KeyKind::Tenant, tenant.tenant_id())
        .ok_or_else(|| DbError::KeyNotFound(tenant.tenant_id().to_string()))?;
    let public_infos_key = tenant
        .keys()
        .get(KeyKind::Doc, PUBLIC_INFOS_KEY_ID)
        .ok_or_else(|| DbError::KeyNotFound(PUBLIC_INFOS_KEY_ID.to_string()))?;

    Ok(JoinResponse {
        v: JOIN_VERSION,
        tenant_id: tenant.tenant_id().to_string(),
        admin_signing_public_key_pem: tenant.identity().admin_signing_public_key_pem.clone(),
        admin_encryption_public_key_pem: tenant.identity().admin_encryption_public_key_pem.clone(),
        encrypted_tenant_key: wrap::wrap_secret(share_password, &tenant_key)?,
        encrypted_public_infos_key: wrap::wrap_secret(share_password, &public_infos_key)?,
    })
}

/// Requester side: unwrap the shared keys, install them, open the tenant.
pub fn join_tenant(
    response: &JoinResponse,
    user: PrivateUserIdentity,
    password: &str,
    share_password: &str,
    config: TenantConfig,
) -> Result<Arc<Tenant>, DbError> {
    if response.v != JOIN_VERSION {
        return Err(DbError::InvalidInput(format!(
            "unsupported join response version {}",
            response.v
        )));
    }
    let tenant_key = unwrap_key_32(share_password, &response.encrypted_tenant_key)?;
    let public_infos_key = unwrap_key_32(share_password, &response.encrypted_public_infos_key)?;

    let keys = KeyBag::new();
    keys.set(KeyKind::Tenant, response.tenant_id.clone(), tenant_key);
    keys.set(KeyKind::Doc, PUBLIC_INFOS_KEY_ID, public_infos_key);

    let identity = TenantIdentity {
        tenant_id: response.tenant_id.clone(),
        admin_signing_public_key_pem: response.admin_signing_public_key_pem.clone(),
        admin_encryption_public_key_pem: response.admin_encryption_public_key_pem.clone(),
    };
    Tenant::open(identity, user, password, keys, config)
}

fn unwrap_key_32(password: &str, wrapped: &EncryptedKey) -> Result<[u8; 32], DbError> {
    let raw = wrap::unwrap_secret(password, wrapped)?;
    raw.as_slice()
        .try_into()
        .map_err(|_| DbError::CryptoFailure(mindoo_crypto::CryptoError::InvalidKey))
}
