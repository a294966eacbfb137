//! # Mindoo Core
//!
//! Tenant, document engine, trust directory and key management for
//! MindooDB: an end-to-end encrypted, multi-tenant, peer-synchronized
//! document database.
//!
//! A tenant session owns the current user's identity and key bag, opens
//! per-database document engines over content-addressed entry stores, and
//! routes every mutation through encrypt-then-sign. The directory database
//! is the admin-only root of trust; all other databases filter incoming
//! entries through it. Members are onboarded with the join flow, which
//! ships the shared symmetric keys re-wrapped under an out-of-band share
//! password.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use mindoo_core::*;
//!
//! # tokio_test::block_on(async {
//! let config = TenantConfig {
//!     store_factory: Arc::new(mindoo_store::MemoryStoreFactory::new()),
//!     crdt: Arc::new(LwwProvider::new()),
//! };
//! let created = create_tenant("acme", "alice", "pw", config).await.unwrap();
//!
//! let todos = created.tenant.open_db("todos").await.unwrap();
//! let mut data = DocumentData::new();
//! data.set("title", "Buy milk");
//! let doc_id = todos.create_document(data).await.unwrap();
//! assert_eq!(
//!     todos.get_document(&doc_id).await.unwrap().get_str("title"),
//!     Some("Buy milk")
//! );
//! # });
//! ```

#![deny(unsafe_code)]

pub mod crdt;
pub mod directory;
pub mod engine;
pub mod error;
pub mod factory;
pub mod identity;
pub mod join;
pub mod keybag;
pub mod payload;
pub mod tenant;

pub use crdt::{CrdtChange, CrdtChangeInfo, CrdtDoc, CrdtProvider, LwwProvider};
pub use directory::{Directory, DIRECTORY_DB_ID};
pub use engine::{
    AdminOnlyTrust, Database, DatabaseParams, DocChangeSummary, DocCursor, DocumentInfo,
    TrustResolver,
};
pub use error::DbError;
pub use factory::{
    create_tenant, open_tenant, open_tenant_from_dir, persist_tenant_files, CreatedTenant,
    KEYBAG_FILE, TENANT_FILE, USER_FILE,
};
pub use identity::{CurrentUser, PrivateUserIdentity, PublicUserIdentity, TenantIdentity};
pub use join::{
    approve_join_request, create_join_request, decode_mindoo_uri, encode_mindoo_uri, is_mindoo_uri,
    join_tenant, JoinRequest, JoinResponse, MindooUriKind,
};
pub use keybag::{KeyBag, KeyKind, DEFAULT_KEY_ID};
pub use payload::DocumentData;
pub use tenant::{Tenant, TenantConfig, PUBLIC_INFOS_KEY_ID};
