//! Trust model flows: admin-only enforcement, registration, revocation and
//! poisoning resistance of the directory.

use std::sync::Arc;

use mindoo_core::*;
use mindoo_store::{idcodec, MemoryStoreFactory, StoreFactory};

fn config() -> TenantConfig {
    TenantConfig {
        store_factory: Arc::new(MemoryStoreFactory::new()),
        crdt: Arc::new(LwwProvider::new()),
    }
}

async fn tenant_with_member() -> (CreatedTenant, Arc<Tenant>, PrivateUserIdentity) {
    let created = create_tenant("acme", "alice", "alice-pw", config()).await.unwrap();
    let bob_identity = PrivateUserIdentity::create("bob", "bob-pw").unwrap();
    let request = create_join_request(&bob_identity);
    let response = approve_join_request(&created.tenant, &request, "share-pw").await.unwrap();
    let bob = join_tenant(&response, bob_identity.clone(), "bob-pw", "share-pw", config()).unwrap();
    (created, bob, bob_identity)
}

#[tokio::test]
async fn admin_only_database_rejects_non_admin_writes() {
    let (created, bob, _) = tenant_with_member().await;

    // Bob's own session refuses directory writes outright.
    let bob_directory = bob.open_db("directory").await.unwrap();
    assert!(bob_directory.is_admin_only());
    let mut data = DocumentData::new();
    data.set("type", "grantAccess");
    assert!(matches!(
        bob_directory.create_document(data.clone()).await,
        Err(DbError::AdminOnly)
    ));

    // The admin's equivalent call with the admin signing key succeeds.
    let admin_key = created.tenant.current_user().signing_key().unwrap();
    let admin_directory = created.tenant.open_db("directory").await.unwrap();
    admin_directory
        .create_document_with_signing_key(data, &admin_key)
        .await
        .unwrap();
}

#[tokio::test]
async fn directory_forced_admin_only_regardless_of_request() {
    let created = create_tenant("acme", "alice", "pw", config()).await.unwrap();
    let directory = created
        .tenant
        .open_db_with_options("directory", false)
        .await
        .unwrap();
    assert!(directory.is_admin_only());
}

#[tokio::test]
async fn registration_grants_trust_and_revocation_removes_it() {
    let (created, _bob, bob_identity) = tenant_with_member().await;
    let directory = created.tenant.directory().await.unwrap();

    // Registered: trusted.
    assert!(directory
        .is_trusted_signing_key(&bob_identity.public.signing_public_key_pem)
        .await
        .unwrap());
    let keys = directory.get_user_public_keys("bob").await.unwrap().unwrap();
    assert_eq!(keys.signing_public_key_pem, bob_identity.public.signing_public_key_pem);

    // Revoked: no longer trusted, identity gone.
    let admin_key = created.tenant.current_user().signing_key().unwrap();
    let revoked = directory.revoke_user("bob", false, &admin_key).await.unwrap();
    assert_eq!(revoked.len(), 1);
    assert!(!directory
        .is_trusted_signing_key(&bob_identity.public.signing_public_key_pem)
        .await
        .unwrap());
    assert!(directory.get_user_public_keys("bob").await.unwrap().is_none());

    // The admin key itself stays trusted.
    assert!(directory
        .is_trusted_signing_key(&created.admin.public.signing_public_key_pem)
        .await
        .unwrap());
}

#[tokio::test]
async fn revoking_unknown_user_fails() {
    let created = create_tenant("acme", "alice", "pw", config()).await.unwrap();
    let directory = created.tenant.directory().await.unwrap();
    let admin_key = created.tenant.current_user().signing_key().unwrap();
    assert!(matches!(
        directory.revoke_user("nobody", false, &admin_key).await,
        Err(DbError::UserNotFound(_))
    ));
}

#[tokio::test]
async fn revoked_users_entries_are_dropped_on_load() {
    let (created, bob, _) = tenant_with_member().await;

    // Bob writes into his own store, then the admin pulls it.
    let bob_todos = bob.open_db("todos").await.unwrap();
    let mut data = DocumentData::new();
    data.set("title", "bob's todo");
    let doc_id = bob_todos.create_document(data).await.unwrap();

    let alice_todos = created.tenant.open_db("todos").await.unwrap();
    alice_todos
        .pull_changes_from(bob_todos.store().as_ref())
        .await
        .unwrap();
    assert!(alice_todos.get_document(&doc_id).await.is_ok());

    // After revocation a fresh projection drops Bob's entries.
    let admin_key = created.tenant.current_user().signing_key().unwrap();
    created
        .tenant
        .directory()
        .await
        .unwrap()
        .revoke_user("bob", false, &admin_key)
        .await
        .unwrap();

    assert!(matches!(
        alice_todos.get_document_at(&doc_id, i64::MAX).await,
        Err(DbError::NotFound(_))
    ));
}

#[tokio::test]
async fn poisoned_directory_entry_is_ignored() {
    let factory: Arc<dyn StoreFactory> = Arc::new(MemoryStoreFactory::new());
    let shared_config = TenantConfig {
        store_factory: factory,
        crdt: Arc::new(LwwProvider::new()),
    };
    let created = create_tenant("acme", "alice", "pw", shared_config.clone()).await.unwrap();
    let directory_db = created.tenant.open_db("directory").await.unwrap();
    let admin_docs = directory_db.get_all_document_ids().await.unwrap();
    assert_eq!(admin_docs.len(), 1, "admin's own grant");

    // Mallory forges a directory entry: structurally valid, correctly
    // encrypted with the (shared) tenant key, but signed by a non-admin key.
    let mallory = mindoo_crypto::sign::generate_signing_key();
    let provider = LwwProvider::new();
    let mut doc = provider.init();
    let change = doc
        .transact(&mut |d| {
            d.set("form", "userAccess");
            d.set("type", "grantAccess");
            d.set("username", "mallory");
        })
        .unwrap()
        .unwrap();

    let forged_doc_id = idcodec::new_uuid7().to_string();
    let encrypted_data = created.tenant.encrypt_payload(&change.bytes, "default").unwrap();
    let signature = mindoo_crypto::sign::sign(&mallory, &encrypted_data);
    let entry = mindoo_store::StoreEntry {
        entry_type: mindoo_store::EntryType::DocCreate,
        id: idcodec::doc_entry_id(&forged_doc_id, &change.hash, &change.dep_hashes),
        content_hash: idcodec::content_hash(&encrypted_data),
        doc_id: forged_doc_id,
        dependency_ids: vec![],
        created_at: 1,
        created_by_public_key: mindoo_crypto::sign::verifying_key_to_pem(
            &mallory.verifying_key(),
        )
        .unwrap(),
        decryption_key_id: "default".into(),
        signature,
        original_size: change.bytes.len() as u64,
        encrypted_size: encrypted_data.len() as u64,
        encrypted_data,
    };
    directory_db.store().put_entries(&[entry]).await.unwrap();

    // A fresh session over the same store sees only the admin-signed record.
    let keys = KeyBag::new();
    for (kind, id) in created.tenant.keys().list_keys() {
        keys.set(kind, id.clone(), created.tenant.keys().get(kind, &id).unwrap());
    }
    let reopened = open_tenant(
        created.tenant.identity().clone(),
        created.admin.clone(),
        "pw",
        keys,
        shared_config,
    )
    .unwrap();
    let directory2 = reopened.open_db("directory").await.unwrap();
    assert_eq!(directory2.get_all_document_ids().await.unwrap(), admin_docs);
    assert!(!reopened
        .directory()
        .await
        .unwrap()
        .is_trusted_signing_key(
            &mindoo_crypto::sign::verifying_key_to_pem(&mallory.verifying_key()).unwrap()
        )
        .await
        .unwrap());
}

#[tokio::test]
async fn tenant_payload_crypto_routing() {
    let (created, _bob, bob_identity) = tenant_with_member().await;
    let tenant = &created.tenant;

    // Default key round trip.
    let sealed = tenant.encrypt_payload(b"secret", "default").unwrap();
    assert_eq!(tenant.decrypt_payload(&sealed, "default").unwrap(), b"secret");

    // Named keys resolve through the key bag; unknown ids fail.
    let sealed = tenant.encrypt_payload(b"infos", PUBLIC_INFOS_KEY_ID).unwrap();
    assert_eq!(
        tenant.decrypt_payload(&sealed, PUBLIC_INFOS_KEY_ID).unwrap(),
        b"infos"
    );
    assert!(matches!(
        tenant.encrypt_payload(b"x", "no-such-key"),
        Err(DbError::KeyNotFound(_))
    ));

    // Signature verification is trust-aware.
    let signature = tenant.sign_payload(b"message").unwrap();
    let admin_pem = &created.admin.public.signing_public_key_pem;
    assert!(tenant.verify_signature(b"message", &signature, admin_pem).await.unwrap());
    assert!(!tenant.verify_signature(b"other", &signature, admin_pem).await.unwrap());

    // A trusted member's signature verifies; an outsider's never does.
    let bob_key = bob_identity.decrypt_signing_key("bob-pw").unwrap();
    let bob_sig = mindoo_crypto::sign::sign(&bob_key, b"from bob");
    assert!(tenant
        .verify_signature(b"from bob", &bob_sig, &bob_identity.public.signing_public_key_pem)
        .await
        .unwrap());

    let outsider = mindoo_crypto::sign::generate_signing_key();
    let outsider_pem = mindoo_crypto::sign::verifying_key_to_pem(&outsider.verifying_key()).unwrap();
    let outsider_sig = mindoo_crypto::sign::sign(&outsider, b"hi");
    assert!(!tenant.verify_signature(b"hi", &outsider_sig, &outsider_pem).await.unwrap());
}

#[tokio::test]
async fn named_key_installation_rules() {
    let created = create_tenant("acme", "alice", "pw", config()).await.unwrap();
    let raw = mindoo_crypto::aead::generate_key().unwrap();
    let wrapped = mindoo_crypto::wrap::wrap_secret("share", &raw).unwrap();

    assert!(matches!(
        created.tenant.add_named_key("default", &wrapped, "share"),
        Err(DbError::InvalidInput(_))
    ));
    created.tenant.add_named_key("project-x", &wrapped, "share").unwrap();
    assert_eq!(created.tenant.keys().get(KeyKind::Doc, "project-x"), Some(raw));

    // Encrypted documents use the named key end to end.
    let todos = created.tenant.open_db("todos").await.unwrap();
    let mut data = DocumentData::new();
    data.set("title", "secret project");
    let doc_id = todos.create_encrypted_document(data, "project-x").await.unwrap();
    let read = todos.get_document(&doc_id).await.unwrap();
    assert_eq!(read.get_str("title"), Some("secret project"));
}
