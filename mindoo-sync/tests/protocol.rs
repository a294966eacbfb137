//! Protocol round trips against a live server on a loopback port:
//! challenge/response auth, RSA-wrapped delivery, push validation and
//! engine-level pull/push through the remote store adapter.

use std::sync::Arc;

use mindoo_core::*;
use mindoo_store::{ContentAddressedStore, MemoryStoreFactory};
use mindoo_sync::*;

fn config() -> TenantConfig {
    TenantConfig {
        store_factory: Arc::new(MemoryStoreFactory::new()),
        crdt: Arc::new(LwwProvider::new()),
    }
}

fn todo(title: &str) -> DocumentData {
    let mut data = DocumentData::new();
    data.set("title", title);
    data.set("done", false);
    data
}

async fn start_server(tenant: Arc<Tenant>) -> String {
    let state = ServerState::new(tenant, ServerConfig::new(b"test-secret".to_vec()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = mindoo_sync::serve(listener, state).await;
    });
    format!("http://{}", addr)
}

struct Fixture {
    alice: CreatedTenant,
    bob: Arc<Tenant>,
    bob_identity: PrivateUserIdentity,
    base_url: String,
}

async fn fixture() -> Fixture {
    let alice = create_tenant("acme", "alice", "alice-pw", config()).await.unwrap();
    let bob_identity = PrivateUserIdentity::create("bob", "bob-pw").unwrap();
    let request = create_join_request(&bob_identity);
    let response = approve_join_request(&alice.tenant, &request, "share-pw").await.unwrap();
    let bob = join_tenant(&response, bob_identity.clone(), "bob-pw", "share-pw", config()).unwrap();
    let base_url = start_server(alice.tenant.clone()).await;
    Fixture {
        alice,
        bob,
        bob_identity,
        base_url,
    }
}

#[tokio::test]
async fn challenge_response_authentication() {
    let f = fixture().await;

    // A registered user authenticates.
    let client = SyncClient::for_tenant(&f.bob, &f.base_url).unwrap();
    client.authenticate().await.unwrap();

    // An impostor holding the right username but the wrong key does not.
    let impostor_key = Arc::new(mindoo_crypto::sign::generate_signing_key());
    let (private, _) = mindoo_crypto::envelope::generate_encryption_keypair().unwrap();
    let impostor = SyncClient::new(
        &f.base_url,
        "acme",
        "bob",
        impostor_key,
        Arc::new(private),
    );
    assert_eq!(
        impostor.authenticate().await.unwrap_err(),
        SyncError::InvalidSignature
    );

    // An unknown username fails before any signature check matters.
    let ghost_key = Arc::new(mindoo_crypto::sign::generate_signing_key());
    let (ghost_private, _) = mindoo_crypto::envelope::generate_encryption_keypair().unwrap();
    let ghost = SyncClient::new(&f.base_url, "acme", "ghost", ghost_key, Arc::new(ghost_private));
    assert_eq!(ghost.authenticate().await.unwrap_err(), SyncError::UserNotFound);
}

#[tokio::test]
async fn challenge_nonce_is_single_use() {
    let f = fixture().await;
    let http = reqwest::Client::new();

    let challenge: serde_json::Value = http
        .post(format!("{}/auth/challenge", f.base_url))
        .json(&serde_json::json!({"username": "bob"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let nonce = challenge["challenge"].as_str().unwrap().to_string();

    let key = f.bob_identity.decrypt_signing_key("bob-pw").unwrap();
    let signature = mindoo_crypto::b64::encode(&mindoo_crypto::sign::sign(&key, nonce.as_bytes()));
    let body = serde_json::json!({"challenge": nonce, "signature": signature});

    let first: serde_json::Value = http
        .post(format!("{}/auth/authenticate", f.base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["success"], true);

    let second: serde_json::Value = http
        .post(format!("{}/auth/authenticate", f.base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["success"], false);
    assert_eq!(second["error"], "ChallengeExpired");
}

#[tokio::test]
async fn data_plane_requires_token() {
    let f = fixture().await;
    let http = reqwest::Client::new();
    let response = http
        .post(format!("{}/sync/findNewEntries", f.base_url))
        .json(&serde_json::json!({"tenantId": "acme", "dbId": "todos", "haveIds": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn capabilities_negotiation_with_legacy_fallback() {
    let f = fixture().await;
    let client = SyncClient::for_tenant(&f.bob, &f.base_url).unwrap();
    let caps = client.get_capabilities("todos").await.unwrap();
    assert!(caps.cursor_scan && caps.bloom && caps.compaction_status);

    // A server without the endpoint is assumed legacy.
    let bare = axum::Router::new();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, bare).await;
    });
    let legacy_client = SyncClient::for_tenant(&f.bob, format!("http://{}", addr)).unwrap();
    let caps = legacy_client.get_capabilities("todos").await.unwrap();
    assert_eq!(caps, NetworkSyncCapabilities::legacy());
}

#[tokio::test]
async fn rsa_wrapped_delivery_roundtrip() {
    let f = fixture().await;
    let todos = f.alice.tenant.open_db("todos").await.unwrap();
    let doc_id = todos.create_document(todo("Buy milk")).await.unwrap();

    let client = SyncClient::for_tenant(&f.bob, &f.base_url).unwrap();
    let ids = client.get_all_ids("todos").await.unwrap();
    assert_eq!(ids.len(), 1);

    // The wire payload is RSA-wrapped; the client transparently unwraps
    // back to the stored entry.
    let entries = client.get_entries("todos", &ids).await.unwrap();
    assert_eq!(entries.len(), 1);
    let local = todos.store().get_entries(&ids).await.unwrap();
    assert_eq!(entries[0], local[0]);
    assert_eq!(entries[0].doc_id, doc_id);

    // Discovery calls agree with the store.
    let metas = client.find_new_entries("todos", &[]).await.unwrap();
    assert_eq!(metas.len(), 1);
    assert!(client
        .find_new_entries("todos", &ids)
        .await
        .unwrap()
        .is_empty());

    let page = client.scan_entries_since("todos", None, 10, None).await.unwrap();
    assert_eq!(page.entries.len(), 1);
    assert!(!page.has_more);

    let summary = client.get_id_bloom_summary("todos").await.unwrap();
    assert!(summary.might_contain(&ids[0]));
    assert_eq!(client.has_entries("todos", &ids).await.unwrap(), ids);
    client.get_compaction_status("todos").await.unwrap();
}

#[tokio::test]
async fn push_validation_rejects_untrusted_authors() {
    let f = fixture().await;

    // Bob writes locally and pushes: accepted while he is registered.
    let bob_todos = f.bob.open_db("todos").await.unwrap();
    let doc_id = bob_todos.create_document(todo("from bob")).await.unwrap();
    let bob_ids = bob_todos.store().get_all_ids().await.unwrap();
    let bob_entries = bob_todos.store().get_entries(&bob_ids).await.unwrap();

    let client = SyncClient::for_tenant(&f.bob, &f.base_url).unwrap();
    client.put_entries("todos", &bob_entries).await.unwrap();

    let alice_todos = f.alice.tenant.open_db("todos").await.unwrap();
    alice_todos.sync_store_changes().await.unwrap();
    assert_eq!(
        alice_todos.get_document(&doc_id).await.unwrap().get_str("title"),
        Some("from bob")
    );

    // Revoke Bob. Entries he signs are now rejected wholesale, even when a
    // trusted peer relays them.
    let admin_key = f.alice.tenant.current_user().signing_key().unwrap();
    f.alice
        .tenant
        .directory()
        .await
        .unwrap()
        .revoke_user("bob", false, &admin_key)
        .await
        .unwrap();

    let doc2 = bob_todos.create_document(todo("after revocation")).await.unwrap();
    let new_ids: Vec<String> = bob_todos
        .store()
        .get_all_ids()
        .await
        .unwrap()
        .into_iter()
        .filter(|id| !bob_ids.contains(id))
        .collect();
    let new_entries = bob_todos.store().get_entries(&new_ids).await.unwrap();
    assert!(new_entries.iter().any(|e| e.doc_id == doc2));

    let alice_client = SyncClient::for_tenant(&f.alice.tenant, &f.base_url).unwrap();
    assert_eq!(
        alice_client
            .put_entries("todos", &new_entries)
            .await
            .unwrap_err(),
        SyncError::InvalidSignature
    );

    // Bob's own session dies at the door: his still-valid token no longer
    // passes the trust check, and a fresh authentication finds no identity.
    assert_eq!(
        client.get_all_ids("todos").await.unwrap_err(),
        SyncError::UserRevoked
    );
    let fresh_bob = SyncClient::for_tenant(&f.bob, &f.base_url).unwrap();
    assert_eq!(
        fresh_bob.authenticate().await.unwrap_err(),
        SyncError::UserNotFound
    );
}

#[tokio::test]
async fn cursor_based_incremental_pull() {
    let f = fixture().await;
    let alice_todos = f.alice.tenant.open_db("todos").await.unwrap();
    for i in 0..5 {
        alice_todos
            .create_document(todo(&format!("todo-{}", i)))
            .await
            .unwrap();
    }

    let client = Arc::new(SyncClient::for_tenant(&f.bob, &f.base_url).unwrap());
    let remote = RemoteStore::new(client, "todos");
    let bob_todos = f.bob.open_db("todos").await.unwrap();

    // First sweep pulls everything visible so far, in pages.
    let (pulled, cursor) = bob_todos
        .pull_changes_from_cursor(&remote, None, 2)
        .await
        .unwrap();
    assert_eq!(pulled, 5);
    assert!(cursor.is_some());
    assert_eq!(bob_todos.get_all_document_ids().await.unwrap().len(), 5);

    // Nothing new: the cursor holds and nothing transfers.
    let (pulled, cursor2) = bob_todos
        .pull_changes_from_cursor(&remote, cursor.as_deref(), 2)
        .await
        .unwrap();
    assert_eq!(pulled, 0);

    // New writes land after the cursor and are picked up incrementally.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let doc_id = alice_todos.create_document(todo("later")).await.unwrap();
    let (pulled, _) = bob_todos
        .pull_changes_from_cursor(&remote, cursor2.as_deref(), 2)
        .await
        .unwrap();
    assert_eq!(pulled, 1);
    assert_eq!(
        bob_todos.get_document(&doc_id).await.unwrap().get_str("title"),
        Some("later")
    );
}

#[tokio::test]
async fn engine_pull_and_push_through_remote_store() {
    let f = fixture().await;
    let alice_todos = f.alice.tenant.open_db("todos").await.unwrap();
    let doc_id = alice_todos.create_document(todo("Buy milk")).await.unwrap();

    let client = Arc::new(SyncClient::for_tenant(&f.bob, &f.base_url).unwrap());
    let remote = RemoteStore::new(client, "todos");

    // Pull: Bob's engine converges on Alice's document.
    let bob_todos = f.bob.open_db("todos").await.unwrap();
    let pulled = bob_todos.pull_changes_from(&remote).await.unwrap();
    assert_eq!(pulled, 1);
    assert_eq!(
        bob_todos.get_document(&doc_id).await.unwrap().get_str("title"),
        Some("Buy milk")
    );

    // Push: Bob's edit lands on the server and Alice observes it.
    bob_todos
        .change_document(&doc_id, |d| d.set("done", true))
        .await
        .unwrap();
    bob_todos.push_changes_to(&remote).await.unwrap();
    alice_todos.sync_store_changes().await.unwrap();
    assert_eq!(
        alice_todos.get_document(&doc_id).await.unwrap().get_bool("done"),
        Some(true)
    );

    // Converged: pulling again moves nothing.
    assert_eq!(bob_todos.pull_changes_from(&remote).await.unwrap(), 0);
}
