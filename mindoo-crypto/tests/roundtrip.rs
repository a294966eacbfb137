//! Cross-primitive round trips: the full seal → sign → wrap → unwrap →
//! verify → open pipeline an entry goes through.

use mindoo_crypto::{aead, envelope, hash, sign, wrap};

#[test]
fn entry_pipeline_roundtrip() {
    // Local write: seal the change, sign the ciphertext.
    let doc_key = aead::generate_key().unwrap();
    let sealed = aead::seal_payload(&doc_key, b"{\"title\":\"Buy milk\"}").unwrap();
    let content_hash = hash::sha256_hex(&sealed);

    let sk = sign::generate_signing_key();
    let signature = sign::sign(&sk, &sealed);

    // Remote read: verify against the PEM form of the key, then decrypt.
    let pem = sign::verifying_key_to_pem(&sk.verifying_key()).unwrap();
    let vk = sign::verifying_key_from_pem(&pem).unwrap();
    assert!(sign::verify_ok(&vk, &sealed, &signature));
    assert_eq!(hash::sha256_hex(&sealed), content_hash);
    assert_eq!(
        aead::open_payload(&doc_key, &sealed).unwrap(),
        b"{\"title\":\"Buy milk\"}"
    );
}

#[test]
fn network_delivery_roundtrip() {
    // Server-side: wrap already-encrypted entry data to the caller.
    let doc_key = aead::generate_key().unwrap();
    let sealed = aead::seal_payload(&doc_key, b"change bytes").unwrap();

    let (caller_private, caller_public) = envelope::generate_encryption_keypair().unwrap();
    let wire = envelope::rsa_seal(&caller_public, &sealed).unwrap();

    // Client-side: unwrap the network layer, then the document layer.
    let inner = envelope::rsa_open(&caller_private, &wire).unwrap();
    assert_eq!(inner, sealed);
    assert_eq!(aead::open_payload(&doc_key, &inner).unwrap(), b"change bytes");
}

#[test]
fn keybag_persistence_roundtrip() {
    // A symmetric key wrapped under a password, as the join flow ships it.
    let tenant_key = aead::generate_key().unwrap();
    let wrapped = wrap::wrap_secret("share-password", &tenant_key).unwrap();

    let json = serde_json::to_string(&wrapped).unwrap();
    let restored: mindoo_crypto::EncryptedKey = serde_json::from_str(&json).unwrap();
    let unwrapped = wrap::unwrap_secret("share-password", &restored).unwrap();
    assert_eq!(unwrapped, tenant_key);
}
