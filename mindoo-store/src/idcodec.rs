//! Deterministic entry-id construction and parsing.
//!
//! Grammar (bit-exact, shared by every peer):
//!
//! ```text
//! doc_entry_id  := docId "_d_" deps_fp "_" crdt_hash
//! deps_fp       := "0" | 8*HEXDIG
//! attachment_id := docId "_a_" file_uuid7 "_" base62(chunk_uuid7)
//! ```
//!
//! `docId` is a dashed UUIDv7 (36 chars); `crdt_hash` is lowercase hex.
//! Embedding the doc id and change hash makes ids self-describing, safe for
//! prefix scans, and identical across independent encoders of the same
//! change.

use std::sync::{Mutex, OnceLock};
use uuid::timestamp::context::ContextV7;
use uuid::{ClockSequence, Timestamp, Uuid};

pub use mindoo_crypto::hash::sha256_hex as content_hash;
use mindoo_crypto::hash::sha256_hex;

const UUID_LEN: usize = 36;
const DEPS_FP_LEN: usize = 8;

// ---------------------------------------------------------------------------
// UUIDv7
// ---------------------------------------------------------------------------

/// Wraps `ContextV7` in a `Mutex` so the shared counter context can live in a
/// `static` (its interior `Cell` storage is not otherwise `Sync`).
struct SharedContextV7(Mutex<ContextV7>);

impl ClockSequence for SharedContextV7 {
    type Output = u64;

    fn generate_sequence(&self, seconds: u64, subsec_nanos: u32) -> Self::Output {
        self.0.lock().unwrap().generate_sequence(seconds, subsec_nanos)
    }

    fn generate_timestamp_sequence(
        &self,
        seconds: u64,
        subsec_nanos: u32,
    ) -> (Self::Output, u64, u32) {
        self.0
            .lock()
            .unwrap()
            .generate_timestamp_sequence(seconds, subsec_nanos)
    }
}

static UUID_CONTEXT: OnceLock<SharedContextV7> = OnceLock::new();

/// A fresh UUIDv7. The shared counter context keeps ids generated within the
/// same millisecond monotonic.
pub fn new_uuid7() -> Uuid {
    let ctx = UUID_CONTEXT.get_or_init(|| SharedContextV7(Mutex::new(ContextV7::new())));
    Uuid::new_v7(Timestamp::now(ctx))
}

// ---------------------------------------------------------------------------
// Deps fingerprint
// ---------------------------------------------------------------------------

/// Fingerprint of a dependency-hash set: `"0"` when empty, else the first 8
/// hex chars of SHA-256 over the sorted, comma-joined list.
pub fn deps_fingerprint(dep_hashes: &[String]) -> String {
    if dep_hashes.is_empty() {
        return "0".into();
    }
    let mut sorted: Vec<&str> = dep_hashes.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let joined = sorted.join(",");
    sha256_hex(joined.as_bytes())[..DEPS_FP_LEN].to_string()
}

// ---------------------------------------------------------------------------
// Document entry ids
// ---------------------------------------------------------------------------

/// Build a document entry id.
pub fn doc_entry_id(doc_id: &str, crdt_hash: &str, dep_hashes: &[String]) -> String {
    format!("{}_d_{}_{}", doc_id, deps_fingerprint(dep_hashes), crdt_hash)
}

/// Parsed form of a document entry id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedDocEntryId {
    pub doc_id: String,
    pub deps_fp: String,
    pub crdt_hash: String,
}

/// Parse a document entry id. Partial: returns `None` on any deviation from
/// the grammar.
pub fn parse_doc_entry_id(id: &str) -> Option<ParsedDocEntryId> {
    let (doc_id, rest) = split_doc_prefix(id, "_d_")?;
    let (deps_fp, crdt_hash) = rest.split_once('_')?;
    let fp_ok = deps_fp == "0" || (deps_fp.len() == DEPS_FP_LEN && is_lower_hex(deps_fp));
    if !fp_ok || crdt_hash.is_empty() || !is_lower_hex(crdt_hash) {
        return None;
    }
    Some(ParsedDocEntryId {
        doc_id: doc_id.to_string(),
        deps_fp: deps_fp.to_string(),
        crdt_hash: crdt_hash.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Attachment chunk ids
// ---------------------------------------------------------------------------

/// Build an attachment chunk id. A fresh chunk UUIDv7 is generated when
/// `chunk_id` is `None`.
pub fn attachment_chunk_id(doc_id: &str, file_id: &Uuid, chunk_id: Option<&Uuid>) -> String {
    let chunk = chunk_id.copied().unwrap_or_else(new_uuid7);
    format!("{}_a_{}_{}", doc_id, file_id, base62_encode(chunk.as_u128()))
}

/// Parsed form of an attachment chunk id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedAttachmentChunkId {
    pub doc_id: String,
    pub file_id: Uuid,
    pub chunk_id: Uuid,
}

/// Parse an attachment chunk id. Partial.
pub fn parse_attachment_chunk_id(id: &str) -> Option<ParsedAttachmentChunkId> {
    let (doc_id, rest) = split_doc_prefix(id, "_a_")?;
    if rest.len() < UUID_LEN + 2 {
        return None;
    }
    let file_part = &rest[..UUID_LEN];
    let file_id = Uuid::try_parse(file_part).ok()?;
    if rest.as_bytes()[UUID_LEN] != b'_' {
        return None;
    }
    let chunk_part = &rest[UUID_LEN + 1..];
    let chunk_id = Uuid::from_u128(base62_decode(chunk_part)?);
    Some(ParsedAttachmentChunkId {
        doc_id: doc_id.to_string(),
        file_id,
        chunk_id,
    })
}

/// Whether `id` matches either entry-id form.
pub fn is_well_formed_entry_id(id: &str) -> bool {
    parse_doc_entry_id(id).is_some() || parse_attachment_chunk_id(id).is_some()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn split_doc_prefix<'a>(id: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    if id.len() < UUID_LEN + marker.len() {
        return None;
    }
    let (doc_id, rest) = id.split_at(UUID_LEN);
    Uuid::try_parse(doc_id).ok()?;
    rest.strip_prefix(marker).map(|tail| (doc_id, tail))
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

const BASE62_ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn base62_encode(mut value: u128) -> String {
    if value == 0 {
        return "0".into();
    }
    let mut buf = Vec::new();
    while value > 0 {
        buf.push(BASE62_ALPHABET[(value % 62) as usize]);
        value /= 62;
    }
    buf.reverse();
    String::from_utf8(buf).expect("base62 alphabet is ascii")
}

fn base62_decode(s: &str) -> Option<u128> {
    if s.is_empty() {
        return None;
    }
    let mut value: u128 = 0;
    for b in s.bytes() {
        let digit = BASE62_ALPHABET.iter().position(|&a| a == b)? as u128;
        value = value.checked_mul(62)?.checked_add(digit)?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_id() -> String {
        new_uuid7().to_string()
    }

    #[test]
    fn test_deps_fingerprint_empty_is_zero() {
        assert_eq!(deps_fingerprint(&[]), "0");
    }

    #[test]
    fn test_deps_fingerprint_order_independent() {
        let a = deps_fingerprint(&["bbb".into(), "aaa".into()]);
        let b = deps_fingerprint(&["aaa".into(), "bbb".into()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn test_deps_fingerprint_differs_on_set_change() {
        let a = deps_fingerprint(&["aaa".into()]);
        let b = deps_fingerprint(&["aaa".into(), "bbb".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_doc_entry_id_roundtrip() {
        let d = doc_id();
        let deps = vec!["0a0b".to_string(), "1c1d".to_string()];
        let id = doc_entry_id(&d, "cafebabe", &deps);
        let parsed = parse_doc_entry_id(&id).unwrap();
        assert_eq!(parsed.doc_id, d);
        assert_eq!(parsed.deps_fp, deps_fingerprint(&deps));
        assert_eq!(parsed.crdt_hash, "cafebabe");
    }

    #[test]
    fn test_doc_entry_id_no_deps_roundtrip() {
        let d = doc_id();
        let id = doc_entry_id(&d, "00ff", &[]);
        assert_eq!(id, format!("{}_d_0_00ff", d));
        assert_eq!(parse_doc_entry_id(&id).unwrap().deps_fp, "0");
    }

    #[test]
    fn test_doc_entry_id_is_deterministic() {
        let d = doc_id();
        let deps = vec!["x1".to_string()];
        assert_eq!(doc_entry_id(&d, "ab", &deps), doc_entry_id(&d, "ab", &deps));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_doc_entry_id("not-an-id").is_none());
        assert!(parse_doc_entry_id("").is_none());
        let d = doc_id();
        assert!(parse_doc_entry_id(&format!("{}_x_0_ab", d)).is_none());
        // uppercase hash is not in the grammar
        assert!(parse_doc_entry_id(&format!("{}_d_0_AB", d)).is_none());
        // 7-char fingerprint
        assert!(parse_doc_entry_id(&format!("{}_d_abcdefa_ab", d)).is_none());
    }

    #[test]
    fn test_attachment_chunk_id_roundtrip() {
        let d = doc_id();
        let file = new_uuid7();
        let chunk = new_uuid7();
        let id = attachment_chunk_id(&d, &file, Some(&chunk));
        let parsed = parse_attachment_chunk_id(&id).unwrap();
        assert_eq!(parsed.doc_id, d);
        assert_eq!(parsed.file_id, file);
        assert_eq!(parsed.chunk_id, chunk);
    }

    #[test]
    fn test_attachment_chunk_id_generates_chunk() {
        let d = doc_id();
        let file = new_uuid7();
        let a = attachment_chunk_id(&d, &file, None);
        let b = attachment_chunk_id(&d, &file, None);
        assert_ne!(a, b);
        assert!(parse_attachment_chunk_id(&a).is_some());
    }

    #[test]
    fn test_base62_roundtrip() {
        for v in [0u128, 1, 61, 62, 63, u64::MAX as u128, u128::MAX] {
            assert_eq!(base62_decode(&base62_encode(v)), Some(v));
        }
    }

    #[test]
    fn test_base62_rejects_invalid_chars() {
        assert_eq!(base62_decode("abc_def"), None);
        assert_eq!(base62_decode(""), None);
    }

    #[test]
    fn test_well_formed_discriminates_forms() {
        let d = doc_id();
        let file = new_uuid7();
        assert!(is_well_formed_entry_id(&doc_entry_id(&d, "ab", &[])));
        assert!(is_well_formed_entry_id(&attachment_chunk_id(&d, &file, None)));
        assert!(!is_well_formed_entry_id("garbage"));
    }

    #[test]
    fn test_uuid7_is_time_ordered() {
        let a = new_uuid7();
        let b = new_uuid7();
        assert!(a < b);
    }
}
