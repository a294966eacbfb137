//! In-memory metadata index shared by the store backends.
//!
//! Holds every entry's metadata keyed by id, the `(createdAt, id)` scan
//! order, a per-document posting list and the bloom filter. Backends keep
//! this consistent with their durable state; the index itself is never the
//! source of truth.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::Bound::{Excluded, Unbounded};

use crate::bloom::{BloomFilter, BloomSummary};
use crate::entry::{EntryType, StoreEntryMetadata};
use crate::store::{ResolveOptions, ScanCursor, ScanFilters, ScanPage};

#[derive(Debug)]
pub(crate) struct MetaIndex {
    by_id: HashMap<String, StoreEntryMetadata>,
    scan_order: BTreeSet<(i64, String)>,
    by_doc: HashMap<String, Vec<String>>,
    bloom: BloomFilter,
}

impl MetaIndex {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            scan_order: BTreeSet::new(),
            by_doc: HashMap::new(),
            bloom: BloomFilter::with_capacity(0),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&StoreEntryMetadata> {
        self.by_id.get(id)
    }

    /// Insert metadata. Returns false (and changes nothing) on a duplicate id.
    pub fn insert(&mut self, meta: StoreEntryMetadata) -> bool {
        if self.by_id.contains_key(&meta.id) {
            return false;
        }
        self.scan_order.insert(meta.scan_key());
        self.by_doc
            .entry(meta.doc_id.clone())
            .or_default()
            .push(meta.id.clone());
        self.bloom.insert(&meta.id);
        if self.bloom.needs_rebuild() {
            self.rebuild_bloom();
        }
        self.by_id.insert(meta.id.clone(), meta);
        true
    }

    fn rebuild_bloom(&mut self) {
        // Grown with headroom; an exact-sized rebuild would rebuild again
        // on the next insert.
        let mut bloom = BloomFilter::with_capacity(self.by_id.len() as u64 * 2);
        for id in self.by_id.keys() {
            bloom.insert(id);
        }
        self.bloom = bloom;
    }

    pub fn bloom_summary(&self) -> BloomSummary {
        self.bloom.to_summary()
    }

    /// All ids in scan order.
    pub fn all_ids(&self) -> Vec<String> {
        self.scan_order.iter().map(|(_, id)| id.clone()).collect()
    }

    /// Metadata not in `have_ids`, in scan order.
    pub fn find_new(&self, have_ids: &[String]) -> Vec<StoreEntryMetadata> {
        let have: HashSet<&str> = have_ids.iter().map(String::as_str).collect();
        self.scan_order
            .iter()
            .filter(|(_, id)| !have.contains(id.as_str()))
            .map(|(_, id)| self.by_id[id].clone())
            .collect()
    }

    /// Metadata for one document not in `have_ids`, in scan order.
    pub fn find_new_for_doc(&self, have_ids: &[String], doc_id: &str) -> Vec<StoreEntryMetadata> {
        let have: HashSet<&str> = have_ids.iter().map(String::as_str).collect();
        let Some(ids) = self.by_doc.get(doc_id) else {
            return Vec::new();
        };
        let mut found: Vec<StoreEntryMetadata> = ids
            .iter()
            .filter(|id| !have.contains(id.as_str()))
            .map(|id| self.by_id[id].clone())
            .collect();
        found.sort_by(|a, b| a.scan_key().cmp(&b.scan_key()));
        found
    }

    /// Metadata by type and inclusive creation-time range, in scan order.
    pub fn find_by_type(
        &self,
        entry_type: EntryType,
        from_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Vec<StoreEntryMetadata> {
        self.scan_order
            .iter()
            .map(|(_, id)| &self.by_id[id])
            .filter(|m| m.entry_type == entry_type)
            .filter(|m| from_ms.map_or(true, |f| m.created_at >= f))
            .filter(|m| until_ms.map_or(true, |u| m.created_at <= u))
            .cloned()
            .collect()
    }

    /// One page of the ordered scan, strictly after `cursor`.
    pub fn scan_after(
        &self,
        cursor: Option<&ScanCursor>,
        limit: usize,
        filters: Option<&ScanFilters>,
    ) -> ScanPage {
        let start = match cursor {
            Some(c) => Excluded((c.created_at, c.id.clone())),
            None => Unbounded,
        };

        let mut entries = Vec::new();
        let mut last_key: Option<(i64, String)> = None;
        let mut has_more = false;
        for (created_at, id) in self.scan_order.range((start, Unbounded)) {
            let meta = &self.by_id[id];
            if let Some(f) = filters {
                if !f.matches(meta) {
                    // Filtered-out entries still advance the cursor so the
                    // next page resumes past them.
                    last_key = Some((*created_at, id.clone()));
                    continue;
                }
            }
            if entries.len() == limit {
                has_more = true;
                break;
            }
            entries.push(meta.clone());
            last_key = Some((*created_at, id.clone()));
        }

        let next_cursor = last_key.map(|(created_at, id)| ScanCursor { created_at, id }.encode());
        ScanPage {
            entries,
            next_cursor,
            has_more,
        }
    }

    /// Backward BFS over dependency ids from `start_id`, exclusive of the
    /// start. Bounded by `options.limit`; single level when not transitive.
    pub fn resolve_dependencies(&self, start_id: &str, options: &ResolveOptions) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        seen.insert(start_id.to_string());

        if let Some(meta) = self.by_id.get(start_id) {
            queue.extend(meta.dependency_ids.iter().cloned());
        }

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(limit) = options.limit {
                if out.len() == limit {
                    break;
                }
            }
            if let Some(meta) = self.by_id.get(&id) {
                if options.transitive {
                    queue.extend(meta.dependency_ids.iter().cloned());
                }
            }
            out.push(id);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idcodec;

    fn meta(doc: &str, created_at: i64, hash: &str, deps: &[String]) -> StoreEntryMetadata {
        StoreEntryMetadata {
            entry_type: EntryType::DocChange,
            id: idcodec::doc_entry_id(doc, hash, deps),
            content_hash: "00".into(),
            doc_id: doc.to_string(),
            dependency_ids: deps
                .iter()
                .map(|d| idcodec::doc_entry_id(doc, d, &[]))
                .collect(),
            created_at,
            created_by_public_key: "pem".into(),
            decryption_key_id: "default".into(),
            original_size: 0,
            encrypted_size: 0,
        }
    }

    #[test]
    fn test_insert_dedups() {
        let mut idx = MetaIndex::new();
        let doc = idcodec::new_uuid7().to_string();
        let m = meta(&doc, 1, "aa", &[]);
        assert!(idx.insert(m.clone()));
        assert!(!idx.insert(m));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_scan_pages_are_disjoint_and_ordered() {
        let mut idx = MetaIndex::new();
        let doc = idcodec::new_uuid7().to_string();
        for i in 0..10 {
            idx.insert(meta(&doc, 100 + i, &format!("{:02x}", i), &[]));
        }

        let page1 = idx.scan_after(None, 4, None);
        assert_eq!(page1.entries.len(), 4);
        assert!(page1.has_more);

        let c = ScanCursor::decode(page1.next_cursor.as_deref().unwrap()).unwrap();
        let page2 = idx.scan_after(Some(&c), 100, None);
        assert_eq!(page2.entries.len(), 6);
        assert!(!page2.has_more);

        let ids1: Vec<_> = page1.entries.iter().map(|m| m.id.clone()).collect();
        let ids2: Vec<_> = page2.entries.iter().map(|m| m.id.clone()).collect();
        assert!(ids1.iter().all(|id| !ids2.contains(id)));
    }

    #[test]
    fn test_scan_filters_advance_cursor() {
        let mut idx = MetaIndex::new();
        let doc_a = idcodec::new_uuid7().to_string();
        let doc_b = idcodec::new_uuid7().to_string();
        for i in 0..4 {
            idx.insert(meta(&doc_a, 10 + i, &format!("a{:x}", i), &[]));
            idx.insert(meta(&doc_b, 10 + i, &format!("b{:x}", i), &[]));
        }
        let filters = ScanFilters {
            doc_id: Some(doc_b.clone()),
            ..Default::default()
        };
        let page = idx.scan_after(None, 100, Some(&filters));
        assert_eq!(page.entries.len(), 4);
        assert!(page.entries.iter().all(|m| m.doc_id == doc_b));
        assert!(!page.has_more);
    }

    #[test]
    fn test_resolve_dependencies_transitive() {
        let mut idx = MetaIndex::new();
        let doc = idcodec::new_uuid7().to_string();
        // c -> b -> a
        let a = meta(&doc, 1, "aa", &[]);
        let b = meta(&doc, 2, "bb", &["aa".into()]);
        let c = meta(&doc, 3, "cc", &["bb".into()]);
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        idx.insert(a);
        idx.insert(b);
        idx.insert(c.clone());

        let deps = idx.resolve_dependencies(&c.id, &ResolveOptions::default());
        assert_eq!(deps, vec![b_id.clone(), a_id]);

        let direct = idx.resolve_dependencies(
            &c.id,
            &ResolveOptions {
                transitive: false,
                limit: None,
            },
        );
        assert_eq!(direct, vec![b_id]);
    }

    #[test]
    fn test_find_new_excludes_known() {
        let mut idx = MetaIndex::new();
        let doc = idcodec::new_uuid7().to_string();
        let m1 = meta(&doc, 1, "aa", &[]);
        let m2 = meta(&doc, 2, "bb", &[]);
        idx.insert(m1.clone());
        idx.insert(m2.clone());

        let new = idx.find_new(&[m1.id.clone()]);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].id, m2.id);
    }
}
