//! On-disk store: append-only segmented write log plus a segmented
//! metadata index.
//!
//! Directory layout:
//! ```text
//! <dir>/
//!   manifest.json              store identity
//!   log/seg-00000000.log       full entries, length-prefixed JSON records
//!   meta/shard-00000000.json   metadata + log locations, one shard per batch
//!   meta/stats.json            compaction counters
//! ```
//!
//! Durability: `put_entries` appends and fsyncs the log, then writes a new
//! metadata shard (write-temp, fsync, rename) before returning. Recovery
//! truncates a torn record at the log tail, re-indexes log entries missing
//! from the shards, and quarantines unreadable shards (the index is then
//! rebuilt from the log). The store is the only writer to its directory.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::bloom::BloomSummary;
use crate::entry::{EntryType, StoreEntry, StoreEntryMetadata};
use crate::error::StoreError;
use crate::index::MetaIndex;
use crate::store::{
    CompactionStatus, ContentAddressedStore, ResolveOptions, ScanCursor, ScanFilters, ScanPage,
};

const LEN_PREFIX_BYTES: u64 = 4;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct FileStoreConfig {
    /// Roll the write log to a new segment past this size.
    pub segment_max_bytes: u64,
    /// Compact metadata shards when at least this many exist...
    pub compact_min_files: usize,
    /// ...and they hold at least this many bytes together.
    pub compact_max_bytes: u64,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: 8 * 1024 * 1024,
            compact_min_files: 8,
            compact_max_bytes: 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Persistent record shapes
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct Manifest {
    store_id: String,
    version: u32,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct EntryLocation {
    segment: u64,
    offset: u64,
    len: u32,
}

#[derive(Serialize, Deserialize)]
struct ShardRecord {
    meta: StoreEntryMetadata,
    #[serde(flatten)]
    location: EntryLocation,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct CompactionStats {
    total_compactions: u64,
    last_compaction_at: Option<i64>,
    reclaimed_bytes: u64,
}

#[derive(Debug)]
struct ShardFile {
    seq: u64,
    bytes: u64,
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FileStore {
    store_id: String,
    dir: PathBuf,
    config: FileStoreConfig,
    inner: RwLock<DiskInner>,
}

#[derive(Debug)]
struct DiskInner {
    index: MetaIndex,
    locations: HashMap<String, EntryLocation>,
    current_segment: u64,
    log_file: File,
    log_bytes: u64,
    next_shard: u64,
    shards: Vec<ShardFile>,
    stats: CompactionStats,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>, store_id: impl Into<String>) -> Result<Self, StoreError> {
        Self::open_with_config(dir, store_id, FileStoreConfig::default())
    }

    pub fn open_with_config(
        dir: impl Into<PathBuf>,
        store_id: impl Into<String>,
        config: FileStoreConfig,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        let store_id = store_id.into();
        fs::create_dir_all(dir.join("log"))?;
        fs::create_dir_all(dir.join("meta"))?;

        check_or_write_manifest(&dir, &store_id)?;
        let stats = load_stats(&dir);

        // Phase 1: metadata shards. A shard that fails to parse is moved
        // aside and the whole index is rebuilt from the log.
        let mut index = MetaIndex::new();
        let mut locations = HashMap::new();
        let mut shards = Vec::new();
        let mut next_shard = 0u64;
        let mut rebuild = false;

        for (seq, path) in numbered_files(&dir.join("meta"), "shard-", ".json")? {
            next_shard = next_shard.max(seq + 1);
            match read_shard(&path) {
                Ok(records) => {
                    let bytes = fs::metadata(&path)?.len();
                    if !rebuild {
                        for rec in records {
                            if index.insert(rec.meta.clone()) {
                                locations.insert(rec.meta.id.clone(), rec.location);
                            }
                        }
                    }
                    shards.push(ShardFile { seq, bytes });
                }
                Err(e) => {
                    tracing::warn!(shard = %path.display(), error = %e, "quarantining corrupt metadata shard");
                    fs::rename(&path, path.with_extension("json.quarantined"))?;
                    rebuild = true;
                }
            }
        }
        if rebuild {
            // Shards are untrustworthy as a set; start over from the log.
            for shard in &shards {
                let _ = fs::remove_file(shard_path(&dir, shard.seq));
            }
            shards.clear();
            index = MetaIndex::new();
            locations.clear();
        }

        // Phase 2: replay the log. Entries the shards don't know about are
        // re-indexed (crash between log append and shard write); a torn
        // record at the global tail is truncated.
        let segments = numbered_files(&dir.join("log"), "seg-", ".log")?;
        let mut recovered: Vec<ShardRecord> = Vec::new();
        let last_seq = segments.last().map(|(seq, _)| *seq);
        for (seq, path) in &segments {
            let is_last = Some(*seq) == last_seq;
            replay_segment(path, *seq, is_last, &mut |entry, location| {
                if index.insert(entry.metadata()) {
                    locations.insert(entry.id.clone(), location);
                    recovered.push(ShardRecord {
                        meta: entry.metadata(),
                        location,
                    });
                }
            })?;
        }

        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "re-indexed log entries missing from metadata shards");
            let bytes = write_shard(&dir, next_shard, &recovered)?;
            shards.push(ShardFile {
                seq: next_shard,
                bytes,
            });
            next_shard += 1;
        }

        // Phase 3: open the current segment for append.
        let current_segment = last_seq.unwrap_or(0);
        let seg = segment_path(&dir, current_segment);
        let log_file = OpenOptions::new().create(true).append(true).open(&seg)?;
        let log_bytes = log_file.metadata()?.len();

        Ok(Self {
            store_id,
            dir,
            config,
            inner: RwLock::new(DiskInner {
                index,
                locations,
                current_segment,
                log_file,
                log_bytes,
                next_shard,
                shards,
                stats,
            }),
        })
    }

    fn roll_segment(&self, inner: &mut DiskInner) -> Result<(), StoreError> {
        inner.log_file.sync_data()?;
        inner.current_segment += 1;
        let path = segment_path(&self.dir, inner.current_segment);
        inner.log_file = OpenOptions::new().create(true).append(true).open(path)?;
        inner.log_bytes = 0;
        Ok(())
    }

    fn maybe_compact(&self, inner: &mut DiskInner) -> Result<(), StoreError> {
        let total_bytes: u64 = inner.shards.iter().map(|s| s.bytes).sum();
        if inner.shards.len() < self.config.compact_min_files
            || total_bytes < self.config.compact_max_bytes
        {
            return Ok(());
        }

        let records: Vec<ShardRecord> = inner
            .index
            .all_ids()
            .into_iter()
            .map(|id| ShardRecord {
                meta: inner.index.get(&id).expect("indexed id").clone(),
                location: inner.locations[&id],
            })
            .collect();

        let seq = inner.next_shard;
        let new_bytes = write_shard(&self.dir, seq, &records)?;
        inner.next_shard += 1;

        // The consolidated shard is durable; the old ones can go.
        for shard in &inner.shards {
            let _ = fs::remove_file(shard_path(&self.dir, shard.seq));
        }
        inner.shards = vec![ShardFile {
            seq,
            bytes: new_bytes,
        }];

        inner.stats.total_compactions += 1;
        inner.stats.last_compaction_at = Some(now_ms());
        inner.stats.reclaimed_bytes += total_bytes.saturating_sub(new_bytes);
        persist_stats(&self.dir, &inner.stats)?;
        tracing::debug!(
            store = %self.store_id,
            reclaimed = total_bytes.saturating_sub(new_bytes),
            "compacted metadata shards"
        );
        Ok(())
    }

    fn read_entry_at(&self, location: EntryLocation) -> Result<StoreEntry, StoreError> {
        let path = segment_path(&self.dir, location.segment);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut buf = vec![0u8; location.len as usize];
        file.read_exact(&mut buf)?;
        serde_json::from_slice(&buf)
            .map_err(|e| StoreError::StoreCorruption(format!("log record unreadable: {}", e)))
    }
}

#[async_trait]
impl ContentAddressedStore for FileStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn put_entries(&self, entries: &[StoreEntry]) -> Result<(), StoreError> {
        for entry in entries {
            entry.validate()?;
        }
        let mut inner = self.inner.write().await;

        let mut fresh: Vec<&StoreEntry> = Vec::new();
        let mut batch_ids: HashMap<&str, ()> = HashMap::new();
        for entry in entries {
            if !inner.index.contains(&entry.id) && batch_ids.insert(&entry.id, ()).is_none() {
                fresh.push(entry);
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }

        // Append to the log, then fsync once for the batch.
        let mut records: Vec<ShardRecord> = Vec::new();
        for entry in &fresh {
            let json = serde_json::to_vec(entry)
                .map_err(|e| StoreError::Io(format!("serialize entry: {}", e)))?;
            if inner.log_bytes > 0
                && inner.log_bytes + LEN_PREFIX_BYTES + json.len() as u64
                    > self.config.segment_max_bytes
            {
                self.roll_segment(&mut inner)?;
            }
            let offset = inner.log_bytes + LEN_PREFIX_BYTES;
            inner.log_file.write_all(&(json.len() as u32).to_be_bytes())?;
            inner.log_file.write_all(&json)?;
            inner.log_bytes += LEN_PREFIX_BYTES + json.len() as u64;
            records.push(ShardRecord {
                meta: entry.metadata(),
                location: EntryLocation {
                    segment: inner.current_segment,
                    offset,
                    len: json.len() as u32,
                },
            });
        }
        inner.log_file.sync_data()?;

        // Durable shard before the batch becomes visible.
        let seq = inner.next_shard;
        let bytes = write_shard(&self.dir, seq, &records)?;
        inner.next_shard += 1;
        inner.shards.push(ShardFile { seq, bytes });

        for rec in records {
            inner.index.insert(rec.meta.clone());
            inner.locations.insert(rec.meta.id.clone(), rec.location);
        }

        self.maybe_compact(&mut inner)
    }

    async fn get_entries(&self, ids: &[String]) -> Result<Vec<StoreEntry>, StoreError> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for id in ids {
            let Some(location) = inner.locations.get(id) else {
                continue;
            };
            out.push(self.read_entry_at(*location)?);
        }
        Ok(out)
    }

    async fn find_new_entries(
        &self,
        have_ids: &[String],
    ) -> Result<Vec<StoreEntryMetadata>, StoreError> {
        Ok(self.inner.read().await.index.find_new(have_ids))
    }

    async fn find_new_entries_for_doc(
        &self,
        have_ids: &[String],
        doc_id: &str,
    ) -> Result<Vec<StoreEntryMetadata>, StoreError> {
        Ok(self.inner.read().await.index.find_new_for_doc(have_ids, doc_id))
    }

    async fn find_entries(
        &self,
        entry_type: EntryType,
        from_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<StoreEntryMetadata>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .index
            .find_by_type(entry_type, from_ms, until_ms))
    }

    async fn scan_entries_since(
        &self,
        cursor: Option<&str>,
        limit: usize,
        filters: Option<&ScanFilters>,
    ) -> Result<ScanPage, StoreError> {
        let decoded = cursor.map(ScanCursor::decode).transpose()?;
        Ok(self
            .inner
            .read()
            .await
            .index
            .scan_after(decoded.as_ref(), limit, filters))
    }

    async fn get_id_bloom_summary(&self) -> Result<BloomSummary, StoreError> {
        Ok(self.inner.read().await.index.bloom_summary())
    }

    async fn get_compaction_status(&self) -> Result<CompactionStatus, StoreError> {
        let inner = self.inner.read().await;
        Ok(CompactionStatus {
            total_entries: inner.index.len() as u64,
            total_compactions: inner.stats.total_compactions,
            last_compaction_at: inner.stats.last_compaction_at,
            segment_count: inner.shards.len() as u64,
            reclaimed_bytes: inner.stats.reclaimed_bytes,
        })
    }

    async fn resolve_dependencies(
        &self,
        start_id: &str,
        options: Option<&ResolveOptions>,
    ) -> Result<Vec<String>, StoreError> {
        let default = ResolveOptions::default();
        Ok(self
            .inner
            .read()
            .await
            .index
            .resolve_dependencies(start_id, options.unwrap_or(&default)))
    }

    async fn get_all_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.read().await.index.all_ids())
    }

    async fn has_entries(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter(|id| inner.index.contains(id))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join("log").join(format!("seg-{:08}.log", seq))
}

fn shard_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join("meta").join(format!("shard-{:08}.json", seq))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn check_or_write_manifest(dir: &Path, store_id: &str) -> Result<(), StoreError> {
    let path = dir.join("manifest.json");
    if path.exists() {
        let data = fs::read_to_string(&path)?;
        let manifest: Manifest = serde_json::from_str(&data)
            .map_err(|e| StoreError::StoreCorruption(format!("manifest unreadable: {}", e)))?;
        if manifest.store_id != store_id {
            return Err(StoreError::StoreCorruption(format!(
                "directory belongs to store '{}', not '{}'",
                manifest.store_id, store_id
            )));
        }
        return Ok(());
    }
    let manifest = Manifest {
        store_id: store_id.to_string(),
        version: 1,
    };
    atomic_write(&path, serde_json::to_string_pretty(&manifest).unwrap().as_bytes())
}

fn load_stats(dir: &Path) -> CompactionStats {
    fs::read_to_string(dir.join("meta").join("stats.json"))
        .ok()
        .and_then(|data| serde_json::from_str(&data).ok())
        .unwrap_or_default()
}

fn persist_stats(dir: &Path, stats: &CompactionStats) -> Result<(), StoreError> {
    atomic_write(
        &dir.join("meta").join("stats.json"),
        serde_json::to_string(stats).unwrap().as_bytes(),
    )
}

/// Write-temp, fsync, rename.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_data()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_shard(path: &Path) -> Result<Vec<ShardRecord>, StoreError> {
    let data = fs::read_to_string(path)?;
    serde_json::from_str(&data).map_err(|e| StoreError::StoreCorruption(e.to_string()))
}

fn write_shard(dir: &Path, seq: u64, records: &[ShardRecord]) -> Result<u64, StoreError> {
    let json = serde_json::to_vec(records).map_err(|e| StoreError::Io(e.to_string()))?;
    atomic_write(&shard_path(dir, seq), &json)?;
    Ok(json.len() as u64)
}

/// Numbered files with the given prefix/suffix, sorted by sequence number.
fn numbered_files(
    dir: &Path,
    prefix: &str,
    suffix: &str,
) -> Result<Vec<(u64, PathBuf)>, StoreError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(middle) = name.strip_prefix(prefix).and_then(|n| n.strip_suffix(suffix)) else {
            continue;
        };
        if let Ok(seq) = middle.parse::<u64>() {
            out.push((seq, entry.path()));
        }
    }
    out.sort_by_key(|(seq, _)| *seq);
    Ok(out)
}

/// Iterate a log segment. Torn trailing records are truncated when
/// `truncate_tail` is set (the newest segment); anywhere else they are
/// corruption.
fn replay_segment(
    path: &Path,
    segment: u64,
    truncate_tail: bool,
    on_entry: &mut dyn FnMut(StoreEntry, EntryLocation),
) -> Result<(), StoreError> {
    let data = fs::read(path)?;
    let mut offset = 0usize;
    loop {
        if offset == data.len() {
            return Ok(());
        }
        let torn_at = offset as u64;
        if data.len() - offset < LEN_PREFIX_BYTES as usize {
            return handle_torn(path, segment, torn_at, truncate_tail, "short length prefix");
        }
        let len = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        let body_start = offset + LEN_PREFIX_BYTES as usize;
        if data.len() - body_start < len {
            return handle_torn(path, segment, torn_at, truncate_tail, "short record body");
        }
        match serde_json::from_slice::<StoreEntry>(&data[body_start..body_start + len]) {
            Ok(entry) => {
                on_entry(
                    entry,
                    EntryLocation {
                        segment,
                        offset: body_start as u64,
                        len: len as u32,
                    },
                );
                offset = body_start + len;
            }
            Err(e) => {
                return handle_torn(
                    path,
                    segment,
                    torn_at,
                    truncate_tail,
                    &format!("unparseable record: {}", e),
                );
            }
        }
    }
}

fn handle_torn(
    path: &Path,
    segment: u64,
    offset: u64,
    truncate_tail: bool,
    reason: &str,
) -> Result<(), StoreError> {
    if truncate_tail {
        tracing::warn!(segment, offset, reason, "truncating torn record at log tail");
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(offset)?;
        file.sync_data()?;
        Ok(())
    } else {
        Err(StoreError::StoreCorruption(format!(
            "segment {} damaged mid-log at offset {}: {}",
            segment, offset, reason
        )))
    }
}
