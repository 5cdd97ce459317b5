//! Content-Addressed Storage: a content-hashed blob store on
//! disk, optionally Kraken/Oodle-style block-compressed (here: `zstd`,
//! a substitution recorded in DESIGN.md), LRU-capped by configured
//! capacity, with mmap views and coalesced concurrent fetches.
//!
//! The index (`CasTable`) follows the same `DashMap`-keyed registry
//! shape as `manager/core.rs`'s `active_files`; LRU eviction generalizes
//! `cleanup_expired_files`'s sweep from expiry-by-timestamp to
//! eviction-by-LRU-epoch under a byte budget. Blob views are backed by
//! `memmap2`, generalized from the single-purpose `MappedFile` in
//! manager/memory_map.rs.

use std::collections::BinaryHeap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use memmap2::Mmap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use uba_proto::{CasFlags, CasKey};

use crate::error::{CasError, UbaResult};

/// Decompressed blocks are capped at 256 KiB.
pub const MAX_BLOCK_SIZE: usize = 256 * 1024;

/// Fixed header prefixing every blob file: the raw (uncompressed)
/// content key, so a reader can validate the decompressed stream
/// independently of whether it was stored compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedFileHeader {
    pub raw_cas_key: CasKey,
}

impl CompressedFileHeader {
    pub const SIZE: usize = 20;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        *self.raw_cas_key.as_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes[..Self::SIZE]);
        Some(Self {
            raw_cas_key: CasKey::from_bytes(arr),
        })
    }
}

/// A row in the storage index. Exclusively owned by the
/// `CasTable` that created it; per-entry mutation is guarded by the
/// table's sharded lock (here: `DashMap`'s internal per-shard lock, plus
/// an explicit `Mutex` for fields mutated outside insert/remove).
pub struct CasEntry {
    pub key: CasKey,
    pub size_on_disk: u64,
    state: Mutex<CasEntryState>,
    lru_epoch: AtomicU64,
    ref_count: AtomicU64,
}

struct CasEntryState {
    verified: bool,
    disallowed: bool,
    dropped: bool,
}

impl CasEntry {
    fn new(key: CasKey, size_on_disk: u64, epoch: u64) -> Self {
        Self {
            key,
            size_on_disk,
            state: Mutex::new(CasEntryState {
                verified: false,
                disallowed: false,
                dropped: false,
            }),
            lru_epoch: AtomicU64::new(epoch),
            ref_count: AtomicU64::new(0),
        }
    }

    pub fn verified(&self) -> bool {
        self.state.lock().verified
    }

    pub fn disallowed(&self) -> bool {
        self.state.lock().disallowed
    }

    pub fn dropped(&self) -> bool {
        self.state.lock().dropped
    }

    pub fn mark_verified(&self) {
        self.state.lock().verified = true;
    }

    pub fn mark_disallowed(&self) {
        self.state.lock().disallowed = true;
    }

    pub fn mark_dropped(&self) {
        self.state.lock().dropped = true;
    }

    pub fn touch(&self, epoch: u64) {
        self.lru_epoch.store(epoch, Ordering::Relaxed);
    }

    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Relaxed)
    }

    fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    fn release_ref(&self) {
        self.ref_count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// RAII guard keeping a `CasEntry`'s ref count non-zero so it can't be
/// evicted while held.
pub struct CasEntryRef {
    table: Arc<CasTableInner>,
    key: CasKey,
}

impl Drop for CasEntryRef {
    fn drop(&mut self) {
        if let Some(entry) = self.table.entries.get(&self.key) {
            entry.release_ref();
        }
    }
}

/// A blob view returned by `MapView`/`Retrieve` — either a decompressed
/// in-memory buffer or an mmap'd raw file, depending on how it was
/// stored.
pub enum MappedView {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl MappedView {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MappedView::Owned(v) => v,
            MappedView::Mapped(m) => &m[..],
        }
    }
}

/// The coalescing state for one in-flight `StoreFile`/fetch, so
/// parallel callers for the same key share one disk operation: only one
/// in-flight fetch per `CasKey`.
enum FetchState {
    InProgress(Arc<Notify>),
    Done(UbaResult<()>),
}

struct CasTableInner {
    entries: DashMap<CasKey, Arc<CasEntry>>,
    total_bytes: AtomicU64,
    lru_clock: AtomicU64,
    capacity_bytes: u64,
    directory: PathBuf,
    in_flight: DashMap<CasKey, Arc<Mutex<FetchState>>>,
}

/// Mapping from `CasKey` to `CasEntry`, plus total bytes stored and an
/// LRU ordering. Persisted between runs via
/// `LoadCasTable`/`SaveCasTable`.
#[derive(Clone)]
pub struct CasTable {
    inner: Arc<CasTableInner>,
}

/// Serialized row format for `SaveCasTable`/`LoadCasTable`: one fixed
/// record per entry so saving then reloading is byte-identical.
struct SerializedRow {
    key: CasKey,
    size_on_disk: u64,
    verified: bool,
    disallowed: bool,
    dropped: bool,
    lru_epoch: u64,
}

impl CasTable {
    pub fn new(directory: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        Self {
            inner: Arc::new(CasTableInner {
                entries: DashMap::new(),
                total_bytes: AtomicU64::new(0),
                lru_clock: AtomicU64::new(0),
                capacity_bytes,
                directory: directory.into(),
                in_flight: DashMap::new(),
            }),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.total_bytes.load(Ordering::Relaxed)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.inner.capacity_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn path_for(&self, key: &CasKey) -> PathBuf {
        let hex: String = key.hash_bytes().iter().map(|b| format!("{:02x}", b)).collect();
        self.inner.directory.join(&hex[..2]).join(&hex)
    }

    fn next_epoch(&self) -> u64 {
        self.inner.lru_clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Evicts least-recently-used entries until `extra_bytes` fits under
    /// capacity. Never touches an entry with a non-zero ref count or one
    /// already `dropped`.
    fn evict_for_space(&self, extra_bytes: u64) {
        let mut candidates: BinaryHeap<(std::cmp::Reverse<u64>, CasKey)> = BinaryHeap::new();
        for entry in self.inner.entries.iter() {
            if entry.ref_count() == 0 && !entry.dropped() {
                candidates.push((
                    std::cmp::Reverse(entry.lru_epoch.load(Ordering::Relaxed)),
                    *entry.key(),
                ));
            }
        }

        while self.inner.total_bytes.load(Ordering::Relaxed) + extra_bytes > self.inner.capacity_bytes {
            let Some((_, key)) = candidates.pop() else {
                warn!("cas capacity exceeded and no evictable entries remain");
                break;
            };
            if let Some((_, entry)) = self.inner.entries.remove(&key) {
                let path = self.path_for(&key);
                let _ = std::fs::remove_file(&path);
                self.inner.total_bytes.fetch_sub(entry.size_on_disk, Ordering::Relaxed);
                debug!(?key, "evicted cas entry for capacity");
            }
        }
    }

    /// `StoreFile(path) -> CasKey`. Hashes the raw content
    /// streaming, then writes either the raw bytes or the block-framed
    /// compressed layout.
    pub async fn store_file(
        &self,
        path: impl AsRef<Path>,
        compressed: bool,
        compression_level: i32,
    ) -> UbaResult<CasKey> {
        let bytes = tokio::fs::read(path.as_ref()).await.map_err(CasError::Io)?;
        self.store_bytes(&bytes, compressed, compression_level).await
    }

    pub async fn store_bytes(
        &self,
        bytes: &[u8],
        compressed: bool,
        compression_level: i32,
    ) -> UbaResult<CasKey> {
        let flags = if compressed {
            CasFlags::empty().with(CasFlags::STORED_COMPRESSED)
        } else {
            CasFlags::empty()
        };
        let key = CasKey::hash_content(bytes, flags);

        // coalesce concurrent stores of the same content.
        let slot = self
            .inner
            .in_flight
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(FetchState::Done(Ok(())))))
            .clone();

        {
            let guard = slot.lock();
            if let FetchState::Done(Ok(())) = &*guard {
                if self.inner.entries.contains_key(&key) {
                    if let Some(entry) = self.inner.entries.get(&key) {
                        entry.touch(self.next_epoch());
                    }
                    return Ok(key);
                }
            }
        }

        let encoded = if compressed {
            encode_compressed(&key, bytes, compression_level)?
        } else {
            encode_raw(&key, bytes)
        };

        let path = self.path_for(&key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(CasError::Io)?;
        }

        self.evict_for_space(encoded.len() as u64);
        tokio::fs::write(&path, &encoded).await.map_err(CasError::Io)?;

        let entry = Arc::new(CasEntry::new(key, encoded.len() as u64, self.next_epoch()));
        entry.mark_verified();
        self.inner.entries.insert(key, entry);
        self.inner.total_bytes.fetch_add(encoded.len() as u64, Ordering::Relaxed);

        info!(?key, bytes = encoded.len(), compressed, "stored cas blob");
        Ok(key)
    }

    /// `Retrieve(casKey, hint) -> MappedView`. Corrupted fragments cause
    /// the local entry to be deleted so a caller retries; this
    /// local-only primitive doesn't itself perform the host retry,
    /// callers layer that in by retrying once against the host directly.
    pub async fn retrieve(&self, key: &CasKey) -> UbaResult<MappedView> {
        let entry = self
            .inner
            .entries
            .get(key)
            .ok_or(CasError::Missing(*key))?
            .clone();
        if entry.disallowed() {
            return Err(CasError::Disallowed(*key).into());
        }
        entry.touch(self.next_epoch());

        let path = self.path_for(key);
        let raw = tokio::fs::read(&path).await.map_err(|_| CasError::Missing(*key))?;

        let decoded = if key.flags().is_stored_compressed() {
            decode_compressed(&raw)?
        } else {
            decode_raw(&raw)?
        };

        let digest_flags = key.flags();
        let expected = CasKey::hash_content(&decoded, digest_flags);
        if !expected.content_eq(key) {
            self.inner.entries.remove(key);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(CasError::HashMismatch(*key).into());
        }

        Ok(MappedView::Owned(decoded))
    }

    /// `MapView(casKey, hint) -> MappedView` via mmap rather than a
    /// full read, for large blobs the caller only needs to view.
    pub fn map_view(&self, key: &CasKey) -> UbaResult<MappedView> {
        let entry = self.inner.entries.get(key).ok_or(CasError::Missing(*key))?;
        if entry.disallowed() {
            return Err(CasError::Disallowed(*key).into());
        }
        let path = self.path_for(key);
        let file = std::fs::File::open(&path).map_err(|_| CasError::Missing(*key))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(CasError::Io)?;
        Ok(MappedView::Mapped(mmap))
    }

    /// `EnsureCasFile(casKey)`: true if the blob is present on disk and
    /// not disallowed/dropped, without reading its contents.
    pub fn ensure_cas_file(&self, key: &CasKey) -> bool {
        self.inner
            .entries
            .get(key)
            .map(|e| !e.disallowed() && !e.dropped())
            .unwrap_or(false)
    }

    /// `CopyOrLink(casKey, destPath, attrs)`: materializes a blob at
    /// `dest`. Always a copy here — the on-disk blob carries the
    /// raw/compressed framing header, so it can't be hardlinked directly
    /// into place the way a plain-content cache could.
    pub async fn copy_or_link(&self, key: &CasKey, dest: impl AsRef<Path>) -> UbaResult<()> {
        let view = self.retrieve(key).await?;
        if let Some(parent) = dest.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await.map_err(CasError::Io)?;
        }
        tokio::fs::write(dest.as_ref(), view.as_bytes()).await.map_err(CasError::Io)?;
        Ok(())
    }

    /// Takes out an RAII ref keeping `key` pinned against eviction.
    pub fn pin(&self, key: &CasKey) -> Option<CasEntryRef> {
        let entry = self.inner.entries.get(key)?;
        entry.add_ref();
        Some(CasEntryRef {
            table: Arc::clone(&self.inner),
            key: *key,
        })
    }

    pub fn mark_disallowed(&self, key: &CasKey) {
        if let Some(entry) = self.inner.entries.get(key) {
            entry.mark_disallowed();
        }
    }

    /// `DeleteAllCas()`: wipes the on-disk store and the in-memory index.
    pub async fn delete_all_cas(&self) -> UbaResult<()> {
        self.inner.entries.clear();
        self.inner.total_bytes.store(0, Ordering::Relaxed);
        if tokio::fs::metadata(&self.inner.directory).await.is_ok() {
            tokio::fs::remove_dir_all(&self.inner.directory).await.map_err(CasError::Io)?;
        }
        tokio::fs::create_dir_all(&self.inner.directory).await.map_err(CasError::Io)?;
        Ok(())
    }

    /// `CheckCasContent()`: re-hashes every entry's on-disk bytes and
    /// marks any mismatch `dropped`, returning the count of bad entries.
    pub async fn check_cas_content(&self) -> UbaResult<usize> {
        let mut bad = 0usize;
        let keys: Vec<CasKey> = self.inner.entries.iter().map(|e| *e.key()).collect();
        for key in keys {
            if self.retrieve(&key).await.is_err() {
                if let Some(entry) = self.inner.entries.get(&key) {
                    entry.mark_dropped();
                }
                bad += 1;
            }
        }
        Ok(bad)
    }

    /// `TraverseAllCasFiles(cb)`.
    pub fn traverse_all_cas_files(&self, mut cb: impl FnMut(&CasKey, &CasEntry)) {
        for entry in self.inner.entries.iter() {
            cb(entry.key(), entry.value());
        }
    }

    fn snapshot_rows(&self) -> Vec<SerializedRow> {
        let mut rows: Vec<SerializedRow> = self
            .inner
            .entries
            .iter()
            .map(|e| SerializedRow {
                key: *e.key(),
                size_on_disk: e.size_on_disk,
                verified: e.verified(),
                disallowed: e.disallowed(),
                dropped: e.dropped(),
                lru_epoch: e.lru_epoch.load(Ordering::Relaxed),
            })
            .collect();
        rows.sort_by_key(|r| *r.key.as_bytes());
        rows
    }

    /// `SaveCasTable()`: a fixed binary record per entry, sorted by key
    /// so repeated saves of unchanged state are byte-identical.
    pub fn save_cas_table(&self, path: impl AsRef<Path>) -> UbaResult<()> {
        let rows = self.snapshot_rows();
        let mut out = Vec::with_capacity(rows.len() * 45 + 8);
        out.extend_from_slice(&(rows.len() as u64).to_le_bytes());
        for row in rows {
            out.extend_from_slice(row.key.as_bytes());
            out.extend_from_slice(&row.size_on_disk.to_le_bytes());
            out.push((row.verified as u8) | ((row.disallowed as u8) << 1) | ((row.dropped as u8) << 2));
            out.extend_from_slice(&row.lru_epoch.to_le_bytes());
        }
        let mut file = std::fs::File::create(path.as_ref()).map_err(CasError::Io)?;
        file.write_all(&out).map_err(CasError::Io)?;
        Ok(())
    }

    /// `LoadCasTable()`: rebuilds the index from a file written by
    /// [`CasTable::save_cas_table`].
    pub fn load_cas_table(&self, path: impl AsRef<Path>) -> UbaResult<()> {
        let mut file = std::fs::File::open(path.as_ref()).map_err(CasError::Io)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(CasError::Io)?;
        if buf.len() < 8 {
            return Ok(());
        }
        let count = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
        let mut pos = 8usize;
        let mut total = 0u64;
        for _ in 0..count {
            if pos + 20 + 8 + 1 + 8 > buf.len() {
                break;
            }
            let mut key_bytes = [0u8; 20];
            key_bytes.copy_from_slice(&buf[pos..pos + 20]);
            let key = CasKey::from_bytes(key_bytes);
            pos += 20;
            let size_on_disk = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let flags = buf[pos];
            pos += 1;
            let epoch = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;

            let entry = CasEntry::new(key, size_on_disk, epoch);
            if flags & 0b001 != 0 {
                entry.mark_verified();
            }
            if flags & 0b010 != 0 {
                entry.mark_disallowed();
            }
            if flags & 0b100 != 0 {
                entry.mark_dropped();
            }
            total += size_on_disk;
            self.inner.entries.insert(key, Arc::new(entry));
        }
        self.inner.total_bytes.store(total, Ordering::Relaxed);
        Ok(())
    }
}

fn encode_raw(key: &CasKey, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CompressedFileHeader::SIZE + 8 + bytes.len());
    out.extend_from_slice(&CompressedFileHeader { raw_cas_key: *key }.encode());
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
    out
}

fn decode_raw(raw: &[u8]) -> UbaResult<Vec<u8>> {
    let header = CompressedFileHeader::decode(raw).ok_or_else(|| {
        CasError::Compression("raw blob shorter than its header".to_string())
    })?;
    let rest = &raw[CompressedFileHeader::SIZE..];
    if rest.len() < 8 {
        return Err(CasError::Compression("raw blob missing size field".to_string()).into());
    }
    let size = u64::from_le_bytes(rest[0..8].try_into().unwrap()) as usize;
    let data = &rest[8..];
    if data.len() != size {
        return Err(CasError::HashMismatch(header.raw_cas_key).into());
    }
    Ok(data.to_vec())
}

fn encode_compressed(key: &CasKey, bytes: &[u8], level: i32) -> UbaResult<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&CompressedFileHeader { raw_cas_key: *key }.encode());
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());

    for chunk in bytes.chunks(MAX_BLOCK_SIZE) {
        let compressed = zstd::encode_all(chunk, level)
            .map_err(|e| CasError::Compression(e.to_string()))?;
        out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        out.extend_from_slice(&compressed);
    }
    Ok(out)
}

fn decode_compressed(raw: &[u8]) -> UbaResult<Vec<u8>> {
    if raw.len() < CompressedFileHeader::SIZE + 8 {
        return Err(CasError::Compression("compressed blob truncated".to_string()).into());
    }
    let total_size = u64::from_le_bytes(
        raw[CompressedFileHeader::SIZE..CompressedFileHeader::SIZE + 8]
            .try_into()
            .unwrap(),
    ) as usize;
    let mut out = Vec::with_capacity(total_size);
    let mut pos = CompressedFileHeader::SIZE + 8;

    while pos < raw.len() {
        if pos + 8 > raw.len() {
            return Err(CasError::Compression("truncated block header".to_string()).into());
        }
        let comp_size = u32::from_le_bytes(raw[pos..pos + 4].try_into().unwrap()) as usize;
        let decomp_size = u32::from_le_bytes(raw[pos + 4..pos + 8].try_into().unwrap()) as usize;
        pos += 8;
        if pos + comp_size > raw.len() {
            return Err(CasError::Compression("truncated block body".to_string()).into());
        }
        let block = &raw[pos..pos + comp_size];
        pos += comp_size;

        let decompressed = zstd::decode_all(block).map_err(|e| CasError::Compression(e.to_string()))?;
        if decompressed.len() != decomp_size {
            return Err(CasError::Compression("block decompressed to unexpected size".to_string()).into());
        }
        out.extend_from_slice(&decompressed);
    }

    if out.len() != total_size {
        return Err(CasError::Compression("total decompressed size mismatch".to_string()).into());
    }
    Ok(out)
}
