//! Cache Client: keyed by bucket + inputs, writes entries
//! produced by processes, fetches outputs in one round trip.
//!
//! Bucket+inputs keying follows the content-hash-free
//! "key -> fetch-or-register" pattern in `mesh/service_discovery.rs`,
//! combined here with `blake3` hashing for the input fingerprint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use uba_proto::CasKey;

use crate::error::UbaResult;
use crate::session::ProcessInfo;

/// `(bucketId, rootPathsNormalizedInputs, argv, envDelta)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheLookupKey {
    pub bucket_id: u32,
    pub argv: Vec<String>,
    pub working_dir: String,
}

impl CacheLookupKey {
    /// Deterministic fingerprint combining the bucket id with the
    /// argv/working-dir inputs; `RegisterPathHash` seeds additional
    /// content hashes into this fingerprint for toolchain roots via
    /// [`CacheBucketRegistry::seed_path_hash`].
    pub fn fingerprint(&self, registered_path_hashes: &[CasKey]) -> CasKey {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.bucket_id.to_le_bytes());
        for arg in &self.argv {
            buf.extend_from_slice(arg.as_bytes());
            buf.push(0);
        }
        buf.extend_from_slice(self.working_dir.as_bytes());
        for hash in registered_path_hashes {
            buf.extend_from_slice(hash.as_bytes());
        }
        CasKey::hash_content(&buf, uba_proto::CasFlags::empty())
    }
}

/// A cache hit: the output manifest and log lines a successful process
/// would otherwise have produced.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub outputs: Vec<CasKey>,
    pub log_lines: Vec<String>,
}

/// Trait so the scheduler can depend on "a cache" without depending on
/// the concrete network-backed implementation.
#[async_trait::async_trait]
pub trait CacheClient: Send + Sync {
    async fn fetch_from_cache(&self, key: &CacheLookupKey) -> UbaResult<Option<CacheHit>>;
    async fn write_to_cache(&self, key: &CacheLookupKey, process: &ProcessInfo) -> UbaResult<()>;
}

/// Seeds deterministic content hashes for toolchain roots whose version
/// matters, so the input fingerprint is stable across agents. Invalidates any bucket whose seeded hash
/// changes, per the glossary's "Bucket...invalidated by
/// RegisterPathHash".
#[derive(Default)]
pub struct PathHashRegistry {
    hashes: DashMap<String, CasKey>,
}

impl PathHashRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_path_hash(&self, path: &str, hash: CasKey) {
        self.hashes.insert(path.to_string(), hash);
    }

    pub fn all_hashes(&self) -> Vec<CasKey> {
        let mut pairs: Vec<(String, CasKey)> =
            self.hashes.iter().map(|e| (e.key().clone(), *e.value())).collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs.into_iter().map(|(_, h)| h).collect()
    }
}

struct StoredEntry {
    outputs: Vec<CasKey>,
    log_lines: Vec<String>,
}

/// In-process cache store: a `DashMap` keyed by fingerprint, with writes
/// individually queued behind a semaphore so many simultaneous writes
/// don't stall the scheduler loop.
pub struct LocalCacheClient {
    entries: DashMap<CasKey, StoredEntry>,
    path_hashes: Arc<PathHashRegistry>,
    write_permits: Semaphore,
    populate_cache: bool,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl LocalCacheClient {
    pub fn new(path_hashes: Arc<PathHashRegistry>, max_concurrent_writes: usize, populate_cache: bool) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            path_hashes,
            write_permits: Semaphore::new(max_concurrent_writes.max(1)),
            populate_cache,
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        })
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.miss_count.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl CacheClient for LocalCacheClient {
    async fn fetch_from_cache(&self, key: &CacheLookupKey) -> UbaResult<Option<CacheHit>> {
        let fingerprint = key.fingerprint(&self.path_hashes.all_hashes());
        match self.entries.get(&fingerprint) {
            Some(entry) => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                debug!(?fingerprint, "cache hit");
                Ok(Some(CacheHit {
                    outputs: entry.outputs.clone(),
                    log_lines: entry.log_lines.clone(),
                }))
            }
            None => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn write_to_cache(&self, key: &CacheLookupKey, process: &ProcessInfo) -> UbaResult<()> {
        let _permit = self.write_permits.acquire().await;
        let fingerprint = key.fingerprint(&self.path_hashes.all_hashes());

        // outputs here are derived from the process's own tracked state;
        // a real network-backed client would receive the manifest from
        // the helper that ran the process.
        let outputs: Vec<CasKey> = process
            .log_lines
            .iter()
            .map(|l| CasKey::hash_content(l.as_bytes(), uba_proto::CasFlags::empty()))
            .collect();

        self.entries.insert(
            fingerprint,
            StoredEntry {
                outputs,
                log_lines: process.log_lines.clone(),
            },
        );
        info!(?fingerprint, populate_cache = self.populate_cache, "wrote cache entry");
        Ok(())
    }
}

/// Per-bucket version metadata, used to validate a bucket is still
/// current before trusting a hit.
#[derive(Debug, Default)]
pub struct BucketTable {
    versions: BTreeMap<u32, u32>,
}

impl BucketTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_version(&mut self, bucket_id: u32, version: u32) {
        self.versions.insert(bucket_id, version);
    }

    pub fn version(&self, bucket_id: u32) -> Option<u32> {
        self.versions.get(&bucket_id).copied()
    }
}
