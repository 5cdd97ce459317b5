//! Storage Proxy: a helper promoted to relay CAS fetches for
//! other helpers in its zone, reducing host fan-out.
//!
//! The per-key `FileEntry`/`ActiveFetch` state machine is re-expressed
//! as one tokio task per `CasKey` under fetch rather than a
//! futex-guarded struct — the async runtime already serializes access
//! to a key's state via message passing, the same
//! broadcast-channel-per-event idiom `manager/core.rs` uses for
//! `ManagerEvent`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use uba_proto::CasKey;

use crate::cas::CasTable;
use crate::error::{CasError, UbaResult};

/// Per-key proxy state.
#[derive(Debug, Clone)]
enum KeyState {
    Unseen,
    Fetching,
    Available,
    Error(String),
}

/// One segment of a blob as it streams in from the host.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    Segment { key: CasKey, index: u32, data: Arc<Vec<u8>> },
    Done { key: CasKey },
    Failed { key: CasKey, reason: String },
}

struct KeyEntry {
    state: std::sync::Mutex<KeyState>,
    events: broadcast::Sender<ProxyEvent>,
    segments: std::sync::Mutex<Vec<Arc<Vec<u8>>>>,
}

/// The storage proxy itself: a per-zone relay that a host promotes the
/// first qualifying helper to run.
pub struct StorageProxy {
    keys: DashMap<CasKey, Arc<KeyEntry>>,
    local_storage: Option<CasTable>,
    use_local_storage: bool,
}

/// Callback the proxy uses to pull segments from the host — modeled as a
/// trait object rather than a concrete `NetworkClient` so the proxy's
/// state machine can be unit tested without a real connection.
#[async_trait::async_trait]
pub trait HostFetcher: Send + Sync {
    async fn fetch_begin(&self, key: CasKey) -> UbaResult<u64>;
    async fn fetch_segment(&self, key: CasKey, index: u32) -> UbaResult<Vec<u8>>;
}

impl StorageProxy {
    pub fn new(local_storage: Option<CasTable>, use_local_storage: bool) -> Arc<Self> {
        Arc::new(Self {
            keys: DashMap::new(),
            local_storage,
            use_local_storage,
        })
    }

    fn entry_for(&self, key: CasKey) -> Arc<KeyEntry> {
        self.keys
            .entry(key)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(64);
                Arc::new(KeyEntry {
                    state: std::sync::Mutex::new(KeyState::Unseen),
                    events: tx,
                    segments: std::sync::Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// `FetchBegin` from a helper: `Unseen` forwards to the
    /// host and transitions to `Fetching`; `Fetching` attaches the caller
    /// to the same in-flight promise; `Available`/`Error` answer
    /// immediately.
    pub async fn fetch_begin(
        &self,
        key: CasKey,
        host: &dyn HostFetcher,
    ) -> UbaResult<Vec<u8>> {
        if self.use_local_storage {
            if let Some(local) = &self.local_storage {
                if local.ensure_cas_file(&key) {
                    debug!(?key, "proxy served fetch from local storage, no host round trip");
                    return local.retrieve(&key).await.map(|v| v.as_bytes().to_vec());
                }
            }
        }

        let entry = self.entry_for(key);
        let should_fetch = {
            let mut state = entry.state.lock().unwrap();
            match &*state {
                KeyState::Unseen => {
                    *state = KeyState::Fetching;
                    true
                }
                _ => false,
            }
        };

        if should_fetch {
            let entry_clone = Arc::clone(&entry);
            let result = self.run_fetch(key, host, &entry_clone).await;
            let mut state = entry.state.lock().unwrap();
            *state = match &result {
                Ok(_) => KeyState::Available,
                Err(e) => KeyState::Error(e.to_string()),
            };
            let _ = entry.events.send(match &result {
                Ok(_) => ProxyEvent::Done { key },
                Err(e) => ProxyEvent::Failed { key, reason: e.to_string() },
            });
        }

        self.await_available(key, &entry).await
    }

    async fn run_fetch(&self, key: CasKey, host: &dyn HostFetcher, entry: &KeyEntry) -> UbaResult<()> {
        let total = host.fetch_begin(key).await?;
        let segment_count = ((total as usize).max(1) + crate::cas::MAX_BLOCK_SIZE - 1)
            / crate::cas::MAX_BLOCK_SIZE;

        for index in 0..segment_count as u32 {
            let segment = host.fetch_segment(key, index).await?;
            let data = Arc::new(segment);
            entry.segments.lock().unwrap().push(Arc::clone(&data));
            let _ = entry.events.send(ProxyEvent::Segment { key, index, data });
        }
        Ok(())
    }

    async fn await_available(&self, key: CasKey, entry: &KeyEntry) -> UbaResult<Vec<u8>> {
        loop {
            // Subscribe before inspecting state: a Done/Failed fired
            // between the check and the subscribe call would otherwise
            // never be observed, and recv() below would block forever.
            let mut rx = entry.events.subscribe();
            {
                let state = entry.state.lock().unwrap().clone();
                match state {
                    KeyState::Available => {
                        let segments = entry.segments.lock().unwrap();
                        let mut out = Vec::new();
                        for seg in segments.iter() {
                            out.extend_from_slice(seg);
                        }
                        return Ok(out);
                    }
                    KeyState::Error(reason) => return Err(CasError::Compression(reason).into()),
                    _ => {}
                }
            }
            match rx.recv().await {
                Ok(ProxyEvent::Done { key: k }) if k == key => continue,
                Ok(ProxyEvent::Failed { key: k, reason }) if k == key => {
                    return Err(CasError::Compression(reason).into())
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CasError::Missing(key).into())
                }
            }
        }
    }

    /// Number of active (non-terminal) keys — used by tests asserting
    /// coalescing.
    pub fn active_key_count(&self) -> usize {
        self.keys
            .iter()
            .filter(|e| matches!(*e.value().state.lock().unwrap(), KeyState::Fetching))
            .count()
    }

    /// `ReportBadProxy`: invalidates cached state for `key` so the next
    /// `fetch_begin` re-fetches from the host via a different path. When
    /// the host has no alternate proxy candidate it silently continues
    /// without a replacement — this proxy does not attempt to
    /// self-select a successor.
    pub fn invalidate(&self, key: CasKey) {
        if let Some((_, entry)) = self.keys.remove(&key) {
            warn!(?key, "proxy entry invalidated by bad-proxy report");
            let _ = entry.events.send(ProxyEvent::Failed {
                key,
                reason: "proxy invalidated".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHost {
        begin_calls: AtomicUsize,
        payload: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl HostFetcher for CountingHost {
        async fn fetch_begin(&self, _key: CasKey) -> UbaResult<u64> {
            self.begin_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.payload.len() as u64)
        }

        async fn fetch_segment(&self, _key: CasKey, index: u32) -> UbaResult<Vec<u8>> {
            let start = index as usize * crate::cas::MAX_BLOCK_SIZE;
            let end = (start + crate::cas::MAX_BLOCK_SIZE).min(self.payload.len());
            Ok(self.payload[start..end].to_vec())
        }
    }

    #[tokio::test]
    async fn coalesces_concurrent_fetches_of_the_same_key() {
        let host = Arc::new(CountingHost {
            begin_calls: AtomicUsize::new(0),
            payload: vec![9u8; 10_000],
        });
        let proxy = StorageProxy::new(None, false);
        let key = CasKey::hash_content(&host.payload, uba_proto::CasFlags::empty());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let proxy = Arc::clone(&proxy);
            let host = Arc::clone(&host);
            handles.push(tokio::spawn(async move {
                proxy.fetch_begin(key, host.as_ref()).await.unwrap()
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        assert_eq!(host.begin_calls.load(Ordering::SeqCst), 1);
        for r in &results {
            assert_eq!(r, &host.payload);
        }
    }

    #[tokio::test]
    async fn serves_from_local_storage_without_contacting_host() {
        let dir = tempfile::tempdir().unwrap();
        let local = CasTable::new(dir.path(), 10 * 1024 * 1024);
        let key = local.store_bytes(b"local blob", false, 0).await.unwrap();

        let host = Arc::new(CountingHost {
            begin_calls: AtomicUsize::new(0),
            payload: b"should not be used".to_vec(),
        });
        let proxy = StorageProxy::new(Some(local), true);
        let result = proxy.fetch_begin(key, host.as_ref()).await.unwrap();
        assert_eq!(result, b"local blob");
        assert_eq!(host.begin_calls.load(Ordering::SeqCst), 0);
    }
}
