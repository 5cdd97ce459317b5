//! S4: ten helpers in the same zone, behind one promoted proxy, all
//! request the same blob concurrently. The proxy issues exactly one
//! `FetchBegin` to the host, and every helper receives identical bytes.
//! The payload is scaled down from the original 100 MiB scenario to
//! keep the test fast; the coalescing behavior under test doesn't
//! depend on payload size.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uba_core::proxy::{HostFetcher, StorageProxy};
use uba_proto::{CasFlags, CasKey};

const HELPER_COUNT: usize = 10;

struct CountingHost {
    begin_calls: AtomicUsize,
    payload: Vec<u8>,
}

#[async_trait::async_trait]
impl HostFetcher for CountingHost {
    async fn fetch_begin(&self, _key: CasKey) -> uba_core::error::UbaResult<u64> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.payload.len() as u64)
    }

    async fn fetch_segment(&self, _key: CasKey, index: u32) -> uba_core::error::UbaResult<Vec<u8>> {
        let start = index as usize * uba_core::cas::MAX_BLOCK_SIZE;
        let end = (start + uba_core::cas::MAX_BLOCK_SIZE).min(self.payload.len());
        Ok(self.payload[start..end].to_vec())
    }
}

#[tokio::test]
async fn ten_helpers_in_a_zone_share_one_host_fetch() {
    let payload = vec![0x5Au8; 3 * uba_core::cas::MAX_BLOCK_SIZE + 1024];
    let host = Arc::new(CountingHost {
        begin_calls: AtomicUsize::new(0),
        payload: payload.clone(),
    });
    let proxy = StorageProxy::new(None, false);
    let key = CasKey::hash_content(&payload, CasFlags::empty());

    let mut handles = Vec::new();
    for _ in 0..HELPER_COUNT {
        let proxy = Arc::clone(&proxy);
        let host = Arc::clone(&host);
        handles.push(tokio::spawn(async move {
            proxy.fetch_begin(key, host.as_ref()).await.unwrap()
        }));
    }

    for handle in handles {
        let received = handle.await.unwrap();
        assert_eq!(received, payload, "every helper must receive bytes identical to the host's");
    }

    assert_eq!(
        host.begin_calls.load(Ordering::SeqCst),
        1,
        "the proxy must issue exactly one FetchBegin to the host for the shared key"
    );
}
