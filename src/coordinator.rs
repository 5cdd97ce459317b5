//! Coordinator Glue: requests helper capacity from whatever
//! provisions compute in this deployment, and reports capacity signals
//! (spot interruption, autoscale rebalance) back out.
//!
//! Follows `mesh/mesh_coordinator.rs` and `mesh/service_discovery.rs`'s
//! pluggable-backend + zone/discovery shape: `MeshCoordinator` asks a
//! `ServiceDiscovery` for candidate nodes, and here a `Coordinator` asks a
//! `ProvisioningBackend` for candidate helpers, the same one-level
//! indirection. `anyhow` is used at this layer the same way it's used
//! for mesh coordination and config validation elsewhere, rather than in
//! the network/CAS hot path, which uses the structured `UbaError` enum.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// A helper the provisioning backend has brought up or is tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperNode {
    pub helper_id: Uuid,
    pub address: String,
    pub zone: String,
    pub capabilities: HelperCapabilities,
    pub status: HelperStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperCapabilities {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub is_spot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HelperStatus {
    Provisioning,
    Ready,
    Draining,
    Terminated,
}

/// A request to bring up more helper capacity. `zone` constrains placement
/// to a single availability zone so cross-zone CAS proxy traffic stays
/// rare.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub count: u32,
    pub zone: Option<String>,
    pub min_cpu_cores: u32,
    pub min_memory_mb: u64,
}

/// Signal a backend reports out-of-band: the host needs to know before
/// a helper disappears, not after (spot interruption, autoscale
/// rebalance recommendation).
#[derive(Debug, Clone)]
pub enum CapacitySignal {
    SpotInterruption { helper_id: Uuid, terminate_by: Instant },
    RebalanceRecommended { helper_id: Uuid },
    HelperLost { helper_id: Uuid },
}

/// Backend-agnostic provisioning seam; concrete backends (Horde queue,
/// Kubernetes job API, a flat SSH-managed pool) each implement this, the
/// same indirection used for `ServiceDiscovery` so the coordinator never
/// depends on a specific deployment target.
#[async_trait::async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn provision(&self, request: ProvisionRequest) -> Result<Vec<HelperNode>>;
    async fn decommission(&self, helper_id: Uuid) -> Result<()>;
    async fn poll_signals(&self) -> Result<Vec<CapacitySignal>>;
}

/// Central orchestrator: tracks known helpers, asks the backend for more
/// when the scheduler is starved, and retires helpers a signal marks as
/// going away. Grounded on `MeshCoordinator`'s
/// `RwLock<HashMap<Uuid, MeshNode>>` node table.
pub struct Coordinator {
    backend: Arc<dyn ProvisioningBackend>,
    helpers: RwLock<HashMap<Uuid, HelperNode>>,
    zone_discovery: Arc<dyn ZoneDiscovery>,
}

impl Coordinator {
    pub fn new(backend: Arc<dyn ProvisioningBackend>, zone_discovery: Arc<dyn ZoneDiscovery>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            helpers: RwLock::new(HashMap::new()),
            zone_discovery,
        })
    }

    pub async fn current_zone(&self) -> Result<String> {
        self.zone_discovery.current_zone().await
    }

    /// Requests `count` more helpers in `zone` (or the current zone if
    /// `None`), registers them, and returns the set brought up.
    pub async fn request_helpers(&self, mut request: ProvisionRequest) -> Result<Vec<HelperNode>> {
        if request.zone.is_none() {
            request.zone = Some(self.current_zone().await?);
        }
        let provisioned = self
            .backend
            .provision(request)
            .await
            .context("provisioning backend rejected the request")?;

        let mut helpers = self.helpers.write().await;
        for helper in &provisioned {
            info!(helper_id = %helper.helper_id, zone = %helper.zone, "helper provisioned");
            helpers.insert(helper.helper_id, helper.clone());
        }
        Ok(provisioned)
    }

    pub async fn decommission(&self, helper_id: Uuid) -> Result<()> {
        self.backend.decommission(helper_id).await?;
        self.helpers.write().await.remove(&helper_id);
        Ok(())
    }

    pub async fn helper_count(&self) -> usize {
        self.helpers.read().await.len()
    }

    pub async fn ready_helpers(&self) -> Vec<HelperNode> {
        self.helpers
            .read()
            .await
            .values()
            .filter(|h| h.status == HelperStatus::Ready)
            .cloned()
            .collect()
    }

    /// Polls the backend for out-of-band capacity signals and updates
    /// local status accordingly. A spot interruption or lost helper
    /// marks the node `Terminated` so the scheduler's placement decision
    /// stops routing work there; callers are expected to drain
    /// in-flight processes before `terminate_by`.
    pub async fn poll_signals(&self) -> Result<Vec<CapacitySignal>> {
        let signals = self.backend.poll_signals().await?;
        let mut helpers = self.helpers.write().await;
        for signal in &signals {
            match signal {
                CapacitySignal::SpotInterruption { helper_id, terminate_by } => {
                    warn!(helper_id = %helper_id, ?terminate_by, "spot interruption notice");
                    if let Some(h) = helpers.get_mut(helper_id) {
                        h.status = HelperStatus::Draining;
                    }
                }
                CapacitySignal::RebalanceRecommended { helper_id } => {
                    warn!(helper_id = %helper_id, "autoscale rebalance recommended");
                    if let Some(h) = helpers.get_mut(helper_id) {
                        h.status = HelperStatus::Draining;
                    }
                }
                CapacitySignal::HelperLost { helper_id } => {
                    warn!(helper_id = %helper_id, "helper lost");
                    helpers.remove(helper_id);
                }
            }
        }
        Ok(signals)
    }
}

/// Zone discovery: which availability zone is this host in, so the
/// coordinator can constrain provisioning to the same zone the storage
/// proxy already benefits from. Cloud backends answer this via the
/// instance metadata service; a fixed backend just returns a configured
/// string.
#[async_trait::async_trait]
pub trait ZoneDiscovery: Send + Sync {
    async fn current_zone(&self) -> Result<String>;
}

/// Always reports a fixed, operator-configured zone — used for on-prem
/// pools with no metadata service to query.
pub struct FixedZone(pub String);

#[async_trait::async_trait]
impl ZoneDiscovery for FixedZone {
    async fn current_zone(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Queries the cloud metadata service reachable at a well-known link-local
/// address. AWS and GCP both expose this; the URL path and header
/// requirements differ, so the caller supplies them.
pub struct MetadataServiceZone {
    client: reqwest::Client,
    url: String,
    header: Option<(&'static str, &'static str)>,
}

impl MetadataServiceZone {
    /// AWS IMDSv2 requires a short-lived token header; the simpler IMDSv1
    /// path works without one but some accounts disable it, so this reads
    /// the zone unauthenticated first and lets the caller swap in a
    /// token-fetching variant if that 401s in practice.
    pub fn aws() -> Self {
        Self {
            client: reqwest::Client::new(),
            url: "http://169.254.169.254/latest/meta-data/placement/availability-zone".to_string(),
            header: None,
        }
    }

    pub fn gcp() -> Self {
        Self {
            client: reqwest::Client::new(),
            url: "http://metadata.google.internal/computeMetadata/v1/instance/zone".to_string(),
            header: Some(("Metadata-Flavor", "Google")),
        }
    }
}

#[async_trait::async_trait]
impl ZoneDiscovery for MetadataServiceZone {
    async fn current_zone(&self) -> Result<String> {
        let mut req = self.client.get(&self.url).timeout(Duration::from_secs(2));
        if let Some((name, value)) = self.header {
            req = req.header(name, value);
        }
        let response = req.send().await.context("metadata service request failed")?;
        let text = response.text().await.context("metadata service response was not text")?;
        // GCP returns "projects/<n>/zones/<zone>"; AWS returns the zone
        // directly. Taking the last path segment handles both.
        let zone = text.rsplit('/').next().unwrap_or(&text).trim().to_string();
        if zone.is_empty() {
            return Err(anyhow!("metadata service returned an empty zone"));
        }
        Ok(zone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingBackend {
        provisioned: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ProvisioningBackend for CountingBackend {
        async fn provision(&self, request: ProvisionRequest) -> Result<Vec<HelperNode>> {
            let mut out = Vec::new();
            for _ in 0..request.count {
                let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
                out.push(HelperNode {
                    helper_id: Uuid::new_v4(),
                    address: format!("10.0.0.{n}:9000"),
                    zone: request.zone.clone().unwrap_or_default(),
                    capabilities: HelperCapabilities {
                        cpu_cores: request.min_cpu_cores,
                        memory_mb: request.min_memory_mb,
                        is_spot: false,
                    },
                    status: HelperStatus::Ready,
                });
            }
            Ok(out)
        }

        async fn decommission(&self, _helper_id: Uuid) -> Result<()> {
            Ok(())
        }

        async fn poll_signals(&self) -> Result<Vec<CapacitySignal>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn request_helpers_registers_and_counts_them() {
        let backend = Arc::new(CountingBackend { provisioned: AtomicU32::new(0) });
        let coordinator = Coordinator::new(backend, Arc::new(FixedZone("us-east-1a".to_string())));

        let helpers = coordinator
            .request_helpers(ProvisionRequest {
                count: 3,
                zone: None,
                min_cpu_cores: 4,
                min_memory_mb: 8192,
            })
            .await
            .unwrap();

        assert_eq!(helpers.len(), 3);
        assert_eq!(coordinator.helper_count().await, 3);
        assert!(helpers.iter().all(|h| h.zone == "us-east-1a"));
    }

    #[tokio::test]
    async fn decommission_removes_from_registry() {
        let backend = Arc::new(CountingBackend { provisioned: AtomicU32::new(0) });
        let coordinator = Coordinator::new(backend, Arc::new(FixedZone("eu-west-1a".to_string())));
        let helpers = coordinator
            .request_helpers(ProvisionRequest { count: 1, zone: None, min_cpu_cores: 1, min_memory_mb: 1024 })
            .await
            .unwrap();

        coordinator.decommission(helpers[0].helper_id).await.unwrap();
        assert_eq!(coordinator.helper_count().await, 0);
    }

    #[tokio::test]
    async fn poll_signals_marks_spot_interruption_as_draining() {
        use std::sync::Mutex as StdMutex;

        /// Provisions one helper, then reports a spot interruption for it
        /// on every `poll_signals` call, mirroring how a real cloud backend
        /// learns its own helper id only after provisioning succeeds.
        struct SignalBackend {
            helper_id: StdMutex<Option<Uuid>>,
        }

        #[async_trait::async_trait]
        impl ProvisioningBackend for SignalBackend {
            async fn provision(&self, request: ProvisionRequest) -> Result<Vec<HelperNode>> {
                let helper_id = Uuid::new_v4();
                *self.helper_id.lock().unwrap() = Some(helper_id);
                Ok(vec![HelperNode {
                    helper_id,
                    address: "10.0.0.1:9000".to_string(),
                    zone: request.zone.unwrap_or_default(),
                    capabilities: HelperCapabilities { cpu_cores: 4, memory_mb: 8192, is_spot: true },
                    status: HelperStatus::Ready,
                }])
            }
            async fn decommission(&self, _helper_id: Uuid) -> Result<()> {
                Ok(())
            }
            async fn poll_signals(&self) -> Result<Vec<CapacitySignal>> {
                let helper_id = self.helper_id.lock().unwrap().expect("provision runs before poll_signals");
                Ok(vec![CapacitySignal::SpotInterruption {
                    helper_id,
                    terminate_by: Instant::now() + Duration::from_secs(120),
                }])
            }
        }

        let backend = Arc::new(SignalBackend {
            helper_id: StdMutex::new(None),
        });
        let coordinator = Coordinator::new(backend, Arc::new(FixedZone("us-east-1a".to_string())));
        let helpers = coordinator
            .request_helpers(ProvisionRequest { count: 1, zone: None, min_cpu_cores: 1, min_memory_mb: 1 })
            .await
            .unwrap();
        let helper_id = helpers[0].helper_id;
        assert_eq!(coordinator.ready_helpers().await.len(), 1);

        let signals = coordinator.poll_signals().await.unwrap();
        assert!(matches!(
            signals.as_slice(),
            [CapacitySignal::SpotInterruption { helper_id: h, .. }] if *h == helper_id
        ));

        let ready = coordinator.ready_helpers().await;
        assert!(ready.is_empty());
    }
}
