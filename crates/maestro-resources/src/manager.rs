use crate::autoscale::{AutoScaleConfig, ScaleEvent, ScalingHandler};
use crate::node::{NodeDriver, NodeStatus, ResourceNode, CAPACITY_EPSILON};
use crate::strategy::{choose, score_node, AllocationStrategy, NodeHistory, NodeScore};
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult, Priority, ResourceRequest, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resource manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    /// Node selection strategy.
    pub strategy: AllocationStrategy,
    /// How often expired allocations are reclaimed.
    #[serde(with = "maestro_core::duration_ms")]
    pub sweep_interval: Duration,
    /// Auto-scaling thresholds.
    pub autoscale: AutoScaleConfig,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            strategy: AllocationStrategy::FirstFit,
            sweep_interval: Duration::from_secs(5),
            autoscale: AutoScaleConfig::default(),
        }
    }
}

/// Whether an allocation holds capacity as a reservation or as an active grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationState {
    /// Held by `reserve` until committed or released.
    Reserved,
    /// Granted by `allocate` or `commit`.
    Active,
}

/// A granted line item of a [`ResourceRequest`] on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// Allocation id.
    pub id: Uuid,
    /// Id of the request this line item belongs to.
    pub request_id: Uuid,
    /// Who asked for the capacity.
    pub requester_id: String,
    /// Node holding the capacity.
    pub node_id: String,
    /// Kind of capacity held.
    pub resource_type: ResourceType,
    /// Amount held.
    pub amount: f64,
    /// Reservation or active grant.
    pub state: AllocationState,
    /// Priority of the originating request.
    pub priority: Priority,
    /// When the capacity was granted.
    pub allocated_at: DateTime<Utc>,
    /// Lease end; reclaimed by the expiry sweep once passed.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResourceAllocation {
    /// Whether the lease ended at or before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Per-resource-type usage figures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Total capacity of online and draining nodes.
    pub capacity: f64,
    /// Amount allocated.
    pub allocated: f64,
    /// Amount reserved.
    pub reserved: f64,
    /// `(allocated + reserved) / capacity`.
    pub utilization: f64,
}

/// Snapshot of the ledger for monitoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// Registered nodes.
    pub nodes: usize,
    /// Nodes accepting new allocations.
    pub online_nodes: usize,
    /// Outstanding allocations and reservations.
    pub active_allocations: usize,
    /// Requests granted since start.
    pub granted_requests: u64,
    /// Requests refused since start.
    pub failed_requests: u64,
    /// Allocations reclaimed after their lease ended.
    pub reclaimed_allocations: u64,
    /// Usage per resource type.
    pub by_type: BTreeMap<ResourceType, ResourceUsage>,
}

#[derive(Default)]
pub(crate) struct Ledger {
    pub(crate) nodes: Vec<ResourceNode>,
    allocations: HashMap<Uuid, ResourceAllocation>,
    history: HashMap<String, NodeHistory>,
    granted_requests: u64,
    failed_requests: u64,
    reclaimed_allocations: u64,
}

impl Ledger {
    fn node_index(&self, node_id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == node_id)
    }

    /// Pick one node per line item without mutating anything.
    fn place(
        &self,
        strategy: AllocationStrategy,
        request: &ResourceRequest,
    ) -> Result<Vec<(usize, ResourceType, f64)>, String> {
        let mut pending: HashMap<(usize, ResourceType), f64> = HashMap::new();
        let mut placement = Vec::new();

        for spec in request.resources.iter().filter(|s| s.amount > 0.0) {
            let candidates: Vec<NodeScore> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| node.accepts_allocations())
                .filter_map(|(index, node)| {
                    let earmarked = pending
                        .get(&(index, spec.resource_type))
                        .copied()
                        .unwrap_or(0.0);
                    let fits = node.available(spec.resource_type) - earmarked + CAPACITY_EPSILON
                        >= spec.amount;
                    fits.then(|| {
                        let history = self.history.get(&node.id).copied().unwrap_or_default();
                        score_node(index, node, history, spec.resource_type, spec.amount, earmarked)
                    })
                })
                .collect();

            let Some(best) = choose(strategy, &candidates) else {
                return Err(format!(
                    "no node can provide {} {}",
                    spec.amount, spec.resource_type
                ));
            };
            *pending.entry((best.index, spec.resource_type)).or_insert(0.0) += spec.amount;
            placement.push((best.index, spec.resource_type, spec.amount));
        }
        Ok(placement)
    }

    fn apply(&mut self, index: usize, state: AllocationState, resource_type: ResourceType, delta: f64) {
        let node = &mut self.nodes[index];
        match state {
            AllocationState::Active => node.adjust_allocated(resource_type, delta),
            AllocationState::Reserved => node.adjust_reserved(resource_type, delta),
        }
    }

    fn remove(&mut self, allocation_id: Uuid) -> Option<ResourceAllocation> {
        let allocation = self.allocations.remove(&allocation_id)?;
        if let Some(index) = self.node_index(&allocation.node_id) {
            self.apply(
                index,
                allocation.state,
                allocation.resource_type,
                -allocation.amount,
            );
        }
        Some(allocation)
    }
}

/// Capacity ledger across resource nodes.
///
/// Every allocate/reserve/commit/release sequence runs under one async lock,
/// so concurrent requests can never double-book capacity.
pub struct ResourceManager {
    config: ResourceManagerConfig,
    ledger: Mutex<Ledger>,
    driver: Option<Arc<dyn NodeDriver>>,
    pub(crate) scale_tx: broadcast::Sender<ScaleEvent>,
    pub(crate) scaling_handler: Option<Arc<dyn ScalingHandler>>,
    pub(crate) last_scale: parking_lot::Mutex<HashMap<ResourceType, Instant>>,
}

impl ResourceManager {
    /// Create a manager with no nodes.
    pub fn new(config: ResourceManagerConfig) -> Self {
        let (scale_tx, _) = broadcast::channel(64);
        Self {
            config,
            ledger: Mutex::new(Ledger::default()),
            driver: None,
            scale_tx,
            scaling_handler: None,
            last_scale: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Forward allocate/deallocate calls to the infrastructure behind the nodes.
    pub fn with_driver(mut self, driver: Arc<dyn NodeDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Forward scale events to an external provisioner.
    pub fn with_scaling_handler(mut self, handler: Arc<dyn ScalingHandler>) -> Self {
        self.scaling_handler = Some(handler);
        self
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    pub(crate) async fn lock_ledger(&self) -> tokio::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().await
    }

    /// Add a node. Its allocated and reserved amounts are reset to zero.
    pub async fn register_node(&self, mut node: ResourceNode) -> MaestroResult<()> {
        if node.capacity.values().any(|c| *c < 0.0 || !c.is_finite()) {
            return Err(MaestroError::Config(format!(
                "node '{}' declares a negative or non-finite capacity",
                node.id
            )));
        }
        let mut ledger = self.ledger.lock().await;
        if ledger.node_index(&node.id).is_some() {
            return Err(MaestroError::InvalidState(format!(
                "node '{}' is already registered",
                node.id
            )));
        }
        node.reset_usage();
        info!(node_id = %node.id, capacity = ?node.capacity, "Registered resource node");
        ledger.nodes.push(node);
        Ok(())
    }

    /// Remove a node. Fails while any allocation is outstanding on it.
    pub async fn unregister_node(&self, node_id: &str) -> MaestroResult<ResourceNode> {
        let mut ledger = self.ledger.lock().await;
        let index = ledger
            .node_index(node_id)
            .ok_or_else(|| MaestroError::NotFound(format!("node '{node_id}'")))?;
        let outstanding = ledger
            .allocations
            .values()
            .filter(|a| a.node_id == node_id)
            .count();
        if outstanding > 0 {
            return Err(MaestroError::NodeInUse {
                node_id: node_id.to_string(),
                allocations: outstanding,
            });
        }
        ledger.history.remove(node_id);
        info!(node_id = %node_id, "Unregistered resource node");
        Ok(ledger.nodes.remove(index))
    }

    /// Change whether a node accepts new allocations.
    pub async fn set_node_status(&self, node_id: &str, status: NodeStatus) -> MaestroResult<()> {
        let mut ledger = self.ledger.lock().await;
        let index = ledger
            .node_index(node_id)
            .ok_or_else(|| MaestroError::NotFound(format!("node '{node_id}'")))?;
        ledger.nodes[index].status = status;
        info!(node_id = %node_id, status = ?status, "Node status changed");
        Ok(())
    }

    /// Feed an execution outcome into the node's history.
    pub async fn record_node_outcome(&self, node_id: &str, success: bool) {
        let mut ledger = self.ledger.lock().await;
        let history = ledger.history.entry(node_id.to_string()).or_default();
        if success {
            history.successes += 1;
        } else {
            history.failures += 1;
        }
    }

    /// Whether the request could be granted right now.
    pub async fn can_allocate(&self, request: &ResourceRequest) -> bool {
        let ledger = self.ledger.lock().await;
        ledger.place(self.config.strategy, request).is_ok()
    }

    /// Grant every line item of `request`, or nothing.
    pub async fn allocate(&self, request: &ResourceRequest) -> Option<Vec<ResourceAllocation>> {
        self.try_allocate(request).await.ok()
    }

    /// Like [`ResourceManager::allocate`], reporting why a request failed.
    pub async fn try_allocate(
        &self,
        request: &ResourceRequest,
    ) -> MaestroResult<Vec<ResourceAllocation>> {
        self.grant(request, AllocationState::Active).await
    }

    /// Hold capacity as a reservation; see [`ResourceManager::commit`].
    pub async fn reserve(&self, request: &ResourceRequest) -> MaestroResult<Vec<ResourceAllocation>> {
        self.grant(request, AllocationState::Reserved).await
    }

    async fn grant(
        &self,
        request: &ResourceRequest,
        state: AllocationState,
    ) -> MaestroResult<Vec<ResourceAllocation>> {
        let mut ledger = self.ledger.lock().await;

        let placement = match ledger.place(self.config.strategy, request) {
            Ok(p) => p,
            Err(reason) => {
                ledger.failed_requests += 1;
                debug!(request_id = %request.id, requester = %request.requester_id, %reason, "Allocation refused");
                return Err(MaestroError::ResourceAllocationFailed(reason));
            }
        };

        let now = Utc::now();
        let expires_at = request
            .duration
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);
        let mut granted: Vec<ResourceAllocation> = Vec::with_capacity(placement.len());

        for (index, resource_type, amount) in placement {
            let node_id = ledger.nodes[index].id.clone();
            if let Some(driver) = &self.driver {
                if let Err(e) = driver.allocate(&node_id, resource_type, amount).await {
                    warn!(node_id = %node_id, error = %e, "Node driver refused allocation, rolling back");
                    for allocation in &granted {
                        ledger.remove(allocation.id);
                        self.driver_release(allocation).await;
                    }
                    ledger.failed_requests += 1;
                    return Err(MaestroError::ResourceAllocationFailed(format!(
                        "node '{node_id}' refused {amount} {resource_type}: {e}"
                    )));
                }
            }

            ledger.apply(index, state, resource_type, amount);
            let allocation = ResourceAllocation {
                id: Uuid::new_v4(),
                request_id: request.id,
                requester_id: request.requester_id.clone(),
                node_id,
                resource_type,
                amount,
                state,
                priority: request.priority,
                allocated_at: now,
                expires_at,
            };
            ledger.allocations.insert(allocation.id, allocation.clone());
            granted.push(allocation);
        }

        ledger.granted_requests += 1;
        debug!(
            request_id = %request.id,
            requester = %request.requester_id,
            items = granted.len(),
            "Allocation granted"
        );
        Ok(granted)
    }

    /// Turn a reservation into an active allocation.
    pub async fn commit(&self, allocation_id: Uuid) -> MaestroResult<()> {
        let mut ledger = self.ledger.lock().await;
        let allocation = ledger
            .allocations
            .get(&allocation_id)
            .cloned()
            .ok_or_else(|| MaestroError::NotFound(format!("allocation {allocation_id}")))?;
        if allocation.state == AllocationState::Active {
            return Ok(());
        }
        let index = ledger
            .node_index(&allocation.node_id)
            .ok_or_else(|| MaestroError::NotFound(format!("node '{}'", allocation.node_id)))?;
        ledger.apply(index, AllocationState::Reserved, allocation.resource_type, -allocation.amount);
        ledger.apply(index, AllocationState::Active, allocation.resource_type, allocation.amount);
        if let Some(a) = ledger.allocations.get_mut(&allocation_id) {
            a.state = AllocationState::Active;
        }
        Ok(())
    }

    /// Give back exactly what was granted. Unknown or already released ids return `false`.
    pub async fn release(&self, allocation_id: Uuid) -> bool {
        let mut ledger = self.ledger.lock().await;
        let Some(allocation) = ledger.remove(allocation_id) else {
            return false;
        };
        self.driver_release(&allocation).await;
        debug!(allocation_id = %allocation_id, node_id = %allocation.node_id, "Allocation released");
        true
    }

    /// Release a batch; returns how many were still outstanding.
    pub async fn release_all(&self, allocation_ids: &[Uuid]) -> usize {
        let mut released = 0;
        for id in allocation_ids {
            if self.release(*id).await {
                released += 1;
            }
        }
        released
    }

    async fn driver_release(&self, allocation: &ResourceAllocation) {
        if let Some(driver) = &self.driver {
            if let Err(e) = driver
                .deallocate(&allocation.node_id, allocation.resource_type, allocation.amount)
                .await
            {
                warn!(node_id = %allocation.node_id, error = %e, "Node driver failed to deallocate");
            }
        }
    }

    /// Reclaim every allocation whose lease has passed. Returns the number reclaimed.
    pub async fn reclaim_expired(&self) -> usize {
        let mut ledger = self.ledger.lock().await;
        let now = Utc::now();
        let expired: Vec<Uuid> = ledger
            .allocations
            .values()
            .filter(|a| a.is_expired(now))
            .map(|a| a.id)
            .collect();

        for id in &expired {
            if let Some(allocation) = ledger.remove(*id) {
                info!(
                    allocation_id = %id,
                    requester = %allocation.requester_id,
                    node_id = %allocation.node_id,
                    "Reclaimed expired allocation"
                );
                self.driver_release(&allocation).await;
                ledger.reclaimed_allocations += 1;
            }
        }
        expired.len()
    }

    /// Run [`ResourceManager::reclaim_expired`] on the sweep interval until aborted.
    pub fn spawn_expiry_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.reclaim_expired().await;
            }
        })
    }

    /// Snapshot of one node.
    pub async fn node(&self, node_id: &str) -> Option<ResourceNode> {
        let ledger = self.ledger.lock().await;
        ledger.nodes.iter().find(|n| n.id == node_id).cloned()
    }

    /// Snapshot of every node, in registration order.
    pub async fn nodes(&self) -> Vec<ResourceNode> {
        self.ledger.lock().await.nodes.clone()
    }

    /// Look up an outstanding allocation.
    pub async fn allocation(&self, allocation_id: Uuid) -> Option<ResourceAllocation> {
        self.ledger.lock().await.allocations.get(&allocation_id).cloned()
    }

    /// Number of outstanding allocations and reservations.
    pub async fn active_allocations(&self) -> usize {
        self.ledger.lock().await.allocations.len()
    }

    /// Aggregate utilisation per resource type across online and draining nodes.
    pub async fn utilization(&self) -> BTreeMap<ResourceType, f64> {
        let ledger = self.ledger.lock().await;
        usage_by_type(&ledger.nodes)
            .into_iter()
            .map(|(rt, usage)| (rt, usage.utilization))
            .collect()
    }

    /// Snapshot of nodes, usage and counters.
    pub async fn metrics(&self) -> ResourceMetrics {
        let ledger = self.ledger.lock().await;
        ResourceMetrics {
            nodes: ledger.nodes.len(),
            online_nodes: ledger
                .nodes
                .iter()
                .filter(|n| n.status == NodeStatus::Online)
                .count(),
            active_allocations: ledger.allocations.len(),
            granted_requests: ledger.granted_requests,
            failed_requests: ledger.failed_requests,
            reclaimed_allocations: ledger.reclaimed_allocations,
            by_type: usage_by_type(&ledger.nodes),
        }
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(ResourceManagerConfig::default())
    }
}

pub(crate) fn usage_by_type(nodes: &[ResourceNode]) -> BTreeMap<ResourceType, ResourceUsage> {
    let mut by_type: BTreeMap<ResourceType, ResourceUsage> = BTreeMap::new();
    for node in nodes.iter().filter(|n| n.status != NodeStatus::Offline) {
        for (&rt, &capacity) in &node.capacity {
            let usage = by_type.entry(rt).or_default();
            usage.capacity += capacity;
            usage.allocated += node.allocated_of(rt);
            usage.reserved += node.reserved_of(rt);
        }
    }
    for usage in by_type.values_mut() {
        usage.utilization = if usage.capacity > 0.0 {
            (usage.allocated + usage.reserved) / usage.capacity
        } else {
            0.0
        };
    }
    by_type
}
