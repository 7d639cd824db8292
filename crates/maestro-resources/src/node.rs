use async_trait::async_trait;
use maestro_core::{MaestroResult, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance used when comparing floating-point capacity amounts.
pub const CAPACITY_EPSILON: f64 = 1e-9;

/// Availability of a node for new allocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Accepts new allocations.
    #[default]
    Online,
    /// Keeps existing allocations, accepts no new ones.
    Draining,
    /// Accepts nothing; kept only for bookkeeping.
    Offline,
}

/// A capacity-bearing host.
///
/// `allocated` and `reserved` are owned by the resource manager; a node handed
/// to `register_node` starts with both at zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Node id.
    pub id: String,
    /// Capacity per resource type.
    pub capacity: BTreeMap<ResourceType, f64>,
    /// Amount actively allocated per resource type.
    #[serde(default)]
    pub allocated: BTreeMap<ResourceType, f64>,
    /// Amount reserved per resource type.
    #[serde(default)]
    pub reserved: BTreeMap<ResourceType, f64>,
    /// Availability for new allocations.
    #[serde(default)]
    pub status: NodeStatus,
    /// Static quality score in `[0, 1]`, higher is better.
    #[serde(default = "default_performance")]
    pub performance_score: f64,
    /// Free-form labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_performance() -> f64 {
    1.0
}

impl ResourceNode {
    /// Online node with no capacity.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capacity: BTreeMap::new(),
            allocated: BTreeMap::new(),
            reserved: BTreeMap::new(),
            status: NodeStatus::Online,
            performance_score: default_performance(),
            labels: BTreeMap::new(),
        }
    }

    /// Declare capacity for one resource type.
    pub fn with_capacity(mut self, resource_type: ResourceType, amount: f64) -> Self {
        self.capacity.insert(resource_type, amount);
        self
    }

    /// Set the static quality score, clamped to `[0, 1]`.
    pub fn with_performance_score(mut self, score: f64) -> Self {
        self.performance_score = score.clamp(0.0, 1.0);
        self
    }

    /// Attach a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Declared capacity, 0 when undeclared.
    pub fn capacity_of(&self, resource_type: ResourceType) -> f64 {
        self.capacity.get(&resource_type).copied().unwrap_or(0.0)
    }

    /// Amount allocated.
    pub fn allocated_of(&self, resource_type: ResourceType) -> f64 {
        self.allocated.get(&resource_type).copied().unwrap_or(0.0)
    }

    /// Amount reserved.
    pub fn reserved_of(&self, resource_type: ResourceType) -> f64 {
        self.reserved.get(&resource_type).copied().unwrap_or(0.0)
    }

    /// Capacity not yet allocated or reserved.
    pub fn available(&self, resource_type: ResourceType) -> f64 {
        (self.capacity_of(resource_type)
            - self.allocated_of(resource_type)
            - self.reserved_of(resource_type))
        .max(0.0)
    }

    /// Fraction of capacity allocated or reserved; 0 when the node has none.
    pub fn utilization(&self, resource_type: ResourceType) -> f64 {
        let capacity = self.capacity_of(resource_type);
        if capacity <= 0.0 {
            return 0.0;
        }
        (self.allocated_of(resource_type) + self.reserved_of(resource_type)) / capacity
    }

    /// Whether new allocations may land here.
    pub fn accepts_allocations(&self) -> bool {
        self.status == NodeStatus::Online
    }

    /// `allocated + reserved <= capacity` for every resource type.
    pub fn within_capacity(&self) -> bool {
        ResourceType::ALL.iter().all(|&rt| {
            self.allocated_of(rt) + self.reserved_of(rt)
                <= self.capacity_of(rt) + CAPACITY_EPSILON
        })
    }

    pub(crate) fn adjust_allocated(&mut self, resource_type: ResourceType, delta: f64) {
        let entry = self.allocated.entry(resource_type).or_insert(0.0);
        *entry = (*entry + delta).max(0.0);
    }

    pub(crate) fn adjust_reserved(&mut self, resource_type: ResourceType, delta: f64) {
        let entry = self.reserved.entry(resource_type).or_insert(0.0);
        *entry = (*entry + delta).max(0.0);
    }

    pub(crate) fn reset_usage(&mut self) {
        self.allocated.clear();
        self.reserved.clear();
    }
}

/// Contract of the infrastructure behind a node.
///
/// The resource manager calls the driver while holding the allocation lock;
/// an error from `allocate` rolls back the whole request.
#[async_trait]
pub trait NodeDriver: Send + Sync {
    /// Provision `amount` of `resource_type` on the node.
    async fn allocate(
        &self,
        node_id: &str,
        resource_type: ResourceType,
        amount: f64,
    ) -> MaestroResult<()>;

    /// Return capacity previously provisioned with `allocate`.
    async fn deallocate(
        &self,
        node_id: &str,
        resource_type: ResourceType,
        amount: f64,
    ) -> MaestroResult<()>;
}
