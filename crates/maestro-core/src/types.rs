use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Scheduling and delivery priority. Higher variants are served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default for tasks and messages.
    #[default]
    Normal,
    /// Served ahead of normal work.
    High,
    /// Served first.
    Critical,
}

impl Priority {
    /// Numeric weight used by scoring functions.
    pub fn weight(self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Kind of capacity tracked per resource node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Processor cores.
    Cpu,
    /// Memory in megabytes.
    Memory,
    /// Accelerator units.
    Gpu,
    /// Disk space in gigabytes.
    Storage,
    /// Bandwidth in megabits per second.
    Network,
    /// Calls against an external API quota.
    ApiQuota,
}

impl ResourceType {
    /// All resource types, in a stable order.
    pub const ALL: [ResourceType; 6] = [
        ResourceType::Cpu,
        ResourceType::Memory,
        ResourceType::Gpu,
        ResourceType::Storage,
        ResourceType::Network,
        ResourceType::ApiQuota,
    ];
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Cpu => write!(f, "cpu"),
            ResourceType::Memory => write!(f, "memory"),
            ResourceType::Gpu => write!(f, "gpu"),
            ResourceType::Storage => write!(f, "storage"),
            ResourceType::Network => write!(f, "network"),
            ResourceType::ApiQuota => write!(f, "api_quota"),
        }
    }
}

/// One line item of a resource request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Kind of capacity requested.
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Amount in the resource's unit.
    pub amount: f64,
    /// Display unit; informational only.
    #[serde(default)]
    pub unit: String,
}

impl ResourceSpec {
    /// Line item with the default unit for `resource_type`.
    pub fn new(resource_type: ResourceType, amount: f64) -> Self {
        Self {
            resource_type,
            amount,
            unit: default_unit(resource_type).to_string(),
        }
    }

    /// CPU cores.
    pub fn cpu(cores: f64) -> Self {
        Self::new(ResourceType::Cpu, cores)
    }

    /// Memory in megabytes.
    pub fn memory(mb: f64) -> Self {
        Self::new(ResourceType::Memory, mb)
    }

    /// GPU units.
    pub fn gpu(units: f64) -> Self {
        Self::new(ResourceType::Gpu, units)
    }
}

fn default_unit(resource_type: ResourceType) -> &'static str {
    match resource_type {
        ResourceType::Cpu => "cores",
        ResourceType::Memory => "mb",
        ResourceType::Gpu => "units",
        ResourceType::Storage => "gb",
        ResourceType::Network => "mbps",
        ResourceType::ApiQuota => "calls",
    }
}

/// A request for capacity spanning one or more resource types.
///
/// Either every line item is granted or none is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Request id, generated when absent.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Who asked for the capacity.
    #[serde(default)]
    pub requester_id: String,
    /// Line items, granted all together or not at all.
    pub resources: Vec<ResourceSpec>,
    /// Used by priority-aware placement.
    #[serde(default)]
    pub priority: Priority,
    /// Lease length; the allocation is reclaimed automatically once it passes.
    #[serde(default, with = "duration_ms_opt")]
    pub duration: Option<Duration>,
}

impl ResourceRequest {
    /// Request with normal priority and no lease.
    pub fn new(requester_id: impl Into<String>, resources: Vec<ResourceSpec>) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester_id: requester_id.into(),
            resources,
            priority: Priority::Normal,
            duration: None,
        }
    }

    /// Set the request priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Lease the allocation for `duration`.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Whether no line item asks for a positive amount.
    pub fn is_empty(&self) -> bool {
        self.resources.iter().all(|r| r.amount <= 0.0)
    }

    /// Total amount requested for one resource type.
    pub fn amount_of(&self, resource_type: ResourceType) -> f64 {
        self.resources
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .map(|r| r.amount)
            .sum()
    }
}

/// Serde helper storing an optional [`Duration`] as integer milliseconds.
pub mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    /// Write as milliseconds or `null`.
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .serialize(s)
    }

    /// Read milliseconds or `null`.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Serde helper storing a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    /// Write as milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        u64::try_from(value.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(s)
    }

    /// Read milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
