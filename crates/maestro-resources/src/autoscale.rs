//! Utilisation-driven scale triggers.
//!
//! The manager never provisions capacity itself. A periodic check compares
//! aggregate utilisation per resource type against two thresholds and emits a
//! [`ScaleEvent`] when one is crossed, at most once per cooldown window and
//! resource type.

use crate::manager::{usage_by_type, ResourceManager};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_core::{MaestroResult, ResourceType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Auto-scaling thresholds and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScaleConfig {
    /// Run the periodic scaling check.
    pub enabled: bool,
    /// Utilisation at or above which a scale-up event is emitted.
    pub scale_up_threshold: f64,
    /// Utilisation at or below which a scale-down event is emitted.
    pub scale_down_threshold: f64,
    /// Minimum time between two events for the same resource type.
    #[serde(with = "maestro_core::duration_ms")]
    pub cooldown: Duration,
    /// Period of the scaling check.
    #[serde(with = "maestro_core::duration_ms")]
    pub check_interval: Duration,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            cooldown: Duration::from_secs(300),
            check_interval: Duration::from_secs(30),
        }
    }
}

/// Which way capacity should move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    /// Utilisation reached the scale-up threshold.
    Up,
    /// Utilisation fell to the scale-down threshold.
    Down,
}

/// A threshold crossing for one resource type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleEvent {
    /// Resource type that crossed the threshold.
    pub resource_type: ResourceType,
    /// Requested scaling direction.
    pub direction: ScaleDirection,
    /// Aggregate utilisation at the time of the check.
    pub utilization: f64,
    /// Threshold that was crossed.
    pub threshold: f64,
    /// When the crossing was observed.
    pub timestamp: DateTime<Utc>,
}

/// External provisioner notified of scale events.
#[async_trait]
pub trait ScalingHandler: Send + Sync {
    /// React to one scale event.
    async fn handle(&self, event: &ScaleEvent) -> MaestroResult<()>;
}

impl ResourceManager {
    /// Receive every scale event emitted from now on.
    pub fn subscribe_scale_events(&self) -> broadcast::Receiver<ScaleEvent> {
        self.scale_tx.subscribe()
    }

    /// Compare utilisation to the thresholds and emit the resulting events.
    ///
    /// Resource types still inside their cooldown window are skipped.
    pub async fn check_scaling(&self) -> Vec<ScaleEvent> {
        let config = &self.config().autoscale;
        if !config.enabled {
            return Vec::new();
        }

        let usage = {
            let ledger = self.lock_ledger().await;
            usage_by_type(&ledger.nodes)
        };

        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut last_scale = self.last_scale.lock();
            for (resource_type, usage) in usage {
                if usage.capacity <= 0.0 {
                    continue;
                }
                let crossing = if usage.utilization >= config.scale_up_threshold {
                    Some((ScaleDirection::Up, config.scale_up_threshold))
                } else if usage.utilization <= config.scale_down_threshold {
                    Some((ScaleDirection::Down, config.scale_down_threshold))
                } else {
                    None
                };
                let Some((direction, threshold)) = crossing else {
                    continue;
                };
                let cooling = last_scale
                    .get(&resource_type)
                    .is_some_and(|at| now.duration_since(*at) < config.cooldown);
                if cooling {
                    continue;
                }
                last_scale.insert(resource_type, now);
                events.push(ScaleEvent {
                    resource_type,
                    direction,
                    utilization: usage.utilization,
                    threshold,
                    timestamp: Utc::now(),
                });
            }
        }

        for event in &events {
            info!(
                resource_type = %event.resource_type,
                direction = ?event.direction,
                utilization = event.utilization,
                "Scale threshold crossed"
            );
            // No subscribers is not an error.
            let _ = self.scale_tx.send(event.clone());
            if let Some(handler) = &self.scaling_handler {
                if let Err(e) = handler.handle(event).await {
                    warn!(resource_type = %event.resource_type, error = %e, "Scaling handler failed");
                }
            }
        }
        events
    }

    /// Run [`ResourceManager::check_scaling`] on the configured interval until aborted.
    pub fn spawn_autoscaler(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config().autoscale.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.check_scaling().await;
            }
        })
    }
}
