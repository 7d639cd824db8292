use maestro_core::ResourceType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Running totals of observed executions for one capability type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityStats {
    /// Recorded executions.
    pub samples: u64,
    /// Sum of durations in seconds.
    pub total_duration: f64,
    /// Sum of costs.
    pub total_cost: f64,
    /// Executions that reported a cost.
    pub cost_samples: u64,
    /// Sum of resource amounts per type.
    pub total_resources: BTreeMap<ResourceType, f64>,
}

impl CapabilityStats {
    /// Mean duration, if any sample exists.
    pub fn average_duration(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.total_duration / self.samples as f64)
    }

    /// Mean cost, if any cost was reported.
    pub fn average_cost(&self) -> Option<f64> {
        (self.cost_samples > 0).then(|| self.total_cost / self.cost_samples as f64)
    }

    /// Mean resource demand per type.
    pub fn average_resources(&self) -> BTreeMap<ResourceType, f64> {
        if self.samples == 0 {
            return BTreeMap::new();
        }
        self.total_resources
            .iter()
            .map(|(rt, total)| (*rt, total / self.samples as f64))
            .collect()
    }
}

/// Historical-average predictor keyed by capability type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionHistory {
    by_capability: HashMap<String, CapabilityStats>,
    /// Sum and count of actual/estimated duration ratios from plan feedback.
    calibration_total: f64,
    calibration_samples: u64,
}

impl ExecutionHistory {
    /// Add one observed execution. Negative or non-finite durations are ignored.
    pub fn record(
        &mut self,
        capability: &str,
        duration: f64,
        cost: Option<f64>,
        resources: &BTreeMap<ResourceType, f64>,
    ) {
        if !duration.is_finite() || duration < 0.0 {
            return;
        }
        let stats = self.by_capability.entry(capability.to_string()).or_default();
        stats.samples += 1;
        stats.total_duration += duration;
        if let Some(cost) = cost.filter(|c| c.is_finite()) {
            stats.total_cost += cost;
            stats.cost_samples += 1;
        }
        for (rt, amount) in resources {
            *stats.total_resources.entry(*rt).or_insert(0.0) += amount;
        }
    }

    /// Totals for one capability type.
    pub fn stats(&self, capability: &str) -> Option<&CapabilityStats> {
        self.by_capability.get(capability)
    }

    /// Average duration once at least `min_samples` observations exist.
    pub fn predicted_duration(&self, capability: &str, min_samples: u64) -> Option<f64> {
        self.by_capability
            .get(capability)
            .filter(|s| s.samples >= min_samples.max(1))
            .and_then(CapabilityStats::average_duration)
    }

    /// Average resource demand once at least `min_samples` observations exist.
    pub fn predicted_resources(
        &self,
        capability: &str,
        min_samples: u64,
    ) -> Option<BTreeMap<ResourceType, f64>> {
        self.by_capability
            .get(capability)
            .filter(|s| s.samples >= min_samples.max(1) && !s.total_resources.is_empty())
            .map(CapabilityStats::average_resources)
    }

    /// Record how far a whole plan's estimate was off.
    pub fn record_calibration(&mut self, estimated: f64, actual: f64) {
        if estimated > 0.0 && actual.is_finite() && actual >= 0.0 {
            self.calibration_total += actual / estimated;
            self.calibration_samples += 1;
        }
    }

    /// Mean actual/estimated ratio once at least `min_samples` plans reported back.
    pub fn calibration(&self, min_samples: u64) -> Option<f64> {
        (self.calibration_samples >= min_samples.max(1))
            .then(|| self.calibration_total / self.calibration_samples as f64)
    }

    /// Number of capability types seen.
    pub fn capabilities(&self) -> usize {
        self.by_capability.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_needs_min_samples() {
        let mut history = ExecutionHistory::default();
        history.record("coder", 10.0, None, &BTreeMap::new());
        assert_eq!(history.predicted_duration("coder", 2), None);
        history.record("coder", 20.0, Some(1.0), &BTreeMap::new());
        assert_eq!(history.predicted_duration("coder", 2), Some(15.0));
        assert_eq!(history.stats("coder").and_then(|s| s.average_cost()), Some(1.0));
        assert_eq!(history.predicted_duration("reviewer", 1), None);
    }

    #[test]
    fn test_resource_averages() {
        let mut history = ExecutionHistory::default();
        history.record("ml", 5.0, None, &BTreeMap::from([(ResourceType::Gpu, 2.0)]));
        history.record("ml", 5.0, None, &BTreeMap::from([(ResourceType::Gpu, 4.0)]));
        let predicted = history.predicted_resources("ml", 1).unwrap_or_default();
        assert_eq!(predicted.get(&ResourceType::Gpu), Some(&3.0));
    }

    #[test]
    fn test_calibration_ratio() {
        let mut history = ExecutionHistory::default();
        history.record_calibration(10.0, 15.0);
        assert_eq!(history.calibration(2), None);
        history.record_calibration(10.0, 5.0);
        assert_eq!(history.calibration(2), Some(1.0));
        history.record_calibration(0.0, 5.0);
        assert_eq!(history.calibration(1), Some(1.0));
    }

    #[test]
    fn test_invalid_durations_ignored() {
        let mut history = ExecutionHistory::default();
        history.record("x", f64::NAN, None, &BTreeMap::new());
        history.record("x", -1.0, None, &BTreeMap::new());
        assert_eq!(history.capabilities(), 0);
    }
}
