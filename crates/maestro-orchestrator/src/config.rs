//! TOML configuration for a whole Maestro runtime.
//!
//! Every section is optional; missing keys fall back to their defaults.
//! Durations are written as integer milliseconds.
//!
//! ```toml
//! [engine]
//! max_concurrent_workflows = 4
//! poll_interval = 25
//!
//! [retry]
//! strategy = "fibonacci"
//! base_delay = 200
//!
//! [planner]
//! strategy = "adaptive"
//!
//! [planner.resource_ceilings]
//! cpu = 16.0
//! ```

use crate::engine::EngineConfig;
use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
use maestro_bus::BusConfig;
use maestro_core::{init_logging, LogFormat, MaestroError, MaestroResult};
use maestro_planner::PlannerConfig;
use maestro_registry::RegistryConfig;
use maestro_resources::ResourceManagerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Pretty or JSON output.
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LoggingConfig {
    /// Install the global subscriber; `false` if one already exists.
    pub fn init(&self) -> bool {
        init_logging(self.format, &self.level)
    }
}

/// `[monitor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Run the periodic metrics reporter.
    pub enabled: bool,
    /// Period of the metrics reporter.
    #[serde(with = "maestro_core::duration_ms")]
    pub report_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval: Duration::from_secs(60),
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaestroConfig {
    /// `[engine]` section.
    pub engine: EngineConfig,
    /// `[retry]` section.
    pub retry: RetryPolicy,
    /// `[circuit_breaker]` section.
    pub circuit_breaker: CircuitBreakerConfig,
    /// `[resources]` section.
    pub resources: ResourceManagerConfig,
    /// `[bus]` section.
    pub bus: BusConfig,
    /// `[registry]` section.
    pub registry: RegistryConfig,
    /// `[planner]` section.
    pub planner: PlannerConfig,
    /// `[logging]` section.
    pub logging: LoggingConfig,
    /// `[monitor]` section.
    pub monitor: MonitorConfig,
}

impl MaestroConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> MaestroResult<Self> {
        let config: MaestroConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> MaestroResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MaestroError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        let config: MaestroConfig = toml::from_str(&content).map_err(|e| {
            MaestroError::Config(format!("Failed to parse config '{}': {e}", path.display()))
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> MaestroResult<String> {
        toml::to_string(self).map_err(|e| MaestroError::Config(format!("Failed to encode config: {e}")))
    }

    /// Reject values that would stall or break a subsystem.
    pub fn validate(&self) -> MaestroResult<()> {
        let engine = &self.engine;
        ensure(engine.max_concurrent_workflows > 0, "engine.max_concurrent_workflows must be at least 1")?;
        ensure(engine.default_max_parallel_tasks > 0, "engine.default_max_parallel_tasks must be at least 1")?;
        ensure(!engine.poll_interval.is_zero(), "engine.poll_interval must be positive")?;
        ensure(engine.event_capacity > 0, "engine.event_capacity must be at least 1")?;

        let retry = &self.retry;
        ensure(
            retry.multiplier.is_finite() && retry.multiplier >= 1.0,
            "retry.multiplier must be a finite number >= 1",
        )?;
        ensure(retry.max_delay >= retry.base_delay, "retry.max_delay must not be below retry.base_delay")?;

        ensure(
            self.circuit_breaker.failure_threshold > 0,
            "circuit_breaker.failure_threshold must be at least 1",
        )?;

        let scale = &self.resources.autoscale;
        let in_unit = |v: f64| v > 0.0 && v <= 1.0;
        ensure(
            in_unit(scale.scale_up_threshold) && in_unit(scale.scale_down_threshold),
            "autoscale thresholds must lie in (0, 1]",
        )?;
        ensure(
            scale.scale_down_threshold < scale.scale_up_threshold,
            "autoscale.scale_down_threshold must be below scale_up_threshold",
        )?;
        ensure(!self.resources.sweep_interval.is_zero(), "resources.sweep_interval must be positive")?;
        ensure(!scale.check_interval.is_zero(), "autoscale.check_interval must be positive")?;

        ensure(self.bus.queue_capacity > 0, "bus.queue_capacity must be at least 1")?;
        ensure(self.bus.dead_letter_capacity > 0, "bus.dead_letter_capacity must be at least 1")?;
        ensure(!self.bus.reliability_interval.is_zero(), "bus.reliability_interval must be positive")?;

        ensure(
            !self.registry.health_check_interval.is_zero(),
            "registry.health_check_interval must be positive",
        )?;

        let planner = &self.planner;
        ensure(
            planner.epsilon.is_finite() && planner.epsilon > 0.0,
            "planner.epsilon must be positive",
        )?;
        ensure(
            planner.default_duration_secs.is_finite() && planner.default_duration_secs >= 0.0,
            "planner.default_duration_secs must not be negative",
        )?;
        if let Some((rt, _)) = planner.resource_ceilings.iter().find(|(_, c)| !(**c > 0.0)) {
            return Err(MaestroError::Config(format!(
                "planner.resource_ceilings.{rt} must be positive"
            )));
        }
        let w = &planner.adaptive_weights;
        ensure(
            [w.duration, w.cost, w.resources].iter().all(|v| *v >= 0.0) && w.duration + w.cost + w.resources > 0.0,
            "planner.adaptive_weights must be non-negative and not all zero",
        )?;

        ensure(
            !self.monitor.enabled || !self.monitor.report_interval.is_zero(),
            "monitor.report_interval must be positive",
        )?;
        Ok(())
    }
}

fn ensure(condition: bool, message: &str) -> MaestroResult<()> {
    if condition {
        Ok(())
    } else {
        Err(MaestroError::Config(message.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::reliability::BackoffStrategy;
    use maestro_core::ResourceType;
    use maestro_planner::PlanningStrategy;
    use maestro_registry::LoadBalancingStrategy;
    use maestro_resources::AllocationStrategy;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        MaestroConfig::default().validate().unwrap();
        let parsed = MaestroConfig::from_toml_str("").unwrap();
        assert_eq!(parsed.engine.max_concurrent_workflows, 10);
        assert_eq!(parsed.retry.strategy, BackoffStrategy::Exponential);
    }

    #[test]
    fn test_parse_all_sections() {
        let config = MaestroConfig::from_toml_str(
            r#"
            [engine]
            max_concurrent_workflows = 2
            poll_interval = 20

            [retry]
            strategy = "linear"
            base_delay = 100
            max_delay = 1000
            jitter = false

            [circuit_breaker]
            failure_threshold = 3
            recovery_timeout = 5000

            [resources]
            strategy = "best_fit"

            [resources.autoscale]
            scale_up_threshold = 0.9

            [bus]
            queue_capacity = 64

            [registry]
            strategy = "least_loaded"

            [planner]
            strategy = "resource_aware"

            [planner.resource_ceilings]
            cpu = 8.0

            [logging]
            format = "json"
            level = "maestro=debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.max_concurrent_workflows, 2);
        assert_eq!(config.engine.poll_interval, Duration::from_millis(20));
        assert_eq!(config.engine.default_max_parallel_tasks, 4);
        assert_eq!(config.retry.strategy, BackoffStrategy::Linear);
        assert!(!config.retry.jitter);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(5));
        assert_eq!(config.resources.strategy, AllocationStrategy::BestFit);
        assert!((config.resources.autoscale.scale_up_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.bus.queue_capacity, 64);
        assert_eq!(config.registry.strategy, LoadBalancingStrategy::LeastLoaded);
        assert_eq!(config.planner.strategy, PlanningStrategy::ResourceAware);
        assert_eq!(config.planner.resource_ceilings.get(&ResourceType::Cpu), Some(&8.0));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            "[engine]\nmax_concurrent_workflows = 0",
            "[engine]\ndefault_max_parallel_tasks = 0",
            "[retry]\nbase_delay = 5000\nmax_delay = 10",
            "[circuit_breaker]\nfailure_threshold = 0",
            "[resources.autoscale]\nscale_up_threshold = 0.3\nscale_down_threshold = 0.5",
            "[resources.autoscale]\nscale_up_threshold = 1.5",
            "[bus]\nqueue_capacity = 0",
            "[planner]\nepsilon = 0.0",
            "[planner.resource_ceilings]\ngpu = 0.0",
        ];
        for case in cases {
            let err = MaestroConfig::from_toml_str(case).unwrap_err();
            assert!(matches!(err, MaestroError::Config(_)), "{case} gave {err:?}");
        }
    }

    #[test]
    fn test_malformed_toml_is_a_toml_error() {
        let err = MaestroConfig::from_toml_str("[engine\n").unwrap_err();
        assert!(matches!(err, MaestroError::Toml(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "[engine]\nmax_concurrent_workflows = 3\n\n[monitor]\nenabled = false").unwrap();
        let config = MaestroConfig::load(tmp.path()).unwrap();
        assert_eq!(config.engine.max_concurrent_workflows, 3);
        assert!(!config.monitor.enabled);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = MaestroConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_logging_init_is_idempotent() {
        let logging = LoggingConfig {
            format: LogFormat::Json,
            level: "maestro=debug".into(),
        };
        logging.init();
        assert!(!logging.init());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let original = MaestroConfig::default();
        let text = original.to_toml_string().unwrap();
        let parsed = MaestroConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.engine.poll_interval, original.engine.poll_interval);
        assert_eq!(parsed.planner.unit_costs.len(), original.planner.unit_costs.len());
    }
}
