//! Runtime configuration.
//!
//! Every field has a default matching the fielded battery monitor, so an
//! empty JSON object is a valid configuration file.

use crate::sim::FaultInjectionConfig;
use crate::status::Metric;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// Cell voltage limits (V)
const MAX_CELL_WARN: f64 = 4.1;
const MAX_CELL_CRIT: f64 = 4.15;
const MIN_CELL_WARN: f64 = 3.3;
const MIN_CELL_CRIT: f64 = 3.00;
const DELTA_CELL_WARN: f64 = 0.01;
const DELTA_CELL_CRIT: f64 = 0.1;

// Pack temperature limits (degC)
const MAX_TEMP_WARN: f64 = 40.0;
const MAX_TEMP_CRIT: f64 = 50.0;
const MIN_TEMP_WARN: f64 = 3.0;
const MIN_TEMP_CRIT: f64 = 2.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which side of a limit is unsafe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Max,
    Min,
}

/// Two-tier limit: crossing `warn` is logged, crossing `crit` is unsafe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub warn: f64,
    pub crit: f64,
}

impl Limit {
    pub const fn new(warn: f64, crit: f64) -> Self {
        Self { warn, crit }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cell_voltage_max: Limit,
    pub cell_voltage_min: Limit,
    pub cell_delta_max: Limit,
    pub temperature_max: Limit,
    pub temperature_min: Limit,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cell_voltage_max: Limit::new(MAX_CELL_WARN, MAX_CELL_CRIT),
            cell_voltage_min: Limit::new(MIN_CELL_WARN, MIN_CELL_CRIT),
            cell_delta_max: Limit::new(DELTA_CELL_WARN, DELTA_CELL_CRIT),
            temperature_max: Limit::new(MAX_TEMP_WARN, MAX_TEMP_CRIT),
            temperature_min: Limit::new(MIN_TEMP_WARN, MIN_TEMP_CRIT),
        }
    }
}

impl Thresholds {
    pub fn for_metric(&self, metric: Metric) -> (LimitKind, Limit) {
        match metric {
            Metric::VMax => (LimitKind::Max, self.cell_voltage_max),
            Metric::VMin => (LimitKind::Min, self.cell_voltage_min),
            Metric::VDelta => (LimitKind::Max, self.cell_delta_max),
            Metric::TMax => (LimitKind::Max, self.temperature_max),
            Metric::TMin => (LimitKind::Min, self.temperature_min),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for metric in Metric::ALL {
            let (kind, limit) = self.for_metric(metric);
            let ordered = match kind {
                LimitKind::Max => limit.warn <= limit.crit,
                LimitKind::Min => limit.warn >= limit.crit,
            };
            if !ordered || !limit.warn.is_finite() || !limit.crit.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "{metric} limit warn={} crit={} is not ordered",
                    limit.warn, limit.crit
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bounded wait for each reply frame.
    pub frame_timeout_ms: u64,
    /// Pause between a completed report and the next request.
    pub settle_delay_ms: u64,
    /// Pause before restarting the cycle after a timeout or anomaly.
    pub backoff_ms: u64,
    pub reply_queue_capacity: usize,
    /// Receive task poll interval on the bus port.
    pub bus_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 500,
            settle_delay_ms: 200,
            backoff_ms: 200,
            reply_queue_capacity: 64,
            bus_poll_ms: 100,
        }
    }
}

impl SessionConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn bus_poll(&self) -> Duration {
        Duration::from_millis(self.bus_poll_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactorConfig {
    /// Time between closing the negative relay and the positive relay.
    pub precharge_ms: u64,
    /// Delay between deciding to open and opening.
    pub grace_delay_ms: u64,
    /// How often flags are re-read while energized.
    pub decision_period_ms: u64,
}

impl Default for ContactorConfig {
    fn default() -> Self {
        Self {
            precharge_ms: 3000,
            grace_delay_ms: 2000,
            decision_period_ms: 100,
        }
    }
}

impl ContactorConfig {
    pub fn precharge(&self) -> Duration {
        Duration::from_millis(self.precharge_ms)
    }

    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }

    pub fn decision_period(&self) -> Duration {
        Duration::from_millis(self.decision_period_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub tcp_port: u16,
    pub faults: FaultInjectionConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tcp_port: 8080,
            faults: FaultInjectionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BmuConfig {
    pub thresholds: Thresholds,
    pub session: SessionConfig,
    pub contactor: ContactorConfig,
    pub simulator: SimulatorConfig,
}

impl BmuConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;
        if self.session.frame_timeout_ms == 0 {
            return Err(ConfigError::Invalid("session.frame_timeout_ms must be non-zero".into()));
        }
        if self.session.reply_queue_capacity == 0 {
            return Err(ConfigError::Invalid("session.reply_queue_capacity must be non-zero".into()));
        }
        if self.session.bus_poll_ms == 0 {
            return Err(ConfigError::Invalid("session.bus_poll_ms must be non-zero".into()));
        }
        if self.contactor.decision_period_ms == 0 {
            return Err(ConfigError::Invalid("contactor.decision_period_ms must be non-zero".into()));
        }
        Ok(())
    }
}
