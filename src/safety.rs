use crate::config::{LimitKind, Thresholds};
use crate::status::{Metric, StatusRegistry};
use crate::telemetry::{now_ms, Measurement};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const MAX_SAFETY_EVENTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SafetyLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SafetyEventRecord {
    pub metric: Metric,
    pub level: SafetyLevel,
    /// `None` when the metric could not be measured at all.
    pub value: Option<f64>,
    pub timestamp_ms: u64,
}

/// Level of `value` against an upper limit.
pub fn classify_max(value: f64, warn: f64, crit: f64) -> SafetyLevel {
    if value < warn {
        SafetyLevel::Normal
    } else if value < crit {
        SafetyLevel::Warning
    } else {
        SafetyLevel::Critical
    }
}

/// Level of `value` against a lower limit.
pub fn classify_min(value: f64, warn: f64, crit: f64) -> SafetyLevel {
    if value > warn {
        SafetyLevel::Normal
    } else if value > crit {
        SafetyLevel::Warning
    } else {
        SafetyLevel::Critical
    }
}

fn log_level(level: SafetyLevel, value: f64, warn: f64, crit: f64) -> bool {
    match level {
        SafetyLevel::Normal => true,
        SafetyLevel::Warning => {
            warn!(value, limit = warn, "Outside warning limit");
            true
        }
        SafetyLevel::Critical => {
            error!(severity = "critical", value, limit = crit, "At critical limit");
            false
        }
    }
}

/// `true` unless `value` has reached `crit`. Reaching `warn` is logged.
/// NaN is never ok.
pub fn check_max(value: f64, warn: f64, crit: f64) -> bool {
    log_level(classify_max(value, warn, crit), value, warn, crit)
}

/// Mirror of [`check_max`] for lower limits.
pub fn check_min(value: f64, warn: f64, crit: f64) -> bool {
    log_level(classify_min(value, warn, crit), value, warn, crit)
}

/// Turns measurements into safety flags.
///
/// Only this type writes the registry's metric flags. A flag that is not
/// evaluated in a cycle keeps its last value, so a stale flag can only be as
/// optimistic as the last real measurement was.
#[derive(Debug)]
pub struct SafetyEvaluator {
    registry: Arc<StatusRegistry>,
    thresholds: Thresholds,
    levels: [Option<SafetyLevel>; 5],
    event_history: Vec<SafetyEventRecord, MAX_SAFETY_EVENTS>,
}

impl SafetyEvaluator {
    pub fn new(registry: Arc<StatusRegistry>, thresholds: Thresholds) -> Self {
        Self {
            registry,
            thresholds,
            levels: [None; 5],
            event_history: Vec::new(),
        }
    }

    /// Check one metric and publish its flag.
    pub fn evaluate(&mut self, metric: Metric, value: f64) -> bool {
        let (kind, limit) = self.thresholds.for_metric(metric);
        info!(%metric, value, warn = limit.warn, crit = limit.crit, "Checking");

        let level = match kind {
            LimitKind::Max => classify_max(value, limit.warn, limit.crit),
            LimitKind::Min => classify_min(value, limit.warn, limit.crit),
        };
        let ok = tracing::info_span!("check", %metric)
            .in_scope(|| log_level(level, value, limit.warn, limit.crit));

        self.registry.set_flag(metric, ok);
        self.levels[metric as usize] = Some(level);
        if level != SafetyLevel::Normal {
            self.record_event(metric, level, Some(value));
        }
        debug!(%metric, ok, "Flag updated");
        ok
    }

    /// Evaluate every guarded quantity in `measurements`; returns how many
    /// flags were updated.
    pub fn evaluate_measurements(&mut self, measurements: &[Measurement]) -> usize {
        let mut evaluated = 0;
        for m in measurements {
            if let Some(metric) = m.quantity.guarded_metric() {
                self.evaluate(metric, m.value);
                evaluated += 1;
            }
        }
        evaluated
    }

    /// Force a metric not-ok when it cannot be measured.
    pub fn invalidate(&mut self, metric: Metric, reason: &str) {
        error!(severity = "critical", %metric, reason, "Metric unavailable, marking unsafe");
        self.registry.set_flag(metric, false);
        self.levels[metric as usize] = Some(SafetyLevel::Critical);
        self.record_event(metric, SafetyLevel::Critical, None);
    }

    /// Last level seen for `metric`, `None` before its first evaluation.
    pub fn level(&self, metric: Metric) -> Option<SafetyLevel> {
        self.levels[metric as usize]
    }

    /// Worst level over all metrics; unevaluated metrics count as critical.
    pub fn overall_level(&self) -> SafetyLevel {
        self.levels
            .iter()
            .map(|l| l.unwrap_or(SafetyLevel::Critical))
            .max()
            .unwrap_or(SafetyLevel::Critical)
    }

    pub fn get_event_history(&self) -> &[SafetyEventRecord] {
        &self.event_history
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    fn record_event(&mut self, metric: Metric, level: SafetyLevel, value: Option<f64>) {
        if self.event_history.is_full() {
            self.event_history.remove(0);
        }
        let _ = self.event_history.push(SafetyEventRecord {
            metric,
            level,
            value,
            timestamp_ms: now_ms(),
        });
    }
}
