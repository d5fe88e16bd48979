use hvbmu::config::{Limit, Thresholds};
use hvbmu::safety::*;
use hvbmu::status::{Metric, StatusRegistry};
use hvbmu::telemetry::{Measurement, Quantity};
use proptest::prelude::*;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

/// In-memory log output for asserting on emitted events.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn logs_during<T>(f: impl FnOnce() -> T) -> (T, String) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .without_time()
        .with_max_level(tracing::Level::WARN)
        .finish();
    let out = tracing::subscriber::with_default(subscriber, f);
    let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    (out, text)
}

#[test]
fn test_check_max_levels() {
    assert!(check_max(4.0, 4.1, 4.15));
    // Warning band is still ok.
    assert!(check_max(4.12, 4.1, 4.15));
    assert!(!check_max(4.16, 4.1, 4.15));
    assert!(!check_max(4.15, 4.1, 4.15));
}

#[test]
fn test_check_min_levels() {
    assert!(check_min(3.5, 3.3, 3.0));
    assert!(check_min(3.1, 3.3, 3.0));
    assert!(!check_min(3.0, 3.3, 3.0));
    assert!(!check_min(2.5, 3.3, 3.0));
}

#[test]
fn test_check_max_logs_by_level() {
    let (ok, logs) = logs_during(|| check_max(4.0, 4.1, 4.15));
    assert!(ok);
    assert!(logs.is_empty(), "unexpected output: {logs}");

    let (ok, logs) = logs_during(|| check_max(4.12, 4.1, 4.15));
    assert!(ok);
    assert!(logs.contains("WARN"));
    assert!(!logs.contains("ERROR"));

    let (ok, logs) = logs_during(|| check_max(4.16, 4.1, 4.15));
    assert!(!ok);
    assert!(logs.contains("ERROR"));
    assert!(logs.contains("severity=\"critical\""));
}

#[test]
fn test_check_min_logs_by_level() {
    let (ok, logs) = logs_during(|| check_min(3.5, 3.3, 3.0));
    assert!(ok);
    assert!(logs.is_empty(), "unexpected output: {logs}");

    let (ok, logs) = logs_during(|| check_min(3.1, 3.3, 3.0));
    assert!(ok);
    assert!(logs.contains("WARN"));

    let (ok, logs) = logs_during(|| check_min(2.9, 3.3, 3.0));
    assert!(!ok);
    assert!(logs.contains("ERROR"));
    assert!(logs.contains("critical"));
}

#[test]
fn test_nan_is_never_ok() {
    assert!(!check_max(f64::NAN, 4.1, 4.15));
    assert!(!check_min(f64::NAN, 3.3, 3.0));
}

#[test]
fn test_classification() {
    assert_eq!(classify_max(39.0, 40.0, 50.0), SafetyLevel::Normal);
    assert_eq!(classify_max(40.0, 40.0, 50.0), SafetyLevel::Warning);
    assert_eq!(classify_max(50.0, 40.0, 50.0), SafetyLevel::Critical);
    assert_eq!(classify_min(3.0, 3.0, 2.0), SafetyLevel::Warning);
    assert_eq!(classify_min(2.0, 3.0, 2.0), SafetyLevel::Critical);
}

fn evaluator() -> (SafetyEvaluator, Arc<StatusRegistry>) {
    let registry = Arc::new(StatusRegistry::new());
    (SafetyEvaluator::new(Arc::clone(&registry), Thresholds::default()), registry)
}

#[test]
fn test_evaluate_publishes_flag() {
    let (mut ev, registry) = evaluator();
    assert!(!registry.flag(Metric::VMax));
    assert!(ev.evaluate(Metric::VMax, 4.0));
    assert!(registry.flag(Metric::VMax));
    assert!(!ev.evaluate(Metric::VMax, 4.2));
    assert!(!registry.flag(Metric::VMax));
}

#[test]
fn test_unevaluated_flag_keeps_last_value() {
    let (mut ev, registry) = evaluator();
    ev.evaluate(Metric::TMax, 25.0);
    ev.evaluate(Metric::VMin, 3.9);
    ev.evaluate(Metric::VMin, 2.9);
    assert!(registry.flag(Metric::TMax));
    assert!(!registry.flag(Metric::VMin));
    assert_eq!(ev.level(Metric::TMax), Some(SafetyLevel::Normal));
    assert_eq!(ev.level(Metric::VDelta), None);
}

#[test]
fn test_evaluate_measurements_ignores_unguarded() {
    let (mut ev, registry) = evaluator();
    let measurements = [
        Measurement::new(Quantity::PackVoltage, 380.0),
        Measurement::new(Quantity::CellVoltageMax, 4.0),
        Measurement::new(Quantity::CellVoltageMin, 3.8),
        Measurement::new(Quantity::CellVoltageDelta, 0.2),
    ];
    assert_eq!(ev.evaluate_measurements(&measurements), 3);
    assert!(registry.flag(Metric::VMax));
    assert!(registry.flag(Metric::VMin));
    assert!(!registry.flag(Metric::VDelta));
}

#[test]
fn test_overall_level() {
    let (mut ev, _) = evaluator();
    assert_eq!(ev.overall_level(), SafetyLevel::Critical);
    ev.evaluate(Metric::VMax, 4.0);
    ev.evaluate(Metric::VMin, 3.8);
    ev.evaluate(Metric::VDelta, 0.005);
    ev.evaluate(Metric::TMax, 25.0);
    ev.evaluate(Metric::TMin, 25.0);
    assert_eq!(ev.overall_level(), SafetyLevel::Normal);
    ev.evaluate(Metric::TMax, 45.0);
    assert_eq!(ev.overall_level(), SafetyLevel::Warning);
}

#[test]
fn test_event_history_is_bounded() {
    let (mut ev, _) = evaluator();
    for i in 0..100 {
        ev.evaluate(Metric::TMax, 50.0 + f64::from(i));
    }
    let history = ev.get_event_history();
    assert_eq!(history.len(), 32);
    assert_eq!(history.last().map(|e| e.value), Some(Some(149.0)));
    assert!(history.iter().all(|e| e.level == SafetyLevel::Critical));
}

#[test]
fn test_invalidate_marks_unsafe() {
    let (mut ev, registry) = evaluator();
    ev.evaluate(Metric::TMin, 20.0);
    ev.invalidate(Metric::TMin, "sensor missing");
    assert!(!registry.flag(Metric::TMin));
    assert_eq!(ev.get_event_history().last().map(|e| e.value), Some(None));
}

#[test]
fn test_custom_thresholds() {
    let registry = Arc::new(StatusRegistry::new());
    let thresholds = Thresholds {
        temperature_max: Limit::new(30.0, 35.0),
        ..Thresholds::default()
    };
    let mut ev = SafetyEvaluator::new(Arc::clone(&registry), thresholds);
    assert!(!ev.evaluate(Metric::TMax, 36.0));
}

proptest! {
    #[test]
    fn check_max_ok_iff_below_crit(value in -100.0f64..100.0, warn in -50.0f64..50.0, gap in 0.0f64..20.0) {
        let crit = warn + gap;
        prop_assert_eq!(check_max(value, warn, crit), value < crit);
    }

    #[test]
    fn check_min_ok_iff_above_crit(value in -100.0f64..100.0, warn in -50.0f64..50.0, gap in 0.0f64..20.0) {
        let crit = warn - gap;
        prop_assert_eq!(check_min(value, warn, crit), value > crit);
    }
}
