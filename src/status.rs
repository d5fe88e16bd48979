//! Shared status registry.
//!
//! The five guarded-metric flags live in a single atomic bitmask so a reader
//! always sees one consistent snapshot and a writer only ever touches its own
//! bit. The enable signal is a `watch` channel so the contactor task can
//! sleep until it changes instead of polling.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    VMax,
    VMin,
    VDelta,
    TMax,
    TMin,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::VMax,
        Metric::VMin,
        Metric::VDelta,
        Metric::TMax,
        Metric::TMin,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Metric::VMax => "v_max",
            Metric::VMin => "v_min",
            Metric::VDelta => "v_delta",
            Metric::TMax => "t_max",
            Metric::TMin => "t_min",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl core::fmt::Display for Metric {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactorState {
    Open,
    Closed,
}

const ALL_OK: u8 = 0b1_1111;

/// Point-in-time view of all five safety flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SafetySnapshot {
    bits: u8,
}

impl SafetySnapshot {
    pub fn from_flags(flags: [bool; 5]) -> Self {
        let bits = Metric::ALL
            .iter()
            .zip(flags)
            .filter(|(_, ok)| *ok)
            .fold(0, |acc, (m, _)| acc | m.bit());
        Self { bits }
    }

    pub fn healthy() -> Self {
        Self { bits: ALL_OK }
    }

    pub fn is_ok(&self, metric: Metric) -> bool {
        self.bits & metric.bit() != 0
    }

    pub fn all_ok(&self) -> bool {
        self.bits & ALL_OK == ALL_OK
    }

    pub fn failing(&self) -> impl Iterator<Item = Metric> {
        let snap = *self;
        Metric::ALL.into_iter().filter(move |m| !snap.is_ok(*m))
    }
}

impl Serialize for SafetySnapshot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(Metric::ALL.len()))?;
        for metric in Metric::ALL {
            map.serialize_entry(metric.key(), &self.is_ok(metric))?;
        }
        map.end()
    }
}

/// Whole-registry view reported to the supervisory interface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub safety: SafetySnapshot,
    pub enable: bool,
    pub contactor: ContactorState,
    pub inhibited: bool,
}

#[derive(Debug)]
pub struct StatusRegistry {
    flags: AtomicU8,
    enable: watch::Sender<bool>,
    contactor_closed: AtomicBool,
    inhibited: AtomicBool,
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusRegistry {
    /// All flags not-ok, enable off, contactors open.
    pub fn new() -> Self {
        let (enable, _) = watch::channel(false);
        Self {
            flags: AtomicU8::new(0),
            enable,
            contactor_closed: AtomicBool::new(false),
            inhibited: AtomicBool::new(false),
        }
    }

    pub fn set_flag(&self, metric: Metric, ok: bool) {
        if ok {
            self.flags.fetch_or(metric.bit(), Ordering::SeqCst);
        } else {
            self.flags.fetch_and(!metric.bit(), Ordering::SeqCst);
        }
    }

    pub fn flag(&self, metric: Metric) -> bool {
        self.snapshot().is_ok(metric)
    }

    pub fn snapshot(&self) -> SafetySnapshot {
        SafetySnapshot { bits: self.flags.load(Ordering::SeqCst) }
    }

    pub fn set_enable(&self, on: bool) {
        let previous = self.enable.send_replace(on);
        if previous != on {
            info!(enable = on, "HV enable signal changed");
        }
    }

    pub fn enable(&self) -> bool {
        *self.enable.borrow()
    }

    pub fn subscribe_enable(&self) -> watch::Receiver<bool> {
        self.enable.subscribe()
    }

    pub fn contactor_state(&self) -> ContactorState {
        if self.contactor_closed.load(Ordering::SeqCst) {
            ContactorState::Closed
        } else {
            ContactorState::Open
        }
    }

    pub(crate) fn set_contactor_state(&self, state: ContactorState) {
        self.contactor_closed
            .store(state == ContactorState::Closed, Ordering::SeqCst);
    }

    /// Latch HV off after a controller failure.
    pub(crate) fn inhibit(&self) {
        self.inhibited.store(true, Ordering::SeqCst);
    }

    pub fn is_inhibited(&self) -> bool {
        self.inhibited.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            safety: self.snapshot(),
            enable: self.enable(),
            contactor: self.contactor_state(),
            inhibited: self.is_inhibited(),
        }
    }
}
