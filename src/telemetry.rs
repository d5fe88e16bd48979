//! Telemetry decoding and record emission.
//!
//! [`decode`] is a pure function from a reassembled payload to typed
//! measurements. [`TelemetryCollector`] stamps decoded groups into
//! sequenced records and hands them to a [`TelemetrySink`].

use crate::protocol::ReportGroup;
use crate::status::Metric;
use arrayvec::ArrayString;
use core::fmt::Write as _;
use heapless::Vec;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use static_assertions::const_assert;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

pub const CELL_COUNT: usize = 96;
pub const TEMPERATURE_SENSORS: usize = 4;
/// Raw temperature reading meaning "sensor absent".
pub const SENSOR_ABSENT: u8 = 255;
pub const MAX_MEASUREMENTS: usize = 104;

const_assert!(MAX_MEASUREMENTS >= CELL_COUNT);
const_assert!(MAX_MEASUREMENTS >= TEMPERATURE_SENSORS + 2);

// General group layout
const PACK_VOLTAGE_OFFSET: usize = 21;
const ACCESSORY_VOLTAGE_OFFSET: usize = 23;
const HEALTH_OFFSET: usize = 29;
const SOC_OFFSET: usize = 32;
const CAPACITY_OFFSET: usize = 36;

// Cell voltage group layout
const FIRST_CELL_OFFSET: usize = 3;

// Voltage extremes group layout
const V_MAX_OFFSET: usize = 13;
const V_MIN_OFFSET: usize = 15;

// Temperature group layout
const TEMPERATURE_OFFSETS: [usize; TEMPERATURE_SENSORS] = [5, 8, 11, 14];

const MAX_SEQUENCE_NUMBER: u32 = 65535;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{group} payload too short: need {needed} bytes, got {actual}")]
    PayloadTooShort {
        group: ReportGroup,
        needed: usize,
        actual: usize,
    },
    #[error("pack telemetry frame too short: {0} bytes")]
    PackFrameTooShort(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    PackVoltage,
    AccessoryVoltage,
    Health,
    StateOfCharge,
    Capacity,
    StateOfHealth,
    /// 1-based cell number.
    CellVoltage(u8),
    CellVoltageMax,
    CellVoltageMin,
    CellVoltageDelta,
    /// 1-based sensor number.
    Temperature(u8),
    TemperatureMax,
    TemperatureMin,
}

pub type FieldName = ArrayString<16>;

impl Quantity {
    /// Record field name, e.g. `voltage`, `cell17`, `t3`.
    pub fn name(self) -> FieldName {
        let mut name = FieldName::new();
        let _ = match self {
            Quantity::PackVoltage => name.write_str("voltage"),
            Quantity::AccessoryVoltage => name.write_str("voltage_acc"),
            Quantity::Health => name.write_str("hx"),
            Quantity::StateOfCharge => name.write_str("soc"),
            Quantity::Capacity => name.write_str("capacity"),
            Quantity::StateOfHealth => name.write_str("soh"),
            Quantity::CellVoltage(n) => write!(name, "cell{n}"),
            Quantity::CellVoltageMax => name.write_str("v_max"),
            Quantity::CellVoltageMin => name.write_str("v_min"),
            Quantity::CellVoltageDelta => name.write_str("v_delta"),
            Quantity::Temperature(n) => write!(name, "t{n}"),
            Quantity::TemperatureMax => name.write_str("t_max"),
            Quantity::TemperatureMin => name.write_str("t_min"),
        };
        name
    }

    pub fn unit(self) -> &'static str {
        match self {
            Quantity::PackVoltage
            | Quantity::AccessoryVoltage
            | Quantity::CellVoltage(_)
            | Quantity::CellVoltageMax
            | Quantity::CellVoltageMin
            | Quantity::CellVoltageDelta => "V",
            Quantity::Health | Quantity::StateOfCharge | Quantity::StateOfHealth => "%",
            Quantity::Capacity => "Ah",
            Quantity::Temperature(_) | Quantity::TemperatureMax | Quantity::TemperatureMin => "degC",
        }
    }

    /// The safety metric this quantity feeds, if any.
    pub fn guarded_metric(self) -> Option<Metric> {
        match self {
            Quantity::CellVoltageMax => Some(Metric::VMax),
            Quantity::CellVoltageMin => Some(Metric::VMin),
            Quantity::CellVoltageDelta => Some(Metric::VDelta),
            Quantity::TemperatureMax => Some(Metric::TMax),
            Quantity::TemperatureMin => Some(Metric::TMin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub quantity: Quantity,
    pub value: f64,
}

impl Measurement {
    pub fn new(quantity: Quantity, value: f64) -> Self {
        Self { quantity, value }
    }

    /// Placeholder for a field the controller reported as missing. The value
    /// is NaN and serializes as `null`.
    pub fn absent(quantity: Quantity) -> Self {
        Self {
            quantity,
            value: f64::NAN,
        }
    }

    pub fn is_present(&self) -> bool {
        !self.value.is_nan()
    }
}

pub type Measurements = Vec<Measurement, MAX_MEASUREMENTS>;

fn be_uint(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

fn require(group: ReportGroup, payload: &[u8], needed: usize) -> Result<(), DecodeError> {
    if payload.len() < needed {
        return Err(DecodeError::PayloadTooShort {
            group,
            needed,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn put(out: &mut Measurements, quantity: Quantity, value: f64) {
    let _ = out.push(Measurement::new(quantity, value));
}

/// Decode a reassembled payload (length byte at index 0).
pub fn decode(group: ReportGroup, payload: &[u8]) -> Result<Measurements, DecodeError> {
    let mut out = Measurements::new();
    match group {
        ReportGroup::General => {
            require(group, payload, CAPACITY_OFFSET + 3)?;
            let capacity_raw = f64::from(be_uint(&payload[CAPACITY_OFFSET..CAPACITY_OFFSET + 3]));
            put(&mut out, Quantity::PackVoltage, f64::from(be_uint(&payload[PACK_VOLTAGE_OFFSET..PACK_VOLTAGE_OFFSET + 2])) / 100.0);
            put(&mut out, Quantity::AccessoryVoltage, f64::from(be_uint(&payload[ACCESSORY_VOLTAGE_OFFSET..ACCESSORY_VOLTAGE_OFFSET + 2])) / 1000.0);
            put(&mut out, Quantity::Health, f64::from(be_uint(&payload[HEALTH_OFFSET..HEALTH_OFFSET + 2])) / 1024.0 * 10.0);
            put(&mut out, Quantity::StateOfCharge, f64::from(be_uint(&payload[SOC_OFFSET..SOC_OFFSET + 3])) / 10000.0);
            put(&mut out, Quantity::Capacity, capacity_raw / 10000.0);
            put(&mut out, Quantity::StateOfHealth, capacity_raw / 65.5 / 100.0);
        }
        ReportGroup::CellVoltages => {
            require(group, payload, FIRST_CELL_OFFSET + CELL_COUNT * 2)?;
            for (i, raw) in payload[FIRST_CELL_OFFSET..FIRST_CELL_OFFSET + CELL_COUNT * 2]
                .chunks_exact(2)
                .enumerate()
            {
                put(&mut out, Quantity::CellVoltage(i as u8 + 1), f64::from(be_uint(raw)) / 1000.0);
            }
        }
        ReportGroup::VoltageExtremes => {
            require(group, payload, V_MIN_OFFSET + 2)?;
            let v_max = f64::from(be_uint(&payload[V_MAX_OFFSET..V_MAX_OFFSET + 2])) / 1000.0;
            let v_min = f64::from(be_uint(&payload[V_MIN_OFFSET..V_MIN_OFFSET + 2])) / 1000.0;
            put(&mut out, Quantity::CellVoltageMax, v_max);
            put(&mut out, Quantity::CellVoltageMin, v_min);
            put(&mut out, Quantity::CellVoltageDelta, v_max - v_min);
        }
        ReportGroup::Temperatures => {
            require(group, payload, TEMPERATURE_OFFSETS[TEMPERATURE_SENSORS - 1] + 1)?;
            let mut extremes: Option<(f64, f64)> = None;
            for (i, offset) in TEMPERATURE_OFFSETS.iter().enumerate() {
                let raw = payload[*offset];
                if raw == SENSOR_ABSENT {
                    debug!(sensor = i + 1, "Temperature sensor absent");
                    let _ = out.push(Measurement::absent(Quantity::Temperature(i as u8 + 1)));
                    continue;
                }
                let celsius = f64::from(raw);
                put(&mut out, Quantity::Temperature(i as u8 + 1), celsius);
                extremes = Some(match extremes {
                    Some((lo, hi)) => (lo.min(celsius), hi.max(celsius)),
                    None => (celsius, celsius),
                });
            }
            if let Some((lo, hi)) = extremes {
                put(&mut out, Quantity::TemperatureMax, hi);
                put(&mut out, Quantity::TemperatureMin, lo);
            }
        }
    }
    Ok(out)
}

/// Pack current and voltage broadcast on the unsolicited telemetry id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PackTelemetry {
    pub current_a: f64,
    pub voltage_v: f64,
}

/// Current: top 11 bits of bytes 0..2, signed, 0.5 A per bit.
/// Voltage: top 10 bits of bytes 2..4, 0.5 V per bit.
pub fn decode_pack_telemetry(data: &[u8]) -> Result<PackTelemetry, DecodeError> {
    if data.len() < 4 {
        return Err(DecodeError::PackFrameTooShort(data.len()));
    }
    let current_raw = (u16::from_be_bytes([data[0], data[1]]) >> 5) as i16;
    let current_raw = if current_raw & 0x400 != 0 {
        current_raw - 0x800
    } else {
        current_raw
    };
    let voltage_raw = u16::from_be_bytes([data[2], data[3]]) >> 6;
    Ok(PackTelemetry {
        current_a: f64::from(current_raw) * 0.5,
        voltage_v: f64::from(voltage_raw) * 0.5,
    })
}

/// Structured, timestamped record for one decoded group.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub sequence: u32,
    pub timestamp_ms: u64,
    pub group: ReportGroup,
    pub measurements: Measurements,
}

impl TelemetryRecord {
    pub fn get(&self, quantity: Quantity) -> Option<f64> {
        self.measurements
            .iter()
            .find(|m| m.quantity == quantity)
            .map(|m| m.value)
    }
}

impl Serialize for TelemetryRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.measurements.len() + 3))?;
        map.serialize_entry("sequence", &self.sequence)?;
        map.serialize_entry("timestamp_ms", &self.timestamp_ms)?;
        map.serialize_entry("group", &self.group)?;
        for m in &self.measurements {
            let value = m.is_present().then_some(m.value);
            map.serialize_entry(m.quantity.name().as_str(), &value)?;
        }
        map.end()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("telemetry sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Destination for telemetry records. Storage format and rotation belong to
/// the implementor.
pub trait TelemetrySink: Send {
    fn write(&mut self, record: &TelemetryRecord) -> Result<(), SinkError>;
}

/// One JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> TelemetrySink for JsonLinesSink<W> {
    fn write(&mut self, record: &TelemetryRecord) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Emits each record as a debug event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn write(&mut self, record: &TelemetryRecord) -> Result<(), SinkError> {
        let json = serde_json::to_string(record)?;
        debug!(group = %record.group, sequence = record.sequence, record = %json, "Telemetry");
        Ok(())
    }
}

/// Keeps records in memory; clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<alloc::vec::Vec<TelemetryRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> alloc::vec::Vec<TelemetryRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for MemorySink {
    fn write(&mut self, record: &TelemetryRecord) -> Result<(), SinkError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}

pub struct TelemetryCollector<S: TelemetrySink> {
    sink: S,
    sequence: u32,
    write_failures: u32,
}

impl<S: TelemetrySink> TelemetryCollector<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            sequence: 0,
            write_failures: 0,
        }
    }

    /// Stamp and forward one decoded group. A sink failure is logged and
    /// counted; it never interrupts monitoring.
    pub fn collect(&mut self, group: ReportGroup, measurements: Measurements) -> TelemetryRecord {
        self.sequence = if self.sequence >= MAX_SEQUENCE_NUMBER {
            0
        } else {
            self.sequence + 1
        };
        let record = TelemetryRecord {
            sequence: self.sequence,
            timestamp_ms: now_ms(),
            group,
            measurements,
        };
        if let Err(e) = self.sink.write(&record) {
            self.write_failures = self.write_failures.saturating_add(1);
            error!(error = %e, "Error while attempting to log telemetry");
        }
        record
    }

    pub fn write_failures(&self) -> u32 {
        self.write_failures
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
