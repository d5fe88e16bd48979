//! Simulated battery controller.
//!
//! [`SimulatedController`] sits on the device end of a [`MemoryBus`](crate::bus::MemoryBus) and
//! answers group requests the way the real controller does: a first frame,
//! a pause for flow control, then the consecutive frames. A deterministic
//! [`FaultInjector`] can drop or damage replies and push the pack model
//! outside its limits for a while.

use crate::bus::{BusPort, BusReceiver, Frame, PACK_TELEMETRY_ID, REPLY_ID, REQUEST_ID};
use crate::protocol::{segment, ReportGroup, CONSECUTIVE_FRAME, FLOW_CONTROL, READ_GROUP_SERVICE};
use crate::telemetry::{CELL_COUNT, SENSOR_ABSENT, TEMPERATURE_SENSORS};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

// Fault rates per served request
const DROP_RESPONSE_PERCENT: f32 = 1.0;
const CORRUPT_SEQUENCE_PERCENT: f32 = 0.5;
const DROP_SEGMENT_PERCENT: f32 = 0.5;
const EXCURSION_PERCENT: f32 = 2.0;

/// How many reports an excursion stays active for.
const EXCURSION_REPORTS: u32 = 8;
const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const PACK_BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

// Reply framing
const POSITIVE_RESPONSE: u8 = 0x61;
const GENERAL_LENGTH: u8 = 41;
const CELL_VOLTAGES_LENGTH: u8 = 202;
const VOLTAGE_EXTREMES_LENGTH: u8 = 34;
const TEMPERATURES_LENGTH: u8 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    /// Request ignored entirely.
    pub drop_response_percent: f32,
    /// One consecutive frame sent with the wrong sequence number.
    pub corrupt_sequence_percent: f32,
    /// One consecutive frame never sent.
    pub drop_segment_percent: f32,
    /// Pack pushed past a critical limit for a few reports.
    pub excursion_percent: f32,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            drop_response_percent: DROP_RESPONSE_PERCENT,
            corrupt_sequence_percent: CORRUPT_SEQUENCE_PERCENT,
            drop_segment_percent: DROP_SEGMENT_PERCENT,
            excursion_percent: EXCURSION_PERCENT,
        }
    }
}

impl FaultInjectionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultInjectionStats {
    pub requests_served: u32,
    pub responses_dropped: u32,
    pub sequences_corrupted: u32,
    pub segments_dropped: u32,
    pub excursions: u32,
}

/// Damage applied to one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFault {
    None,
    DropResponse,
    /// Index into the consecutive frames.
    CorruptSequence(usize),
    DropSegment(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Excursion {
    CellOvervoltage,
    OverTemperature,
}

/// Probabilistic fault source with a seeded generator so runs repeat.
#[derive(Debug)]
pub struct FaultInjector {
    config: FaultInjectionConfig,
    stats: FaultInjectionStats,
    rng_state: u64,
}

impl FaultInjector {
    pub fn new(config: FaultInjectionConfig) -> Self {
        Self::with_seed(config, DEFAULT_SEED)
    }

    pub fn with_seed(config: FaultInjectionConfig, seed: u64) -> Self {
        Self {
            config,
            stats: FaultInjectionStats::default(),
            rng_state: seed,
        }
    }

    pub fn config(&self) -> &FaultInjectionConfig {
        &self.config
    }

    pub fn stats(&self) -> &FaultInjectionStats {
        &self.stats
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    /// Pick the damage for a reply made of `consecutive` follow-on frames.
    pub fn reply_fault(&mut self, consecutive: usize) -> ReplyFault {
        self.stats.requests_served += 1;
        if !self.config.enabled {
            return ReplyFault::None;
        }
        if self.roll(self.config.drop_response_percent) {
            self.stats.responses_dropped += 1;
            return ReplyFault::DropResponse;
        }
        if consecutive == 0 {
            return ReplyFault::None;
        }
        if self.roll(self.config.corrupt_sequence_percent) {
            self.stats.sequences_corrupted += 1;
            return ReplyFault::CorruptSequence(self.random_index(consecutive));
        }
        if self.roll(self.config.drop_segment_percent) {
            self.stats.segments_dropped += 1;
            return ReplyFault::DropSegment(self.random_index(consecutive));
        }
        ReplyFault::None
    }

    pub fn excursion(&mut self) -> Option<Excursion> {
        if !self.config.enabled || !self.roll(self.config.excursion_percent) {
            return None;
        }
        self.stats.excursions += 1;
        Some(if self.next_random() & 1 == 0 {
            Excursion::CellOvervoltage
        } else {
            Excursion::OverTemperature
        })
    }

    fn roll(&mut self, percent: f32) -> bool {
        self.random_float() < percent / 100.0
    }

    fn random_index(&mut self, len: usize) -> usize {
        (self.next_random() >> 33) as usize % len
    }

    fn next_random(&mut self) -> u64 {
        // Numerical Recipes LCG
        self.rng_state = self.rng_state.wrapping_mul(1664525).wrapping_add(1013904223);
        self.rng_state
    }

    fn random_float(&mut self) -> f32 {
        (self.next_random() >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Synthetic pack state, encoded in the controller's reply layout.
#[derive(Debug, Clone, PartialEq)]
pub struct PackModel {
    pub cell_mv: [u16; CELL_COUNT],
    /// Raw sensor bytes, `SENSOR_ABSENT` for a missing sensor.
    pub temperatures: [u8; TEMPERATURE_SENSORS],
    pub accessory_mv: u16,
    pub health_raw: u16,
    pub soc_raw: u32,
    pub capacity_raw: u32,
    /// Signed, 0.5 A per bit.
    pub current_raw: i16,
    excursion: Option<(Excursion, u32)>,
}

impl Default for PackModel {
    fn default() -> Self {
        let mut cell_mv = [0; CELL_COUNT];
        for (i, cell) in cell_mv.iter_mut().enumerate() {
            *cell = 3897 + (i % 7) as u16;
        }
        Self {
            cell_mv,
            temperatures: [22, 23, 21, SENSOR_ABSENT],
            accessory_mv: 13_800,
            health_raw: 1004,
            soc_raw: 654_321,
            capacity_raw: 412_650,
            current_raw: -24,
            excursion: None,
        }
    }
}

fn put_be(buf: &mut [u8], offset: usize, value: u32, width: usize) {
    for i in 0..width {
        buf[offset + i] = (value >> (8 * (width - 1 - i))) as u8;
    }
}

impl PackModel {
    pub fn start_excursion(&mut self, kind: Excursion, reports: u32) {
        info!(?kind, reports, "Simulated excursion started");
        self.excursion = Some((kind, reports));
    }

    pub fn excursion(&self) -> Option<Excursion> {
        self.excursion.map(|(kind, _)| kind)
    }

    fn effective_cells(&self) -> [u16; CELL_COUNT] {
        let mut cells = self.cell_mv;
        if self.excursion() == Some(Excursion::CellOvervoltage) {
            cells[16] = 4_160;
        }
        cells
    }

    fn effective_temperatures(&self) -> [u8; TEMPERATURE_SENSORS] {
        let mut temps = self.temperatures;
        if self.excursion() == Some(Excursion::OverTemperature) {
            temps[0] = 52;
        }
        temps
    }

    /// Count one served report against the active excursion.
    pub fn tick(&mut self) {
        if let Some((kind, remaining)) = self.excursion {
            self.excursion = if remaining <= 1 {
                info!(?kind, "Simulated excursion cleared");
                None
            } else {
                Some((kind, remaining - 1))
            };
        }
    }

    pub fn pack_voltage_centivolts(&self) -> u32 {
        self.effective_cells().iter().map(|mv| u32::from(*mv)).sum::<u32>() / 10
    }

    /// Reply payload for `group`, length byte first.
    pub fn payload(&self, group: ReportGroup) -> alloc::vec::Vec<u8> {
        let length = match group {
            ReportGroup::General => GENERAL_LENGTH,
            ReportGroup::CellVoltages => CELL_VOLTAGES_LENGTH,
            ReportGroup::VoltageExtremes => VOLTAGE_EXTREMES_LENGTH,
            ReportGroup::Temperatures => TEMPERATURES_LENGTH,
        };
        let mut buf = vec![0u8; usize::from(length) + 1];
        buf[0] = length;
        buf[1] = POSITIVE_RESPONSE;
        buf[2] = group.code();

        let cells = self.effective_cells();
        match group {
            ReportGroup::General => {
                put_be(&mut buf, 21, self.pack_voltage_centivolts(), 2);
                put_be(&mut buf, 23, u32::from(self.accessory_mv), 2);
                put_be(&mut buf, 29, u32::from(self.health_raw), 2);
                put_be(&mut buf, 32, self.soc_raw, 3);
                put_be(&mut buf, 36, self.capacity_raw, 3);
            }
            ReportGroup::CellVoltages => {
                for (i, mv) in cells.iter().enumerate() {
                    put_be(&mut buf, 3 + 2 * i, u32::from(*mv), 2);
                }
            }
            ReportGroup::VoltageExtremes => {
                let max = cells.iter().copied().max().unwrap_or(0);
                let min = cells.iter().copied().min().unwrap_or(0);
                put_be(&mut buf, 13, u32::from(max), 2);
                put_be(&mut buf, 15, u32::from(min), 2);
            }
            ReportGroup::Temperatures => {
                for (temp, offset) in self.effective_temperatures().iter().zip([5, 8, 11, 14]) {
                    buf[offset] = *temp;
                }
            }
        }
        buf
    }

    /// Unsolicited current/voltage broadcast.
    pub fn pack_frame(&self) -> Frame {
        let current = ((self.current_raw as u16) & 0x7FF) << 5;
        let voltage = ((self.pack_voltage_centivolts() / 50) as u16 & 0x3FF) << 6;
        let [c0, c1] = current.to_be_bytes();
        let [v0, v1] = voltage.to_be_bytes();
        Frame::new(PACK_TELEMETRY_ID, &[c0, c1, v0, v1, 0, 0, 0, 0]).unwrap_or(Frame {
            id: PACK_TELEMETRY_ID,
            data: heapless::Vec::new(),
        })
    }
}

/// Device end of the bus.
pub struct SimulatedController<B: BusPort + BusReceiver> {
    bus: B,
    model: PackModel,
    injector: FaultInjector,
    /// Consecutive frames held back until flow control arrives.
    pending: VecDeque<Frame>,
}

impl<B: BusPort + BusReceiver> SimulatedController<B> {
    pub fn new(bus: B, model: PackModel, injector: FaultInjector) -> Self {
        Self {
            bus,
            model,
            injector,
            pending: VecDeque::new(),
        }
    }

    pub fn model_mut(&mut self) -> &mut PackModel {
        &mut self.model
    }

    async fn answer_request(&mut self, group: ReportGroup) {
        if let Some(kind) = self.injector.excursion() {
            self.model.start_excursion(kind, EXCURSION_REPORTS);
        }
        let mut frames: VecDeque<Frame> = segment(REPLY_ID, &self.model.payload(group)).into();
        self.model.tick();

        let Some(first) = frames.pop_front() else {
            return;
        };
        match self.injector.reply_fault(frames.len()) {
            ReplyFault::None => {}
            ReplyFault::DropResponse => {
                debug!(%group, "Simulated fault: response dropped");
                return;
            }
            ReplyFault::CorruptSequence(i) => {
                debug!(%group, index = i, "Simulated fault: sequence corrupted");
                if let Some(byte) = frames.get_mut(i).and_then(|f| f.data.first_mut()) {
                    *byte = CONSECUTIVE_FRAME | ((*byte + 3) & 0x0F);
                }
            }
            ReplyFault::DropSegment(i) => {
                debug!(%group, index = i, "Simulated fault: segment dropped");
                frames.remove(i);
            }
        }
        self.pending = frames;
        if let Err(e) = self.bus.send(first).await {
            warn!(error = %e, "Simulated controller send failed");
        }
    }

    async fn flush_pending(&mut self) {
        while let Some(frame) = self.pending.pop_front() {
            if let Err(e) = self.bus.send(frame).await {
                warn!(error = %e, "Simulated controller send failed");
                self.pending.clear();
            }
        }
    }

    async fn handle(&mut self, frame: Frame) {
        if frame.id != REQUEST_ID {
            return;
        }
        match (frame.byte(0), frame.byte(1)) {
            (FLOW_CONTROL, _) => self.flush_pending().await,
            (0x02, READ_GROUP_SERVICE) => match ReportGroup::from_code(frame.byte(2)) {
                Some(group) => self.answer_request(group).await,
                None => warn!(frame = %frame, "Simulated controller: unknown group"),
            },
            _ => debug!(frame = %frame, "Simulated controller ignored frame"),
        }
    }

    /// Serve requests until shutdown or the bus closes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> FaultInjectionStats {
        info!("Simulated battery controller online");
        let mut broadcast = time::interval(PACK_BROADCAST_INTERVAL);
        broadcast.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = broadcast.tick() => {
                    if self.bus.send(self.model.pack_frame()).await.is_err() {
                        break;
                    }
                }
                received = self.bus.receive(POLL_INTERVAL) => match received {
                    Ok(Some(frame)) => self.handle(frame).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Simulated controller bus closed");
                        break;
                    }
                },
            }
        }
        info!(stats = ?self.injector.stats(), "Simulated battery controller offline");
        self.injector.stats().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frames_expected;
    use crate::telemetry::{decode, Quantity};

    #[test]
    fn payload_lengths_match_frame_counts() {
        let model = PackModel::default();
        for group in ReportGroup::ALL {
            let payload = model.payload(group);
            let declared = usize::from(payload[0]);
            assert_eq!(payload.len(), declared + 1);
            assert_eq!(frames_expected(declared), group.frame_count());
            assert_eq!(segment(REPLY_ID, &payload).len(), group.frame_count());
        }
    }

    #[test]
    fn model_decodes_inside_limits() {
        let model = PackModel::default();
        let extremes = decode(ReportGroup::VoltageExtremes, &model.payload(ReportGroup::VoltageExtremes)).unwrap();
        let get = |q| extremes.iter().find(|m| m.quantity == q).map(|m| m.value).unwrap();
        assert!((get(Quantity::CellVoltageMax) - 3.903).abs() < 1e-9);
        assert!((get(Quantity::CellVoltageMin) - 3.897).abs() < 1e-9);
        assert!(get(Quantity::CellVoltageDelta) < 0.01);
    }

    #[test]
    fn excursion_expires() {
        let mut model = PackModel::default();
        model.start_excursion(Excursion::OverTemperature, 2);
        let temps = decode(ReportGroup::Temperatures, &model.payload(ReportGroup::Temperatures)).unwrap();
        assert!(temps.iter().any(|m| m.quantity == Quantity::TemperatureMax && m.value == 52.0));
        model.tick();
        model.tick();
        assert_eq!(model.excursion(), None);
    }

    #[test]
    fn disabled_injector_never_faults() {
        let mut injector = FaultInjector::new(FaultInjectionConfig::disabled());
        for _ in 0..1000 {
            assert_eq!(injector.reply_fault(28), ReplyFault::None);
            assert_eq!(injector.excursion(), None);
        }
        assert_eq!(injector.stats().requests_served, 1000);
    }

    #[test]
    fn injector_is_deterministic() {
        let config = FaultInjectionConfig {
            drop_response_percent: 20.0,
            ..FaultInjectionConfig::default()
        };
        let mut a = FaultInjector::with_seed(config.clone(), 7);
        let mut b = FaultInjector::with_seed(config, 7);
        let run_a: alloc::vec::Vec<_> = (0..200).map(|_| a.reply_fault(5)).collect();
        let run_b: alloc::vec::Vec<_> = (0..200).map(|_| b.reply_fault(5)).collect();
        assert_eq!(run_a, run_b);
        assert!(a.stats().responses_dropped > 0);
    }

    #[test]
    fn random_float_in_unit_range() {
        let mut injector = FaultInjector::new(FaultInjectionConfig::default());
        for _ in 0..1000 {
            let f = injector.random_float();
            assert!((0.0..1.0).contains(&f));
        }
    }
}
