//! Segmented request/response transport.
//!
//! The battery controller answers a group request with one first frame
//! carrying the total length, waits for a single flow-control frame, then
//! streams the remaining consecutive frames. Each frame carries seven payload
//! bytes after its type byte. The reassembled payload keeps the length byte
//! at index 0; decoder offsets are relative to it.

use crate::bus::{BusError, BusPort, Frame, REQUEST_ID};
use crate::config::SessionConfig;
use crate::telemetry::DecodeError;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

pub const FIRST_FRAME: u8 = 0x10;
pub const CONSECUTIVE_FRAME: u8 = 0x20;
pub const FLOW_CONTROL: u8 = 0x30;
pub const READ_GROUP_SERVICE: u8 = 0x21;
const REQUEST_LENGTH: u8 = 0x02;
const FRAME_TYPE_MASK: u8 = 0xF0;
const SEQUENCE_MASK: u8 = 0x0F;

/// Payload bytes carried by every frame after the type byte.
pub const SEGMENT_PAYLOAD: usize = 7;
pub const MAX_SEGMENTED_PAYLOAD: usize = 259;

/// Frames needed to carry a message whose first frame declares `declared_length`.
pub const fn frames_expected(declared_length: usize) -> usize {
    (declared_length + 1 + SEGMENT_PAYLOAD - 1) / SEGMENT_PAYLOAD
}

const_assert!(frames_expected(u8::MAX as usize) * SEGMENT_PAYLOAD <= MAX_SEGMENTED_PAYLOAD);

pub type Payload = Vec<u8, MAX_SEGMENTED_PAYLOAD>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportGroup {
    General,
    CellVoltages,
    VoltageExtremes,
    Temperatures,
}

impl ReportGroup {
    pub const ALL: [ReportGroup; 4] = [
        ReportGroup::General,
        ReportGroup::CellVoltages,
        ReportGroup::VoltageExtremes,
        ReportGroup::Temperatures,
    ];

    /// Group number sent in the request frame.
    pub fn code(self) -> u8 {
        match self {
            ReportGroup::General => 0x01,
            ReportGroup::CellVoltages => 0x02,
            ReportGroup::VoltageExtremes => 0x03,
            ReportGroup::Temperatures => 0x04,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.code() == code)
    }

    pub fn next(self) -> Self {
        match self {
            ReportGroup::General => ReportGroup::CellVoltages,
            ReportGroup::CellVoltages => ReportGroup::VoltageExtremes,
            ReportGroup::VoltageExtremes => ReportGroup::Temperatures,
            ReportGroup::Temperatures => ReportGroup::General,
        }
    }

    /// Number of frames the controller sends for this group.
    pub fn frame_count(self) -> usize {
        match self {
            ReportGroup::General => 6,
            ReportGroup::CellVoltages => 29,
            ReportGroup::VoltageExtremes => 5,
            ReportGroup::Temperatures => 3,
        }
    }

    pub fn from_frame_count(count: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.frame_count() == count)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl core::fmt::Display for ReportGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ReportGroup::General => "general",
            ReportGroup::CellVoltages => "cell-voltages",
            ReportGroup::VoltageExtremes => "voltage-extremes",
            ReportGroup::Temperatures => "temperatures",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected frame type 0x{found:02X}, expected 0x{expected:02X}")]
    UnexpectedFrameType { expected: u8, found: u8 },
    #[error("consecutive frame out of sequence: expected {expected}, got {found}")]
    SequenceMismatch { expected: u8, found: u8 },
    #[error("frame received after message was complete")]
    MessageOverrun,
    #[error("empty frame")]
    EmptyFrame,
    #[error("unrecognised data group length {0}")]
    UnrecognizedFrameCount(usize),
    #[error("received {received} report while {requested} was requested")]
    GroupMismatch {
        requested: ReportGroup,
        received: ReportGroup,
    },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Which wait of the exchange ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaitStage {
    FirstFrame,
    ConsecutiveFrame,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("timed out waiting for {group} {stage:?}")]
    Timeout { group: ReportGroup, stage: WaitStage },
    #[error("protocol anomaly: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("reply queue closed")]
    QueueClosed,
}

pub fn request_frame(group: ReportGroup) -> Frame {
    Frame {
        id: REQUEST_ID,
        data: Vec::from_slice(&[REQUEST_LENGTH, READ_GROUP_SERVICE, group.code(), 0, 0, 0, 0, 0])
            .unwrap_or_default(),
    }
}

pub fn flow_control_frame() -> Frame {
    Frame {
        id: REQUEST_ID,
        data: Vec::from_slice(&[FLOW_CONTROL, 0, 0, 0, 0, 0, 0, 0]).unwrap_or_default(),
    }
}

/// Split a payload (length byte first) into first + consecutive frames.
pub fn segment(id: u16, payload: &[u8]) -> alloc::vec::Vec<Frame> {
    payload
        .chunks(SEGMENT_PAYLOAD)
        .enumerate()
        .map(|(i, chunk)| {
            let type_byte = if i == 0 {
                FIRST_FRAME
            } else {
                CONSECUTIVE_FRAME | (i as u8 & SEQUENCE_MASK)
            };
            let mut data = Vec::new();
            let _ = data.push(type_byte);
            let _ = data.extend_from_slice(chunk);
            Frame { id, data }
        })
        .collect()
}

/// A completely reassembled report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub group: ReportGroup,
    #[serde(serialize_with = "serialize_payload")]
    pub payload: Payload,
}

fn serialize_payload<S: serde::Serializer>(payload: &Payload, serializer: S) -> Result<S::Ok, S::Error> {
    serde_bytes::serialize(payload.as_slice(), serializer)
}

/// One in-flight multi-frame reply.
#[derive(Debug, Clone)]
pub struct SegmentedMessage {
    requested: ReportGroup,
    declared_length: usize,
    frames_received: usize,
    next_sequence: u8,
    payload: Payload,
}

impl SegmentedMessage {
    /// Begin reassembly from a first frame.
    pub fn start(requested: ReportGroup, frame: &Frame) -> Result<Self, ProtocolError> {
        let type_byte = *frame.data.first().ok_or(ProtocolError::EmptyFrame)?;
        if type_byte != FIRST_FRAME {
            return Err(ProtocolError::UnexpectedFrameType {
                expected: FIRST_FRAME,
                found: type_byte,
            });
        }
        let mut payload = Payload::new();
        let _ = payload.extend_from_slice(&frame.data[1..]);
        Ok(Self {
            requested,
            declared_length: usize::from(frame.byte(1)),
            frames_received: 1,
            next_sequence: 1,
            payload,
        })
    }

    /// Append a consecutive frame. Sequence numbers run 1..=15 then wrap to 0.
    pub fn push(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        if self.is_complete() {
            return Err(ProtocolError::MessageOverrun);
        }
        let type_byte = *frame.data.first().ok_or(ProtocolError::EmptyFrame)?;
        if type_byte & FRAME_TYPE_MASK != CONSECUTIVE_FRAME {
            return Err(ProtocolError::UnexpectedFrameType {
                expected: CONSECUTIVE_FRAME | self.next_sequence,
                found: type_byte,
            });
        }
        let sequence = type_byte & SEQUENCE_MASK;
        if sequence != self.next_sequence {
            return Err(ProtocolError::SequenceMismatch {
                expected: self.next_sequence,
                found: sequence,
            });
        }
        self.payload
            .extend_from_slice(&frame.data[1..])
            .map_err(|()| ProtocolError::MessageOverrun)?;
        self.frames_received += 1;
        self.next_sequence = (self.next_sequence + 1) & SEQUENCE_MASK;
        Ok(())
    }

    pub fn requested(&self) -> ReportGroup {
        self.requested
    }

    pub fn declared_length(&self) -> usize {
        self.declared_length
    }

    pub fn frames_expected(&self) -> usize {
        frames_expected(self.declared_length)
    }

    pub fn frames_received(&self) -> usize {
        self.frames_received
    }

    pub fn is_complete(&self) -> bool {
        self.frames_received >= self.frames_expected()
    }

    /// Classify the completed message by its frame count.
    pub fn finish(self) -> Result<Report, ProtocolError> {
        let count = self.frames_expected();
        let group =
            ReportGroup::from_frame_count(count).ok_or(ProtocolError::UnrecognizedFrameCount(count))?;
        if group != self.requested {
            return Err(ProtocolError::GroupMismatch {
                requested: self.requested,
                received: group,
            });
        }
        Ok(Report {
            group,
            payload: self.payload,
        })
    }
}

/// Consumer of completed reports.
///
/// A decode failure is returned so the session can count it as an anomaly
/// and restart the cycle.
pub trait ReportHandler: Send {
    fn handle(&mut self, report: &Report) -> Result<(), DecodeError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub completed: [u32; 4],
    pub timeouts: u32,
    pub anomalies: u32,
    pub bus_errors: u32,
    pub restarts: u32,
}

impl SessionStats {
    pub fn completed(&self, group: ReportGroup) -> u32 {
        self.completed[group.index()]
    }
}

/// Outcome of one request cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Report handled; the next request is for `next`.
    Completed { group: ReportGroup, next: ReportGroup },
    /// Message abandoned; the cycle restarts from [`ReportGroup::General`].
    Restarted { group: ReportGroup, error: SessionError },
    /// The reply queue is gone; the session cannot continue.
    Closed,
}

/// Result of one bounded poll on the reply queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    Frame(Frame),
    Timeout,
    Closed,
}

pub struct TransportSession<B: BusPort> {
    bus: B,
    replies: mpsc::Receiver<Frame>,
    config: SessionConfig,
    in_flight: ReportGroup,
    stats: SessionStats,
}

impl<B: BusPort> TransportSession<B> {
    pub fn new(bus: B, replies: mpsc::Receiver<Frame>, config: SessionConfig) -> Self {
        Self {
            bus,
            replies,
            config,
            in_flight: ReportGroup::General,
            stats: SessionStats::default(),
        }
    }

    /// Group that the next (or current) request is for.
    pub fn in_flight(&self) -> ReportGroup {
        self.in_flight
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub async fn request(&mut self, group: ReportGroup) -> Result<(), BusError> {
        self.in_flight = group;
        self.bus.send(request_frame(group)).await?;
        debug!(%group, "Request sent for data group");
        Ok(())
    }

    pub async fn poll(&mut self, wait: std::time::Duration) -> Poll {
        match timeout(wait, self.replies.recv()).await {
            Ok(Some(frame)) => Poll::Frame(frame),
            Ok(None) => Poll::Closed,
            Err(_) => Poll::Timeout,
        }
    }

    /// Drive steps 2 to 5 of the exchange for the group already requested.
    pub async fn exchange(&mut self) -> Result<Report, SessionError> {
        let group = self.in_flight;
        let mut message = self.await_first_frame(group).await?;
        self.bus.send(flow_control_frame()).await?;
        debug!(
            %group,
            declared_length = message.declared_length(),
            frames_expected = message.frames_expected(),
            "First frame received, flow control sent"
        );

        while !message.is_complete() {
            match self.poll(self.config.frame_timeout()).await {
                Poll::Frame(frame) => message.push(&frame)?,
                Poll::Timeout => {
                    return Err(SessionError::Timeout {
                        group,
                        stage: WaitStage::ConsecutiveFrame,
                    })
                }
                Poll::Closed => return Err(SessionError::QueueClosed),
            }
        }
        Ok(message.finish()?)
    }

    async fn await_first_frame(&mut self, group: ReportGroup) -> Result<SegmentedMessage, SessionError> {
        let deadline = Instant::now() + self.config.frame_timeout();
        loop {
            let frame = match timeout_at(deadline, self.replies.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(SessionError::QueueClosed),
                Err(_) => {
                    return Err(SessionError::Timeout {
                        group,
                        stage: WaitStage::FirstFrame,
                    })
                }
            };
            match SegmentedMessage::start(group, &frame) {
                Ok(message) => return Ok(message),
                Err(e) => {
                    error!(%group, frame = %frame, error = %e, "CAN message out of sequence");
                }
            }
        }
    }

    /// Run one full request cycle: request, reassemble, hand off, then wait
    /// the settle delay (or the back-off after a failure).
    pub async fn cycle<H: ReportHandler>(&mut self, handler: &mut H) -> CycleOutcome {
        let group = self.in_flight;
        let result = match self.request(group).await {
            Ok(()) => self.exchange().await,
            Err(e) => Err(SessionError::Bus(e)),
        };
        let result = result.and_then(|report| {
            handler
                .handle(&report)
                .map_err(|e| SessionError::Protocol(e.into()))
        });

        match result {
            Ok(()) => {
                self.stats.completed[group.index()] += 1;
                let next = group.next();
                self.in_flight = next;
                sleep(self.config.settle_delay()).await;
                CycleOutcome::Completed { group, next }
            }
            Err(SessionError::QueueClosed) => {
                error!(%group, "Reply queue closed, transport session stopping");
                CycleOutcome::Closed
            }
            Err(error) => {
                self.record_failure(group, &error);
                self.restart().await;
                CycleOutcome::Restarted { group, error }
            }
        }
    }

    fn record_failure(&mut self, group: ReportGroup, error: &SessionError) {
        match error {
            SessionError::Timeout { stage, .. } => {
                self.stats.timeouts += 1;
                warn!(%group, ?stage, "Get CAN msg timed out, restarting request cycle");
            }
            SessionError::Protocol(e) => {
                self.stats.anomalies += 1;
                error!(%group, error = %e, "Protocol anomaly, message discarded");
            }
            SessionError::Bus(e) => {
                self.stats.bus_errors += 1;
                error!(%group, error = %e, "Bus error during request cycle");
            }
            SessionError::QueueClosed => {}
        }
    }

    /// Discard any partial data, back off, and point the cycle at General.
    async fn restart(&mut self) {
        self.stats.restarts += 1;
        sleep(self.config.backoff()).await;
        let mut discarded = 0usize;
        while self.replies.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "Dropped stale reply frames");
        }
        self.in_flight = ReportGroup::General;
    }

    /// Cycle until shutdown is signalled or the reply queue closes.
    pub async fn run<H: ReportHandler>(mut self, mut handler: H, mut shutdown: watch::Receiver<bool>) -> SessionStats {
        info!("Transport session started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                outcome = self.cycle(&mut handler) => {
                    if outcome == CycleOutcome::Closed {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(stats = ?self.stats, "Transport session stopped");
        self.stats
    }
}
