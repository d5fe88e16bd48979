//! Bus port abstraction.
//!
//! The physical transceiver is an external collaborator: the core only needs
//! to push an 8-byte frame out under an identifier and pull the next frame
//! in with a bounded wait. [`MemoryBus`] is an in-process pair of ports used
//! by the simulator and the tests. Sending and receiving are separate traits
//! so the receiving half can be moved into its own task without a lock.

use arrayvec::ArrayString;
use core::fmt::Write;
use core::future::Future;
use heapless::Vec;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifier used for group requests and flow control.
pub const REQUEST_ID: u16 = 0x79B;
/// Identifier the battery controller answers on.
pub const REPLY_ID: u16 = 0x7BB;
/// Unsolicited pack current / voltage broadcast.
pub const PACK_TELEMETRY_ID: u16 = 0x1DB;

pub const MAX_FRAME_DATA: usize = 8;

const MEMORY_BUS_DEPTH: usize = 256;

pub type FrameData = Vec<u8, MAX_FRAME_DATA>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    pub data: FrameData,
}

impl Frame {
    pub fn new(id: u16, bytes: &[u8]) -> Result<Self, BusError> {
        let data = Vec::from_slice(bytes).map_err(|()| BusError::FrameTooLong(bytes.len()))?;
        Ok(Self { id, data })
    }

    /// Byte at `index`, or 0 when the frame is shorter.
    pub fn byte(&self, index: usize) -> u8 {
        self.data.get(index).copied().unwrap_or(0)
    }

    /// Space separated upper-case hex rendering of the data bytes.
    pub fn hex(&self) -> ArrayString<24> {
        let mut out = ArrayString::new();
        for (i, b) in self.data.iter().enumerate() {
            let _ = if i == 0 {
                write!(out, "{b:02X}")
            } else {
                write!(out, " {b:02X}")
            };
        }
        out
    }
}

impl core::fmt::Display for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:03X} [{}]", self.id, self.hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("frame data of {0} bytes exceeds {MAX_FRAME_DATA}")]
    FrameTooLong(usize),
    #[error("bus closed")]
    Closed,
    #[error("bus device error: {0}")]
    Device(String),
}

/// Outbound access to the vehicle bus. Takes `&self` so the transport
/// session and the simulator can share one transmitter.
pub trait BusPort: Send + Sync + 'static {
    fn send(&self, frame: Frame) -> impl Future<Output = Result<(), BusError>> + Send;
}

/// Inbound half of the bus, owned by exactly one task.
pub trait BusReceiver: Send + 'static {
    /// Wait at most `timeout` for the next frame. `Ok(None)` is a timeout.
    fn receive(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Frame>, BusError>> + Send;
}

#[derive(Debug, Clone)]
pub struct MemoryBusTx {
    tx: mpsc::Sender<Frame>,
}

#[derive(Debug)]
pub struct MemoryBusRx {
    rx: mpsc::Receiver<Frame>,
}

/// One end of an in-memory bus. Frames sent on one end are received on the
/// other.
#[derive(Debug)]
pub struct MemoryBus {
    tx: MemoryBusTx,
    rx: MemoryBusRx,
}

impl MemoryBus {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(MEMORY_BUS_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(MEMORY_BUS_DEPTH);
        (
            Self {
                tx: MemoryBusTx { tx: a_tx },
                rx: MemoryBusRx { rx: b_rx },
            },
            Self {
                tx: MemoryBusTx { tx: b_tx },
                rx: MemoryBusRx { rx: a_rx },
            },
        )
    }

    pub fn split(self) -> (MemoryBusTx, MemoryBusRx) {
        (self.tx, self.rx)
    }
}

impl BusPort for MemoryBusTx {
    async fn send(&self, frame: Frame) -> Result<(), BusError> {
        self.tx.send(frame).await.map_err(|_| BusError::Closed)
    }
}

impl BusReceiver for MemoryBusRx {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Ok(None),
        }
    }
}

impl BusPort for MemoryBus {
    async fn send(&self, frame: Frame) -> Result<(), BusError> {
        self.tx.send(frame).await
    }
}

impl BusReceiver for MemoryBus {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError> {
        self.rx.receive(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_more_than_eight_bytes() {
        assert_eq!(Frame::new(REQUEST_ID, &[0; 9]), Err(BusError::FrameTooLong(9)));
        assert!(Frame::new(REQUEST_ID, &[0; 8]).is_ok());
    }

    #[test]
    fn hex_rendering() {
        let frame = Frame::new(REPLY_ID, &[0x10, 0x29, 0x61, 0x01]).unwrap();
        assert_eq!(frame.hex().as_str(), "10 29 61 01");
        assert_eq!(frame.to_string(), "7BB [10 29 61 01]");
        assert_eq!(frame.byte(7), 0);
    }

    #[tokio::test]
    async fn memory_bus_is_crossed() {
        let (mut host, mut device) = MemoryBus::pair();
        host.send(Frame::new(REQUEST_ID, &[1]).unwrap()).await.unwrap();
        let got = device.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(got.map(|f| f.id), Some(REQUEST_ID));
        let none = host.receive(Duration::from_millis(10)).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn split_halves_work_from_separate_tasks() {
        let (host, mut device) = MemoryBus::pair();
        let (host_tx, mut host_rx) = host.split();
        let listener = tokio::spawn(async move { host_rx.receive(Duration::from_millis(200)).await });
        device.send(Frame::new(REPLY_ID, &[0x10]).unwrap()).await.unwrap();
        host_tx.send(Frame::new(REQUEST_ID, &[0x30]).unwrap()).await.unwrap();

        let got = listener.await.unwrap().unwrap();
        assert_eq!(got.map(|f| f.id), Some(REPLY_ID));
        let got = device.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(got.map(|f| f.byte(0)), Some(0x30));
    }

    #[tokio::test]
    async fn dropped_sender_closes_receiver() {
        let (host, mut device) = MemoryBus::pair();
        drop(host);
        assert_eq!(device.receive(Duration::from_millis(10)).await, Err(BusError::Closed));
    }
}
