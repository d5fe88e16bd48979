use hvbmu::bus::{BusReceiver, Frame, MemoryBus, REPLY_ID, REQUEST_ID};
use hvbmu::config::SessionConfig;
use hvbmu::protocol::*;
use hvbmu::sim::PackModel;
use hvbmu::telemetry::DecodeError;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[derive(Default)]
struct Collect(Vec<Report>);

impl ReportHandler for Collect {
    fn handle(&mut self, report: &Report) -> Result<(), DecodeError> {
        self.0.push(report.clone());
        Ok(())
    }
}

struct Harness {
    session: TransportSession<MemoryBus>,
    device: MemoryBus,
    replies: mpsc::Sender<Frame>,
}

fn harness() -> Harness {
    let (host, device) = MemoryBus::pair();
    let (replies, rx) = mpsc::channel(64);
    Harness {
        session: TransportSession::new(host, rx, SessionConfig::default()),
        device,
        replies,
    }
}

fn reply_frames(group: ReportGroup) -> Vec<Frame> {
    segment(REPLY_ID, &PackModel::default().payload(group))
}

async fn queue(h: &Harness, frames: &[Frame]) {
    for f in frames {
        h.replies.send(f.clone()).await.unwrap();
    }
}

async fn sent(device: &mut MemoryBus) -> Vec<Frame> {
    let mut out = Vec::new();
    while let Ok(Some(f)) = device.receive(Duration::from_millis(1)).await {
        out.push(f);
    }
    out
}

#[test]
fn test_segmentation_boundaries() {
    let frames = reply_frames(ReportGroup::General);
    assert_eq!(frames.len(), 6);
    let mut message = SegmentedMessage::start(ReportGroup::General, &frames[0]).unwrap();
    assert_eq!(message.declared_length(), 41);
    assert_eq!(message.frames_expected(), 6);
    for f in &frames[1..] {
        message.push(f).unwrap();
    }
    assert!(message.is_complete());
    assert_eq!(message.push(&frames[1]), Err(ProtocolError::MessageOverrun));
    let report = message.finish().unwrap();
    assert_eq!(report.group, ReportGroup::General);
    assert_eq!(report.payload[0], 41);
}

#[test]
fn test_frame_counts_classify_groups() {
    for group in ReportGroup::ALL {
        assert_eq!(ReportGroup::from_frame_count(group.frame_count()), Some(group));
    }
    assert_eq!(ReportGroup::from_frame_count(7), None);
}

#[test]
fn test_consecutive_before_first_rejected() {
    let frames = reply_frames(ReportGroup::Temperatures);
    let err = SegmentedMessage::start(ReportGroup::Temperatures, &frames[1]).unwrap_err();
    assert!(matches!(err, ProtocolError::UnexpectedFrameType { expected: FIRST_FRAME, .. }));
}

#[test]
fn test_sequence_gap_rejected() {
    let frames = reply_frames(ReportGroup::VoltageExtremes);
    let mut message = SegmentedMessage::start(ReportGroup::VoltageExtremes, &frames[0]).unwrap();
    let err = message.push(&frames[2]).unwrap_err();
    assert_eq!(err, ProtocolError::SequenceMismatch { expected: 1, found: 2 });
}

#[test]
fn test_long_message_sequence_wraps() {
    let frames = reply_frames(ReportGroup::CellVoltages);
    assert_eq!(frames.len(), 29);
    let mut message = SegmentedMessage::start(ReportGroup::CellVoltages, &frames[0]).unwrap();
    for f in &frames[1..] {
        message.push(f).unwrap();
    }
    assert_eq!(message.finish().unwrap().group, ReportGroup::CellVoltages);
}

#[tokio::test(start_paused = true)]
async fn test_completed_exchange_advances_group() {
    let mut h = harness();
    queue(&h, &reply_frames(ReportGroup::General)).await;
    let mut handler = Collect::default();

    let outcome = h.session.cycle(&mut handler).await;
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            group: ReportGroup::General,
            next: ReportGroup::CellVoltages
        }
    );
    assert_eq!(h.session.in_flight(), ReportGroup::CellVoltages);
    assert_eq!(handler.0.len(), 1);
    assert_eq!(h.session.stats().completed(ReportGroup::General), 1);

    let on_bus = sent(&mut h.device).await;
    assert_eq!(on_bus.len(), 2);
    assert_eq!(on_bus[0], request_frame(ReportGroup::General));
    assert_eq!(on_bus[1], flow_control_frame());
    assert!(on_bus.iter().all(|f| f.id == REQUEST_ID));
}

#[tokio::test(start_paused = true)]
async fn test_first_frame_timeout_restarts_at_general() {
    let mut h = harness();
    let mut handler = Collect::default();
    let start = Instant::now();

    let outcome = h.session.cycle(&mut handler).await;
    assert_eq!(
        outcome,
        CycleOutcome::Restarted {
            group: ReportGroup::General,
            error: SessionError::Timeout {
                group: ReportGroup::General,
                stage: WaitStage::FirstFrame
            }
        }
    );
    // Frame timeout plus back-off.
    assert!(start.elapsed() >= Duration::from_millis(700));
    assert_eq!(h.session.in_flight(), ReportGroup::General);
    assert_eq!(h.session.stats().timeouts, 1);
    assert!(handler.0.is_empty());
    assert_eq!(sent(&mut h.device).await, vec![request_frame(ReportGroup::General)]);

    // After the back-off the next thing on the bus is a fresh General request.
    queue(&h, &reply_frames(ReportGroup::General)).await;
    let outcome = h.session.cycle(&mut handler).await;
    assert!(matches!(outcome, CycleOutcome::Completed { group: ReportGroup::General, .. }));
    let on_bus = sent(&mut h.device).await;
    assert_eq!(on_bus.first(), Some(&request_frame(ReportGroup::General)));
}

#[tokio::test(start_paused = true)]
async fn test_mid_cycle_timeout_returns_to_general() {
    let mut h = harness();
    let mut handler = Collect::default();
    for group in [ReportGroup::General, ReportGroup::CellVoltages] {
        queue(&h, &reply_frames(group)).await;
        h.session.cycle(&mut handler).await;
    }
    assert_eq!(h.session.in_flight(), ReportGroup::VoltageExtremes);

    // Only the first frame of the extremes reply arrives.
    queue(&h, &reply_frames(ReportGroup::VoltageExtremes)[..1]).await;
    let outcome = h.session.cycle(&mut handler).await;
    assert!(matches!(
        outcome,
        CycleOutcome::Restarted {
            error: SessionError::Timeout {
                stage: WaitStage::ConsecutiveFrame,
                ..
            },
            ..
        }
    ));
    assert_eq!(h.session.in_flight(), ReportGroup::General);
    assert_eq!(handler.0.len(), 2);

    sent(&mut h.device).await;
    h.session.cycle(&mut handler).await;
    let on_bus = sent(&mut h.device).await;
    assert_eq!(on_bus.first(), Some(&request_frame(ReportGroup::General)));
}

#[tokio::test(start_paused = true)]
async fn test_sequence_anomaly_discards_and_drains() {
    let mut h = harness();
    let mut handler = Collect::default();
    let frames = reply_frames(ReportGroup::General);
    // Frame 2 goes missing; the remainder sits in the queue.
    let damaged: Vec<Frame> = frames.iter().enumerate().filter(|(i, _)| *i != 2).map(|(_, f)| f.clone()).collect();
    queue(&h, &damaged).await;

    let outcome = h.session.cycle(&mut handler).await;
    assert!(matches!(
        outcome,
        CycleOutcome::Restarted {
            error: SessionError::Protocol(ProtocolError::SequenceMismatch { expected: 2, found: 3 }),
            ..
        }
    ));
    assert_eq!(h.session.stats().anomalies, 1);
    assert!(handler.0.is_empty());

    // Stale frames were drained, so a clean reply goes through next.
    queue(&h, &frames).await;
    let outcome = h.session.cycle(&mut handler).await;
    assert!(matches!(outcome, CycleOutcome::Completed { group: ReportGroup::General, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_stray_frame_before_first_frame_is_skipped() {
    let mut h = harness();
    let mut handler = Collect::default();
    let frames = reply_frames(ReportGroup::General);
    queue(&h, &frames[3..4]).await;
    queue(&h, &frames).await;
    let outcome = h.session.cycle(&mut handler).await;
    assert!(matches!(outcome, CycleOutcome::Completed { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_wrong_group_reply_is_an_anomaly() {
    let mut h = harness();
    let mut handler = Collect::default();
    queue(&h, &reply_frames(ReportGroup::Temperatures)).await;
    let outcome = h.session.cycle(&mut handler).await;
    assert!(matches!(
        outcome,
        CycleOutcome::Restarted {
            error: SessionError::Protocol(ProtocolError::GroupMismatch {
                requested: ReportGroup::General,
                received: ReportGroup::Temperatures
            }),
            ..
        }
    ));
}

struct Reject;

impl ReportHandler for Reject {
    fn handle(&mut self, _report: &Report) -> Result<(), DecodeError> {
        Err(DecodeError::PackFrameTooShort(0))
    }
}

#[tokio::test(start_paused = true)]
async fn test_decode_failure_restarts_cycle() {
    let mut h = harness();
    queue(&h, &reply_frames(ReportGroup::General)).await;
    let outcome = h.session.cycle(&mut Reject).await;
    assert!(matches!(
        outcome,
        CycleOutcome::Restarted {
            error: SessionError::Protocol(ProtocolError::Decode(_)),
            ..
        }
    ));
    assert_eq!(h.session.stats().completed(ReportGroup::General), 0);
}

#[tokio::test(start_paused = true)]
async fn test_closed_queue_stops_session() {
    let h = harness();
    let Harness { mut session, replies, .. } = h;
    drop(replies);
    let outcome = session.cycle(&mut Collect::default()).await;
    assert_eq!(outcome, CycleOutcome::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown() {
    let Harness { session, device: _device, replies } = harness();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(session.run(Collect::default(), shutdown_rx));
    tokio::time::sleep(Duration::from_secs(3)).await;
    shutdown_tx.send_replace(true);
    let stats = task.await.unwrap();
    assert!(stats.timeouts >= 1);
    assert_eq!(stats.restarts, stats.timeouts);
    drop(replies);
}
