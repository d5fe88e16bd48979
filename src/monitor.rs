//! Wiring of the bus, transport session, decoder, evaluator and contactor
//! controller into one running monitor.

use crate::bus::{BusError, BusPort, BusReceiver, Frame, PACK_TELEMETRY_ID, REPLY_ID, REQUEST_ID};
use crate::config::{BmuConfig, ConfigError};
use crate::contactor::{ActuatorCommand, ActuatorSink, ContactorController, ControllerExit, Indicator};
use crate::protocol::{Report, ReportGroup, ReportHandler, SessionStats, TransportSession, FLOW_CONTROL};
use crate::safety::SafetyEvaluator;
use crate::status::{Metric, StatusRegistry};
use crate::telemetry::{
    decode, decode_pack_telemetry, DecodeError, Quantity, TelemetryCollector, TelemetrySink,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Every Nth pack telemetry broadcast is logged.
const PACK_LOG_EVERY: u64 = 30;
const POWER_ON_VOLTS: f64 = 12.0;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("monitor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Power indicator pattern for an accessory (12 V) supply reading.
pub fn power_indicator(accessory_volts: f64) -> Indicator {
    if accessory_volts >= POWER_ON_VOLTS {
        Indicator::On
    } else if accessory_volts == 0.0 {
        Indicator::Off
    } else {
        Indicator::Blink
    }
}

/// Report consumer: decode, evaluate, then record.
pub struct Pipeline<S: TelemetrySink, A: ActuatorSink> {
    evaluator: SafetyEvaluator,
    collector: TelemetryCollector<S>,
    actuator: Arc<A>,
    power: Option<Indicator>,
}

impl<S: TelemetrySink, A: ActuatorSink> Pipeline<S, A> {
    pub fn new(evaluator: SafetyEvaluator, collector: TelemetryCollector<S>, actuator: Arc<A>) -> Self {
        Self {
            evaluator,
            collector,
            actuator,
            power: None,
        }
    }

    pub fn evaluator(&self) -> &SafetyEvaluator {
        &self.evaluator
    }

    pub fn collector(&self) -> &TelemetryCollector<S> {
        &self.collector
    }

    fn update_power_indicator(&mut self, accessory_volts: f64) {
        let indicator = power_indicator(accessory_volts);
        if self.power == Some(indicator) {
            return;
        }
        match self.actuator.apply(ActuatorCommand::PowerIndicator(indicator)) {
            Ok(()) => self.power = Some(indicator),
            Err(e) => warn!(error = %e, "Power indicator update failed"),
        }
    }
}

impl<S: TelemetrySink, A: ActuatorSink> ReportHandler for Pipeline<S, A> {
    fn handle(&mut self, report: &Report) -> Result<(), DecodeError> {
        let measurements = decode(report.group, &report.payload)?;
        debug!(group = %report.group, count = measurements.len(), "Report decoded");

        if report.group == ReportGroup::General {
            if let Some(m) = measurements.iter().find(|m| m.quantity == Quantity::AccessoryVoltage) {
                self.update_power_indicator(m.value);
            }
        }

        self.evaluator.evaluate_measurements(&measurements);

        if report.group == ReportGroup::Temperatures
            && !measurements.iter().any(|m| m.quantity == Quantity::TemperatureMax)
        {
            self.evaluator.invalidate(Metric::TMax, "no temperature sensor present");
            self.evaluator.invalidate(Metric::TMin, "no temperature sensor present");
        }

        self.collector.collect(report.group, measurements);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiveStats {
    pub frames: u64,
    pub replies_dropped: u64,
    pub pack_frames: u64,
    pub bus_errors: u64,
}

/// Route inbound frames: replies to the session queue, pack broadcasts to
/// the log, everything else to debug.
pub async fn receive_loop<R: BusReceiver>(
    mut bus: R,
    replies: mpsc::Sender<Frame>,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> ReceiveStats {
    let mut stats = ReceiveStats::default();
    info!("Receive task started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let received = tokio::select! {
            received = bus.receive(poll) => received,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(BusError::Closed) => {
                error!("Bus closed, receive task stopping");
                break;
            }
            Err(e) => {
                stats.bus_errors += 1;
                warn!(error = %e, "Bus receive error");
                tokio::time::sleep(poll).await;
                continue;
            }
        };
        stats.frames += 1;

        match frame.id {
            REPLY_ID => match replies.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    stats.replies_dropped += 1;
                    warn!(frame = %frame, "Reply queue full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    info!("Reply queue closed, receive task stopping");
                    break;
                }
            },
            PACK_TELEMETRY_ID => {
                stats.pack_frames += 1;
                if stats.pack_frames % PACK_LOG_EVERY == 0 {
                    match decode_pack_telemetry(&frame.data) {
                        Ok(pack) => debug!(current_a = pack.current_a, voltage_v = pack.voltage_v, "Pack telemetry"),
                        Err(e) => warn!(error = %e, "Pack telemetry frame malformed"),
                    }
                }
            }
            REQUEST_ID if frame.byte(0) != FLOW_CONTROL => {
                info!(frame = %frame, "Request observed from another node");
            }
            _ => debug!(frame = %frame, "Unhandled frame"),
        }
    }
    info!(?stats, "Receive task stopped");
    stats
}

/// Final counters from a stopped monitor.
#[derive(Debug, Clone)]
pub struct MonitorSummary {
    pub session: SessionStats,
    pub receive: ReceiveStats,
    pub controller: ControllerExit,
}

pub struct Monitor<T: BusPort, R: BusReceiver, A: ActuatorSink, S: TelemetrySink> {
    config: BmuConfig,
    transmit: T,
    receive: R,
    actuator: Arc<A>,
    sink: S,
    registry: Arc<StatusRegistry>,
}

impl<T: BusPort, R: BusReceiver, A: ActuatorSink, S: TelemetrySink + 'static> Monitor<T, R, A, S> {
    /// `transmit` carries requests and flow control; `receive` is moved into
    /// the receive task. Fails when `config` does not validate.
    pub fn new(config: BmuConfig, transmit: T, receive: R, actuator: Arc<A>, sink: S) -> Result<Self, MonitorError> {
        config.validate()?;
        Ok(Self {
            config,
            transmit,
            receive,
            actuator,
            sink,
            registry: Arc::new(StatusRegistry::new()),
        })
    }

    pub fn registry(&self) -> Arc<StatusRegistry> {
        Arc::clone(&self.registry)
    }

    /// Spawn the receive task, transport session and contactor controller.
    /// Must be called inside a tokio runtime.
    pub fn start(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (reply_tx, reply_rx) = mpsc::channel(self.config.session.reply_queue_capacity);

        let receiver = tokio::spawn(receive_loop(
            self.receive,
            reply_tx,
            self.config.session.bus_poll(),
            shutdown_rx.clone(),
        ));

        let pipeline = Pipeline::new(
            SafetyEvaluator::new(Arc::clone(&self.registry), self.config.thresholds.clone()),
            TelemetryCollector::new(self.sink),
            Arc::clone(&self.actuator),
        );
        let session = TransportSession::new(self.transmit, reply_rx, self.config.session.clone());
        let session = tokio::spawn(session.run(pipeline, shutdown_rx.clone()));

        let controller = ContactorController::new(
            self.config.contactor.clone(),
            Arc::clone(&self.registry),
            self.actuator,
        )
        .spawn(shutdown_rx);

        info!("Battery monitor started");
        MonitorHandle {
            registry: self.registry,
            shutdown: shutdown_tx,
            receiver,
            session,
            controller,
        }
    }
}

pub struct MonitorHandle {
    registry: Arc<StatusRegistry>,
    shutdown: watch::Sender<bool>,
    receiver: JoinHandle<ReceiveStats>,
    session: JoinHandle<SessionStats>,
    controller: JoinHandle<ControllerExit>,
}

impl MonitorHandle {
    pub fn registry(&self) -> Arc<StatusRegistry> {
        Arc::clone(&self.registry)
    }

    /// Withdraw enable, stop every task and wait for the contactors to be
    /// forced open.
    pub async fn shutdown(self) -> Result<MonitorSummary, MonitorError> {
        info!("Battery monitor shutting down");
        self.registry.set_enable(false);
        self.shutdown.send_replace(true);
        let controller = self.controller.await?;
        let session = self.session.await?;
        let receive = self.receiver.await?;
        Ok(MonitorSummary {
            session,
            receive,
            controller,
        })
    }
}
