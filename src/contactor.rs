//! Contactor interlock.
//!
//! [`ContactorLogic`] is a clock-driven state machine: every call to
//! [`ContactorLogic::step`] receives the current instant, the enable signal
//! and one safety snapshot, and returns the actuator commands to issue plus
//! when it next needs to run. Pre-charge and the shutdown grace delay are
//! explicit timed phases, so shutdown or a failure can preempt them.
//!
//! [`ContactorController`] runs that logic as a task and owns the
//! emergency-open path.

use crate::config::ContactorConfig;
use crate::status::{ContactorState, SafetySnapshot, StatusRegistry};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

const MAX_COMMANDS_PER_STEP: usize = 4;
const FORCE_OPEN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Switch {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Indicator {
    On,
    Off,
    Blink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorCommand {
    /// Negative-path relay; also feeds the pre-charge circuit.
    RelayNeg(Switch),
    /// Positive-path relay.
    RelayPos(Switch),
    HvIndicator(Indicator),
    PowerIndicator(Indicator),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("actuator rejected {command:?}: {reason}")]
pub struct ActuationError {
    pub command: ActuatorCommand,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Actuation(#[from] ActuationError),
    #[error("contactor task panicked")]
    Panicked,
    #[error("enable signal source dropped")]
    EnableClosed,
}

/// Relay and indicator driver.
pub trait ActuatorSink: Send + Sync + 'static {
    fn apply(&self, command: ActuatorCommand) -> Result<(), ActuationError>;
}

/// Logs and records every applied command. Optionally rejects one command,
/// standing in for a welded or disconnected relay driver.
#[derive(Debug, Clone, Default)]
pub struct RecordingActuator {
    log: Arc<Mutex<alloc::vec::Vec<ActuatorCommand>>>,
    reject: Option<ActuatorCommand>,
}

impl RecordingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(command: ActuatorCommand) -> Self {
        Self {
            log: Arc::default(),
            reject: Some(command),
        }
    }

    pub fn commands(&self) -> alloc::vec::Vec<ActuatorCommand> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Relay state implied by the recorded commands (negative, positive).
    pub fn relays(&self) -> (Switch, Switch) {
        let mut neg = Switch::Off;
        let mut pos = Switch::Off;
        for command in self.commands() {
            match command {
                ActuatorCommand::RelayNeg(s) => neg = s,
                ActuatorCommand::RelayPos(s) => pos = s,
                _ => {}
            }
        }
        (neg, pos)
    }
}

impl ActuatorSink for RecordingActuator {
    fn apply(&self, command: ActuatorCommand) -> Result<(), ActuationError> {
        if self.reject == Some(command) {
            return Err(ActuationError {
                command,
                reason: "simulated driver fault".into(),
            });
        }
        let mut log = self.log.lock().map_err(|_| ActuationError {
            command,
            reason: "actuator log poisoned".into(),
        })?;
        info!(?command, "Actuator");
        log.push(command);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpenReason {
    /// A safety flag went not-ok while energized.
    Fault,
    /// The enable signal was withdrawn.
    Planned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Precharging { until: Instant },
    Closed,
    RampDown { until: Instant, reason: OpenReason },
}

impl Phase {
    /// Contactor state as seen by the rest of the system: the HV rail is
    /// only live once the positive relay has closed.
    pub fn contactor_state(self) -> ContactorState {
        match self {
            Phase::Closed | Phase::RampDown { .. } => ContactorState::Closed,
            Phase::Open | Phase::Precharging { .. } => ContactorState::Open,
        }
    }
}

/// When the logic wants to run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Nothing to do until the enable signal turns on.
    Idle,
    At(Instant),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub commands: Vec<ActuatorCommand, MAX_COMMANDS_PER_STEP>,
    pub wake: Wake,
}

impl Decision {
    fn new(wake: Wake) -> Self {
        Self {
            commands: Vec::new(),
            wake,
        }
    }

    fn with(mut self, command: ActuatorCommand) -> Self {
        let _ = self.commands.push(command);
        self
    }
}

/// Why the contactors are being forced open without a grace delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceReason {
    Shutdown,
    Failure,
}

impl ForceReason {
    /// HV indicator pattern left behind: dark on shutdown, blinking after
    /// a failure so the operator sees the pack needs attention.
    pub fn indicator(self) -> Indicator {
        match self {
            ForceReason::Shutdown => Indicator::Off,
            ForceReason::Failure => Indicator::Blink,
        }
    }
}

/// Commands that de-energize everything, positive side first.
pub fn open_sequence(indicator: Indicator) -> [ActuatorCommand; 3] {
    [
        ActuatorCommand::RelayPos(Switch::Off),
        ActuatorCommand::RelayNeg(Switch::Off),
        ActuatorCommand::HvIndicator(indicator),
    ]
}

#[derive(Debug, Clone)]
pub struct ContactorLogic {
    phase: Phase,
    config: ContactorConfig,
}

impl ContactorLogic {
    pub fn new(config: ContactorConfig) -> Self {
        Self {
            phase: Phase::Open,
            config,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> ContactorState {
        self.phase.contactor_state()
    }

    fn periodic(&self, now: Instant) -> Wake {
        Wake::At(now + self.config.decision_period())
    }

    fn periodic_until(&self, now: Instant, until: Instant) -> Wake {
        Wake::At(until.min(now + self.config.decision_period()))
    }

    pub fn step(&mut self, now: Instant, enabled: bool, snapshot: SafetySnapshot) -> Decision {
        match self.phase {
            Phase::Open => {
                if !enabled {
                    return Decision::new(Wake::Idle);
                }
                if !snapshot.all_ok() {
                    debug!(failing = ?snapshot.failing().collect::<alloc::vec::Vec<_>>(), "HV requested but limits not ok");
                    return Decision::new(self.periodic(now));
                }
                info!("Contactor startup initiated");
                let until = now + self.config.precharge();
                self.phase = Phase::Precharging { until };
                Decision::new(self.periodic_until(now, until))
                    .with(ActuatorCommand::RelayNeg(Switch::On))
            }
            Phase::Precharging { until } => {
                if !enabled || !snapshot.all_ok() {
                    warn!(enabled, failing = ?snapshot.failing().collect::<alloc::vec::Vec<_>>(), "Pre-charge aborted");
                    self.phase = Phase::Open;
                    let mut decision = Decision::new(self.periodic(now));
                    for command in open_sequence(Indicator::Off) {
                        decision = decision.with(command);
                    }
                    return decision;
                }
                if now < until {
                    return Decision::new(self.periodic_until(now, until));
                }
                self.phase = Phase::Closed;
                info!("Contactor startup complete, battery is LIVE");
                Decision::new(self.periodic(now))
                    .with(ActuatorCommand::RelayPos(Switch::On))
                    .with(ActuatorCommand::HvIndicator(Indicator::On))
            }
            Phase::Closed => {
                let reason = if !enabled {
                    OpenReason::Planned
                } else if !snapshot.all_ok() {
                    OpenReason::Fault
                } else {
                    return Decision::new(self.periodic(now));
                };
                let grace = self.config.grace_delay();
                match reason {
                    OpenReason::Planned => warn!(
                        grace_ms = grace.as_millis() as u64,
                        "Shutdown instruction received from controller, HV contactors will open"
                    ),
                    OpenReason::Fault => warn!(
                        grace_ms = grace.as_millis() as u64,
                        failing = ?snapshot.failing().collect::<alloc::vec::Vec<_>>(),
                        "Cell voltage(s) and/or temperatures outside safe operating range, HV contactors will open"
                    ),
                }
                let until = now + grace;
                self.phase = Phase::RampDown { until, reason };
                Decision::new(Wake::At(until)).with(ActuatorCommand::HvIndicator(Indicator::Off))
            }
            Phase::RampDown { until, reason } => {
                if now < until {
                    return Decision::new(Wake::At(until));
                }
                self.phase = Phase::Open;
                info!(?reason, "Contactor shutdown complete");
                let mut decision = Decision::new(self.periodic(now));
                for command in open_sequence(Indicator::Off) {
                    decision = decision.with(command);
                }
                decision
            }
        }
    }

    /// Drop straight to Open with no grace delay.
    pub fn force_open(&mut self, reason: ForceReason) -> [ActuatorCommand; 3] {
        self.phase = Phase::Open;
        open_sequence(reason.indicator())
    }
}

/// Apply an open sequence, retrying each command. Returns false if any
/// command still failed.
fn apply_open_sequence<A: ActuatorSink>(actuator: &A, commands: [ActuatorCommand; 3]) -> bool {
    let mut complete = true;
    for command in commands {
        let applied = (0..FORCE_OPEN_ATTEMPTS).any(|attempt| match actuator.apply(command) {
            Ok(()) => true,
            Err(e) => {
                error!(attempt, error = %e, "Emergency open command failed");
                false
            }
        });
        complete &= applied;
    }
    complete
}

/// How the controller task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerExit {
    Shutdown,
    Failed(ControllerError),
}

pub struct ContactorController<A: ActuatorSink> {
    logic: ContactorLogic,
    registry: Arc<StatusRegistry>,
    actuator: Arc<A>,
}

impl<A: ActuatorSink> ContactorController<A> {
    pub fn new(config: ContactorConfig, registry: Arc<StatusRegistry>, actuator: Arc<A>) -> Self {
        Self {
            logic: ContactorLogic::new(config),
            registry,
            actuator,
        }
    }

    /// Spawn the control loop under a supervisor that always ends with the
    /// contactors forced open.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<ControllerExit> {
        let registry = Arc::clone(&self.registry);
        let actuator = Arc::clone(&self.actuator);
        tokio::spawn(async move {
            let inner = tokio::spawn(self.run(shutdown));
            let exit = match inner.await {
                Ok(Ok(())) => ControllerExit::Shutdown,
                Ok(Err(e)) => ControllerExit::Failed(e),
                Err(join) => {
                    error!(error = %join, "Contactor controller task panicked");
                    ControllerExit::Failed(ControllerError::Panicked)
                }
            };
            let reason = match exit {
                ControllerExit::Shutdown => ForceReason::Shutdown,
                ControllerExit::Failed(ref e) => {
                    error!(severity = "critical", error = %e, "Contactor controller failed, HV inhibited");
                    registry.inhibit();
                    ForceReason::Failure
                }
            };
            let complete = apply_open_sequence(actuator.as_ref(), open_sequence(reason.indicator()));
            registry.set_contactor_state(ContactorState::Open);
            if complete {
                info!(?reason, "Contactors emergency depowered");
            } else {
                error!(severity = "critical", ?reason, "Contactors could not be confirmed open");
            }
            exit
        })
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        let mut enable = self.registry.subscribe_enable();
        info!("Contactor controller started");
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let now = Instant::now();
            let decision = self
                .logic
                .step(now, self.registry.enable(), self.registry.snapshot());
            for command in decision.commands {
                self.actuator.apply(command)?;
            }
            self.registry.set_contactor_state(self.logic.state());

            match decision.wake {
                Wake::Idle => {
                    tokio::select! {
                        changed = enable.wait_for(|on| *on) => {
                            changed.map_err(|_| ControllerError::EnableClosed)?;
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                Wake::At(deadline) => {
                    tokio::select! {
                        () = sleep_until(deadline) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}
