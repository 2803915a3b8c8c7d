// Move group execution: clear, load, trigger, await completions
//
// Groups run strictly one after another. Every group gets its own deadline
// and its own subscription; the selection loop watches the stop signal, the
// deadline and incoming messages.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::bus::arbitration::NodeId;
use crate::bus::driver::BusError;
use crate::bus::messages::{
    ErrorCode, ExecuteMoveGroup, MessageBody, MessageId, MoveAckId, MoveCompleted, TipActionResponse,
};
use crate::bus::messenger::{filter_ids, BusMessenger, Incoming};
use crate::config::{EXPECTED_TIME_FACTOR, GROUP_TIMEOUT_FACTOR, MIN_GROUP_TIMEOUT};
use crate::error::{translate, FaultDetail, MotionError};
use crate::motion::encoder::step_message;
use crate::motion::steps::{MoveGroup, MoveGroups, MoveStep, MoveStopCondition, TipActionType};
use crate::motion::units::um_to_mm;

/// Cancellation handle shared between a caller and running moves
///
/// Each `stop` bumps a generation counter; listeners created before the bump
/// observe it, listeners created after do not.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn listen(&self) -> StopListener {
        let rx = self.tx.subscribe();
        let since = *rx.borrow();
        StopListener { rx, since }
    }
}

pub struct StopListener {
    rx: watch::Receiver<u64>,
    since: u64,
}

impl StopListener {
    /// Whether `stop` was called since this listener was created
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() != self.since
    }

    /// Resolves once `stop` has been called, immediately if it already was
    pub async fn stopped(&mut self) {
        let since = self.since;
        if self.rx.wait_for(|generation| *generation != since).await.is_err() {
            // Sender gone: nobody can stop us any more
            std::future::pending::<()>().await;
        }
    }
}

/// Last reported position of one motor, in mm
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotorPosition {
    pub motor_mm: f64,
    pub encoder_mm: f64,
}

pub type NodePositions = BTreeMap<NodeId, MotorPosition>;

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(NodePositions),
    Cancelled(NodePositions),
}

impl RunOutcome {
    pub fn positions(&self) -> &NodePositions {
        match self {
            RunOutcome::Completed(p) | RunOutcome::Cancelled(p) => p,
        }
    }
}

/// A fault that ended execution, with whatever positions arrived before it
#[derive(Debug, thiserror::Error)]
#[error("{fault}")]
pub struct MoveFailure {
    pub fault: MotionError,
    pub positions: NodePositions,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunnerConfig {
    pub min_group_timeout: Duration,
    pub timeout_factor: f64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            min_group_timeout: MIN_GROUP_TIMEOUT,
            timeout_factor: GROUP_TIMEOUT_FACTOR,
        }
    }
}

impl RunnerConfig {
    pub fn group_timeout(&self, group_duration: f64) -> Duration {
        let scaled = Duration::try_from_secs_f64(group_duration * self.timeout_factor).unwrap_or(Duration::MAX);
        scaled.max(self.min_group_timeout)
    }
}

/// Positions keyed by the `(group, seq)` they were reported for; later steps win
#[derive(Default)]
struct PositionLedger {
    latest: BTreeMap<NodeId, ((usize, u8), MotorPosition)>,
}

impl PositionLedger {
    fn record(&mut self, node: NodeId, group: usize, completed: &MoveCompleted) {
        let key = (group, completed.seq_id);
        let position = MotorPosition {
            motor_mm: um_to_mm(i64::from(completed.current_position_um)),
            encoder_mm: um_to_mm(i64::from(completed.encoder_position_um)),
        };
        match self.latest.get(&node) {
            Some((existing, _)) if *existing > key => {}
            _ => {
                self.latest.insert(node, (key, position));
            }
        }
    }

    fn positions(&self) -> NodePositions {
        self.latest
            .iter()
            .map(|(node, (_, position))| (*node, *position))
            .collect()
    }
}

enum GroupResult {
    Done,
    Cancelled,
}

pub struct MoveGroupRunner {
    groups: MoveGroups,
    config: RunnerConfig,
}

impl MoveGroupRunner {
    pub fn new(groups: MoveGroups, config: RunnerConfig) -> Self {
        Self { groups, config }
    }

    pub fn groups(&self) -> &MoveGroups {
        &self.groups
    }

    /// Total wall-clock time of every group, in seconds
    pub fn duration(&self) -> f64 {
        self.groups.iter().map(MoveGroup::duration).sum()
    }

    /// Execute every group in order
    pub async fn run(&self, messenger: &BusMessenger, stop: &StopSignal) -> Result<RunOutcome, MoveFailure> {
        let mut listener = stop.listen();
        let mut ledger = PositionLedger::default();

        for (index, group) in self.groups.iter().enumerate() {
            if listener.is_stopped() {
                info!("Move cancelled before group {}", index);
                broadcast_stop(messenger).await;
                return Ok(RunOutcome::Cancelled(ledger.positions()));
            }
            if group.is_empty() {
                debug!("Skipping empty move group {}", index);
                continue;
            }
            let outcome = self
                .run_group(messenger, &mut listener, index, group, &mut ledger)
                .await;
            match outcome {
                Ok(GroupResult::Done) => {}
                Ok(GroupResult::Cancelled) => {
                    info!("Move cancelled during group {}", index);
                    return Ok(RunOutcome::Cancelled(ledger.positions()));
                }
                Err(fault) => {
                    return Err(MoveFailure {
                        fault,
                        positions: ledger.positions(),
                    });
                }
            }
        }
        Ok(RunOutcome::Completed(ledger.positions()))
    }

    async fn run_group(
        &self,
        messenger: &BusMessenger,
        listener: &mut StopListener,
        index: usize,
        group: &MoveGroup,
        ledger: &mut PositionLedger,
    ) -> Result<GroupResult, MotionError> {
        // Every group clears the node-side tables first, so wire ids can wrap
        let group_id = (index % 256) as u8;
        let duration = group.duration();

        // Subscribed before loading so errors answering a step request are seen
        let mut incoming = messenger.subscribe(filter_ids(&[
            MessageId::MoveCompleted,
            MessageId::TipActionResponse,
            MessageId::Error,
        ]));

        messenger.send(NodeId::Broadcast, MessageBody::ClearAllMoveGroups).await?;

        let mut pending: BTreeSet<(NodeId, u8)> = BTreeSet::new();
        let mut steps: BTreeMap<(NodeId, u8), MoveStep> = BTreeMap::new();
        for (seq, step) in group.steps.iter().enumerate() {
            let seq_id = (seq % 256) as u8;
            for (node, move_step) in step {
                messenger
                    .send(*node, step_message(move_step, group_id, seq_id))
                    .await?;
                for physical in node.expand() {
                    pending.insert((*physical, seq_id));
                    steps.insert((*physical, seq_id), *move_step);
                }
            }
        }

        while let Some(message) = incoming.try_recv() {
            if let Err(fault) = handle_message(&message, index, group_id, &mut pending, &steps, ledger) {
                broadcast_stop(messenger).await;
                return Err(fault);
            }
        }
        if listener.is_stopped() {
            info!("Stop requested while loading move group {}, not starting it", index);
            broadcast_stop(messenger).await;
            return Ok(GroupResult::Cancelled);
        }

        let started = Instant::now();
        let deadline = started + self.config.group_timeout(duration);
        info!(
            "Executing move group {} ({} steps, {:.3}s)",
            index,
            group.steps.len(),
            duration
        );
        messenger
            .send_once(
                NodeId::Broadcast,
                MessageBody::ExecuteMoveGroup(ExecuteMoveGroup {
                    group_id,
                    start_trigger: 0,
                    cancel_trigger: 0,
                }),
            )
            .await?;

        while !pending.is_empty() {
            let message = tokio::select! {
                biased;
                _ = listener.stopped() => {
                    broadcast_stop(messenger).await;
                    return Ok(GroupResult::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    let missing: BTreeSet<NodeId> = pending.iter().map(|(node, _)| *node).collect();
                    error!("Move group {} timed out waiting for {:?}", index, missing);
                    broadcast_stop(messenger).await;
                    let names: Vec<String> = missing.iter().map(NodeId::to_string).collect();
                    return Err(MotionError::CommandTimedOut(
                        FaultDetail::new(None)
                            .with("group", index.to_string())
                            .with("missing_nodes", names.join(",")),
                    ));
                }
                message = incoming.recv() => match message {
                    Some(message) => message,
                    None => return Err(MotionError::Bus(BusError::Closed)),
                },
            };

            if let Err(fault) = handle_message(&message, index, group_id, &mut pending, &steps, ledger) {
                broadcast_stop(messenger).await;
                return Err(fault);
            }
        }

        let elapsed = started.elapsed();
        if elapsed.as_secs_f64() > duration * EXPECTED_TIME_FACTOR && duration > 0.0 {
            warn!(
                "Move group {} took {:.3}s, expected {:.3}s",
                index,
                elapsed.as_secs_f64(),
                duration
            );
        }
        info!("Move group {} has completed", index);
        Ok(GroupResult::Done)
    }
}

async fn broadcast_stop(messenger: &BusMessenger) {
    if let Err(e) = messenger.send(NodeId::Broadcast, MessageBody::Stop).await {
        error!("Failed to broadcast stop: {}", e);
    }
}

/// Apply one incoming message to the group's pending set
fn handle_message(
    message: &Incoming,
    index: usize,
    group_id: u8,
    pending: &mut BTreeSet<(NodeId, u8)>,
    steps: &BTreeMap<(NodeId, u8), MoveStep>,
    ledger: &mut PositionLedger,
) -> Result<(), MotionError> {
    let origin = message.origin();
    let (completed, tip) = match message.message.body {
        MessageBody::Error(report) => {
            let context = BTreeMap::from([("group".to_string(), index.to_string())]);
            return match translate(origin, report.error_code, report.severity, context) {
                Some(fault) => {
                    error!("Move group {} failed: {}", index, fault);
                    Err(fault)
                }
                None => {
                    let code = ErrorCode::from_u16(report.error_code).map_or("unknown", ErrorCode::name);
                    warn!("Warning from {:?} during move group {}: {}", origin, index, code);
                    Ok(())
                }
            };
        }
        MessageBody::MoveCompleted(completed) => (completed, None),
        MessageBody::TipActionResponse(response) => (response.completed, Some(response)),
        _ => return Ok(()),
    };

    let Some(node) = origin else {
        warn!("Completion from unknown node 0x{:02X}", message.arbitration_id.originating_node_id);
        return Ok(());
    };
    if completed.group_id != group_id {
        debug!("Ignoring completion for group {} from {}", completed.group_id, node);
        return Ok(());
    }
    let key = (node, completed.seq_id);
    if !pending.remove(&key) {
        warn!(
            "Got a move ack for ({}, {}) which is not pending; may have leaked from an earlier group",
            node, completed.seq_id
        );
        return Ok(());
    }
    debug!("Received completion for {} group {} seq {}", node, index, completed.seq_id);
    ledger.record(node, index, &completed);

    let ack = completed.ack();
    let condition = steps
        .get(&key)
        .map(MoveStep::stop_condition)
        .unwrap_or_default();
    let detail = || {
        FaultDetail::new(Some(node))
            .with("group", index.to_string())
            .with("seq", completed.seq_id.to_string())
    };

    match tip {
        Some(response) => check_tip_action(&response, ack, condition, detail)?,
        None => {
            if condition.contains(MoveStopCondition::LIMIT_SWITCH) && ack != Some(MoveAckId::StoppedByCondition) {
                warn!("Homing failed on {}: limit switch not reached", node);
                return Err(MotionError::MoveConditionNotMet(detail().with("condition", "limit switch")));
            }
        }
    }

    match ack {
        Some(MoveAckId::StoppedByCondition) => {
            // The node stopped early; it will not run the rest of its steps
            let before = pending.len();
            pending.retain(|(n, _)| *n != node);
            if pending.len() != before {
                debug!("{} stopped by condition, dropping {} remaining steps", node, before - pending.len());
            }
        }
        Some(MoveAckId::Timeout) | Some(MoveAckId::PositionError) => {
            warn!("{} finished seq {} with {:?}", node, completed.seq_id, ack);
        }
        _ => {}
    }
    Ok(())
}

fn check_tip_action(
    response: &TipActionResponse,
    ack: Option<MoveAckId>,
    condition: MoveStopCondition,
    detail: impl Fn() -> FaultDetail,
) -> Result<(), MotionError> {
    if response.success != 0 {
        return Ok(());
    }
    let drop = response.action == TipActionType::Drop as u8 || condition.contains(MoveStopCondition::LIMIT_SWITCH);
    if drop {
        if ack != Some(MoveAckId::StoppedByCondition) {
            warn!("Drop tip failed: tip still detected");
            return Err(MotionError::MoveConditionNotMet(detail().with("condition", "tip still detected")));
        }
        Ok(())
    } else {
        warn!("Pick up tip failed: tip not detected");
        Err(MotionError::MoveConditionNotMet(detail().with("condition", "tip not detected")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::loopback::{loopback, SimConfig, SimulatedNodes};
    use crate::bus::messages::ErrorSeverity;
    use crate::bus::messenger::MessengerConfig;
    use crate::motion::encoder::{home_group, tip_action_group};

    fn linear(distance: f64, duration: f64) -> MoveStep {
        MoveStep::Linear {
            distance,
            velocity: distance / duration,
            acceleration: 0.0,
            duration,
            stop_condition: MoveStopCondition::empty(),
        }
    }

    fn setup(config: SimConfig) -> (BusMessenger, SimulatedNodes) {
        let (writer, reader, peer) = loopback();
        let messenger = BusMessenger::start(Arc::new(writer), Box::new(reader), MessengerConfig::default());
        (messenger, SimulatedNodes::spawn(peer, config))
    }

    #[test]
    fn test_group_timeout_policy() {
        let config = RunnerConfig::default();
        assert_eq!(config.group_timeout(0.1), Duration::from_secs(1));
        assert_eq!(config.group_timeout(2.0), Duration::from_secs(4));
    }

    #[test]
    fn test_ledger_keeps_latest_step() {
        let mut ledger = PositionLedger::default();
        let completed = |seq_id, um| MoveCompleted {
            group_id: 0,
            seq_id,
            current_position_um: um,
            encoder_position_um: um as i32,
            position_flags: 0,
            ack_id: 1,
        };
        ledger.record(NodeId::GantryX, 1, &completed(2, 5000));
        ledger.record(NodeId::GantryX, 1, &completed(1, 3000));
        ledger.record(NodeId::GantryX, 0, &completed(9, 1000));
        assert_eq!(ledger.positions()[&NodeId::GantryX].motor_mm, 5.0);
        ledger.record(NodeId::GantryX, 2, &completed(0, 7000));
        assert_eq!(ledger.positions()[&NodeId::GantryX].encoder_mm, 7.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_groups_in_order() {
        let (messenger, sim) = setup(SimConfig::default());
        let groups = vec![
            MoveGroup::new(vec![BTreeMap::from([(NodeId::GantryX, linear(10.0, 0.5))])]),
            MoveGroup::new(vec![
                BTreeMap::from([(NodeId::GantryX, linear(-4.0, 0.2)), (NodeId::GantryY, linear(3.0, 0.2))]),
                BTreeMap::from([(NodeId::GantryY, linear(1.0, 0.1))]),
            ]),
        ];
        let runner = MoveGroupRunner::new(groups, RunnerConfig::default());
        let outcome = runner.run(&messenger, &StopSignal::new()).await.unwrap();

        let RunOutcome::Completed(positions) = outcome else {
            panic!("expected completion");
        };
        assert!((positions[&NodeId::GantryX].motor_mm - 6.0).abs() < 0.01);
        assert!((positions[&NodeId::GantryY].motor_mm - 4.0).abs() < 0.01);

        let executes: Vec<u8> = sim
            .received()
            .iter()
            .filter_map(|r| match r.message.body {
                MessageBody::ExecuteMoveGroup(e) => Some(e.group_id),
                _ => None,
            })
            .collect();
        assert_eq!(executes, vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_homing_without_limit_switch_fails() {
        let config = SimConfig {
            unmet_conditions: BTreeSet::from([NodeId::GantryX]),
            ..SimConfig::default()
        };
        let (messenger, _sim) = setup(config);
        let group = home_group(&[NodeId::GantryX], 20.0, 10.0).unwrap();
        let runner = MoveGroupRunner::new(vec![group], RunnerConfig::default());

        let failure = runner.run(&messenger, &StopSignal::new()).await.unwrap_err();
        assert!(matches!(failure.fault, MotionError::MoveConditionNotMet(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_by_condition_clears_remaining_steps() {
        let (messenger, sim) = setup(SimConfig::default());
        sim.set_position(NodeId::GantryY, 50.0);
        let mut group = home_group(&[NodeId::GantryY], 60.0, 30.0).unwrap();
        // A second step the node will never run once its limit switch triggers
        group.steps.push(BTreeMap::from([(NodeId::GantryY, linear(5.0, 100.0))]));
        let runner = MoveGroupRunner::new(vec![group], RunnerConfig::default());

        let started = Instant::now();
        let outcome = runner.run(&messenger, &StopSignal::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.positions()[&NodeId::GantryY].motor_mm, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tip_drop_succeeds_on_limit_switch() {
        let (messenger, _sim) = setup(SimConfig::default());
        let group = tip_action_group(NodeId::PipetteLeft, TipActionType::Drop, 5.0, 5.0).unwrap();
        let runner = MoveGroupRunner::new(vec![group], RunnerConfig::default());
        assert!(runner.run(&messenger, &StopSignal::new()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_the_bus() {
        let (messenger, sim) = setup(SimConfig::default());
        let groups = vec![MoveGroup::new(vec![BTreeMap::from([(NodeId::GantryX, linear(100.0, 30.0))])])];
        let runner = MoveGroupRunner::new(groups, RunnerConfig::default());
        let stop = StopSignal::new();

        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.stop();
        });
        let outcome = runner.run(&messenger, &stop).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Cancelled(ref p) if p.is_empty()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sim.received().iter().any(|r| r.message.body == MessageBody::Stop));
        assert_eq!(stop.generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_step_raises_the_node_error() {
        let config = SimConfig {
            rejected_steps: BTreeMap::from([(NodeId::HeadL, (ErrorCode::OverPressure, ErrorSeverity::Recoverable))]),
            ..SimConfig::default()
        };
        let (messenger, _sim) = setup(config);
        let groups = vec![MoveGroup::new(vec![BTreeMap::from([
            (NodeId::GantryX, linear(10.0, 5.0)),
            (NodeId::HeadL, linear(10.0, 5.0)),
        ])])];
        let runner = MoveGroupRunner::new(groups, RunnerConfig::default());

        let started = Instant::now();
        let failure = runner.run(&messenger, &StopSignal::new()).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        let MotionError::PipetteOverpressure(detail) = &failure.fault else {
            panic!("expected overpressure, got {:?}", failure.fault);
        };
        assert_eq!(detail.node, Some(NodeId::HeadL));
    }

    #[test]
    fn test_listener_sees_earlier_stop() {
        let stop = StopSignal::new();
        stop.stop();
        let listener = stop.listen();
        assert!(!listener.is_stopped());
        stop.stop();
        assert!(listener.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_does_not_abort() {
        let config = SimConfig {
            faults: BTreeMap::from([(NodeId::GantryX, (ErrorCode::Timeout, ErrorSeverity::Warning))]),
            ..SimConfig::default()
        };
        let (messenger, _sim) = setup(config);
        let groups = vec![MoveGroup::new(vec![
            BTreeMap::from([(NodeId::GantryX, linear(1.0, 0.1)), (NodeId::GantryY, linear(1.0, 0.1))]),
        ])];
        let runner = MoveGroupRunner::new(groups, RunnerConfig::default());
        // gantry_x only warns and never completes, so the group times out
        let failure = runner.run(&messenger, &StopSignal::new()).await.unwrap_err();
        let MotionError::CommandTimedOut(detail) = failure.fault else {
            panic!("expected timeout, got {:?}", failure.fault);
        };
        assert_eq!(detail.context["missing_nodes"], "gantry_x");
        assert!(failure.positions.contains_key(&NodeId::GantryY));
    }
}
