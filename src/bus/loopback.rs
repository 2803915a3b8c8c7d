// In-process bus plus a simulated set of motor nodes
//
// The loopback pair hands every written frame to a peer and lets the peer
// inject frames for the reader. `SimulatedNodes` sits on the peer side and
// behaves like the firmware: it acknowledges requests, stores move steps and
// reports completions once the commanded duration has elapsed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use super::arbitration::{ArbitrationId, FunctionCode, NodeId};
use super::driver::{BusError, BusFrame, FrameReader, FrameWriter};
use super::messages::{
    ErrorCode, ErrorMessage, ErrorSeverity, Message, MessageBody, MessageId, MoveAckId,
    MoveCompleted, PositionFlags, TipActionResponse,
};
use crate::motion::steps::MoveStopCondition;
use crate::motion::units::{duration_from_wire, um_to_mm, wire_distance, MotorClock};

/// Create a connected writer/reader pair and the peer on the far side
pub fn loopback() -> (LoopbackWriter, LoopbackReader, LoopbackPeer) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    (
        LoopbackWriter {
            sent: sent_tx,
            fail_next: AtomicU32::new(0),
        },
        LoopbackReader {
            inbound: inbound_rx,
        },
        LoopbackPeer {
            sent: sent_rx,
            inbound: inbound_tx,
        },
    )
}

pub struct LoopbackWriter {
    sent: mpsc::UnboundedSender<BusFrame>,
    fail_next: AtomicU32,
}

impl LoopbackWriter {
    /// Make the next `count` writes fail with a transient error
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl FrameWriter for LoopbackWriter {
    async fn write(&self, frame: &BusFrame) -> Result<(), BusError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BusError::Transport("injected write failure".to_string()));
        }
        self.sent.send(frame.clone()).map_err(|_| BusError::Closed)
    }
}

pub struct LoopbackReader {
    inbound: mpsc::UnboundedReceiver<BusFrame>,
}

#[async_trait]
impl FrameReader for LoopbackReader {
    async fn read(&mut self) -> Result<Option<BusFrame>, BusError> {
        Ok(self.inbound.recv().await)
    }
}

/// Far end of the loopback: sees what the host wrote, injects what nodes say
pub struct LoopbackPeer {
    sent: mpsc::UnboundedReceiver<BusFrame>,
    inbound: mpsc::UnboundedSender<BusFrame>,
}

impl LoopbackPeer {
    pub async fn next_sent(&mut self) -> Option<BusFrame> {
        self.sent.recv().await
    }

    pub fn inject(&self, frame: BusFrame) -> Result<(), BusError> {
        self.inbound.send(frame).map_err(|_| BusError::Closed)
    }
}

/// How the simulated nodes behave
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Physical nodes on the bus
    pub nodes: BTreeSet<NodeId>,
    /// Nodes that never answer anything
    pub unresponsive: BTreeSet<NodeId>,
    /// Nodes that report this error as soon as a group starts executing
    pub faults: BTreeMap<NodeId, (ErrorCode, ErrorSeverity)>,
    /// Nodes that answer every move step request with this error
    pub rejected_steps: BTreeMap<NodeId, (ErrorCode, ErrorSeverity)>,
    /// Nodes whose limit switches never trigger
    pub unmet_conditions: BTreeSet<NodeId>,
    /// Tip sensors per node: (sensor id, tip present)
    pub tips: BTreeMap<NodeId, Vec<(u8, bool)>>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            nodes: NodeId::ALL
                .into_iter()
                .filter(|n| !n.is_virtual() && *n != NodeId::Broadcast && *n != NodeId::Host)
                .collect(),
            unresponsive: BTreeSet::new(),
            faults: BTreeMap::new(),
            rejected_steps: BTreeMap::new(),
            unmet_conditions: BTreeSet::new(),
            tips: BTreeMap::new(),
        }
    }
}

/// A frame the simulated nodes received from the host
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Received {
    pub destination: u8,
    pub message: Message,
}

#[derive(Debug, Clone, Copy)]
struct SimStep {
    seq_id: u8,
    duration: Duration,
    /// mm travelled; `None` for steps that end at a known position
    distance: Option<f64>,
    /// Position reached regardless of start (homing, jaw targets)
    end_position: Option<f64>,
    stop_condition: MoveStopCondition,
    tip_action: Option<u8>,
}

#[derive(Default)]
struct SimState {
    received: Vec<Received>,
    enabled: BTreeSet<NodeId>,
    positions: BTreeMap<NodeId, f64>,
    groups: BTreeMap<(NodeId, u8), Vec<SimStep>>,
    running: Vec<JoinHandle<()>>,
}

type Shared = Arc<Mutex<SimState>>;

fn lock(state: &Shared) -> MutexGuard<'_, SimState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn reply(inbound: &mpsc::UnboundedSender<BusFrame>, from: NodeId, message: Message) {
    let function = if message.message_id() == MessageId::Error {
        FunctionCode::Error
    } else {
        FunctionCode::NetworkManagement
    };
    let id = ArbitrationId {
        function_code: function as u8,
        node_id: NodeId::Host as u8,
        originating_node_id: from as u8,
        message_id: message.message_id() as u16,
    };
    if let Ok(data) = message.encode() {
        // The host side may already be gone at shutdown
        let _ = inbound.send(BusFrame::new(id.pack(), data));
    }
}

fn error_reply(index: u32, (code, severity): (ErrorCode, ErrorSeverity)) -> Message {
    Message::new(
        index,
        MessageBody::Error(ErrorMessage {
            severity: severity as u16,
            error_code: code as u16,
        }),
    )
}

/// Firmware stand-in driving the far side of a loopback bus
pub struct SimulatedNodes {
    state: Shared,
    task: JoinHandle<()>,
}

impl SimulatedNodes {
    pub fn spawn(peer: LoopbackPeer, config: SimConfig) -> Self {
        let state: Shared = Arc::new(Mutex::new(SimState::default()));
        let task = tokio::spawn(simulate(peer, config, state.clone()));
        info!("Simulated nodes running");
        Self { state, task }
    }

    /// Everything the host sent so far, in order
    pub fn received(&self) -> Vec<Received> {
        lock(&self.state).received.clone()
    }

    /// Current motor position in mm
    pub fn position(&self, node: NodeId) -> f64 {
        lock(&self.state).positions.get(&node).copied().unwrap_or(0.0)
    }

    pub fn set_position(&self, node: NodeId, mm: f64) {
        lock(&self.state).positions.insert(node, mm);
    }

    pub fn enabled(&self) -> BTreeSet<NodeId> {
        lock(&self.state).enabled.clone()
    }
}

impl Drop for SimulatedNodes {
    fn drop(&mut self) {
        self.task.abort();
        for handle in lock(&self.state).running.drain(..) {
            handle.abort();
        }
    }
}

fn sim_step(body: &MessageBody) -> Option<(u8, SimStep)> {
    let step = match body {
        MessageBody::AddLinearMove(m) => (
            m.group_id,
            SimStep {
                seq_id: m.seq_id,
                duration: Duration::from_secs_f64(duration_from_wire(m.duration, MotorClock::Stepper)),
                distance: Some(wire_distance(m.velocity, m.acceleration, m.duration, MotorClock::Stepper)),
                end_position: None,
                stop_condition: MoveStopCondition::from_bits_truncate(m.request_stop_condition),
                tip_action: None,
            },
        ),
        MessageBody::HomeRequest(m) => (
            m.group_id,
            SimStep {
                seq_id: m.seq_id,
                duration: Duration::from_secs_f64(duration_from_wire(m.duration, MotorClock::Stepper)),
                distance: None,
                end_position: Some(0.0),
                stop_condition: MoveStopCondition::from_bits_truncate(m.request_stop_condition),
                tip_action: None,
            },
        ),
        MessageBody::GripperGrip(m) | MessageBody::GripperHome(m) => (
            m.group_id,
            SimStep {
                seq_id: m.seq_id,
                duration: Duration::from_secs_f64(duration_from_wire(m.duration, MotorClock::Brushed)),
                distance: None,
                end_position: Some(0.0),
                stop_condition: MoveStopCondition::from_bits_truncate(m.request_stop_condition),
                tip_action: None,
            },
        ),
        MessageBody::AddBrushedLinearMove(m) => (
            m.group_id,
            SimStep {
                seq_id: m.seq_id,
                duration: Duration::from_secs_f64(duration_from_wire(m.duration, MotorClock::Brushed)),
                distance: None,
                end_position: Some(um_to_mm(i64::from(m.encoder_position_um))),
                stop_condition: MoveStopCondition::from_bits_truncate(m.request_stop_condition),
                tip_action: None,
            },
        ),
        MessageBody::TipActionRequest(m) => (
            m.group_id,
            SimStep {
                seq_id: m.seq_id,
                duration: Duration::from_secs_f64(duration_from_wire(m.duration, MotorClock::Tip)),
                distance: Some(wire_distance(m.velocity, m.acceleration, m.duration, MotorClock::Tip)),
                end_position: None,
                stop_condition: MoveStopCondition::from_bits_truncate(m.request_stop_condition),
                tip_action: Some(m.action),
            },
        ),
        _ => return None,
    };
    Some(step)
}

async fn simulate(mut peer: LoopbackPeer, config: SimConfig, state: Shared) {
    let inbound = peer.inbound.clone();

    while let Some(frame) = peer.next_sent().await {
        let id = ArbitrationId::unpack(frame.arbitration_id);
        let Ok(message) = Message::decode(id.message_id, &frame.data) else {
            debug!("Simulator ignoring undecodable frame");
            continue;
        };
        lock(&state).received.push(Received {
            destination: id.node_id,
            message,
        });

        let targets: Vec<NodeId> = match id.node() {
            Some(NodeId::Broadcast) => config.nodes.iter().copied().collect(),
            Some(node) => node
                .expand()
                .iter()
                .copied()
                .filter(|n| config.nodes.contains(n))
                .collect(),
            None => Vec::new(),
        };
        let targets: Vec<NodeId> = targets
            .into_iter()
            .filter(|n| !config.unresponsive.contains(n))
            .collect();
        let ack = |node: NodeId| reply(&inbound, node, Message::new(message.index, MessageBody::Acknowledgement));

        match message.body {
            MessageBody::Stop => {
                let mut s = lock(&state);
                for handle in s.running.drain(..) {
                    handle.abort();
                }
                drop(s);
                for node in targets {
                    ack(node);
                }
            }
            MessageBody::EnableMotor | MessageBody::DisableMotor => {
                let enable = message.body == MessageBody::EnableMotor;
                for node in targets {
                    {
                        let mut s = lock(&state);
                        if enable {
                            s.enabled.insert(node);
                        } else {
                            s.enabled.remove(&node);
                        }
                    }
                    ack(node);
                }
            }
            MessageBody::GetMotorEnabledRequest => {
                for node in targets {
                    let enabled = lock(&state).enabled.contains(&node);
                    reply(
                        &inbound,
                        node,
                        Message::new(message.index, MessageBody::GetMotorEnabledResponse { enabled }),
                    );
                }
            }
            MessageBody::GetStatusRequest => {
                for node in targets {
                    let enabled = lock(&state).enabled.contains(&node);
                    reply(
                        &inbound,
                        node,
                        Message::new(
                            message.index,
                            MessageBody::GetStatusResponse {
                                status: u8::from(enabled),
                                data: 0,
                            },
                        ),
                    );
                }
            }
            MessageBody::ClearAllMoveGroups => {
                lock(&state)
                    .groups
                    .retain(|(node, _), _| !targets.contains(node));
                for node in targets {
                    ack(node);
                }
            }
            MessageBody::ExecuteMoveGroup(execute) => {
                for node in targets {
                    let steps = lock(&state).groups.remove(&(node, execute.group_id));
                    let fault = config.faults.get(&node).copied();
                    if steps.is_none() && fault.is_none() {
                        continue;
                    }
                    let handle = tokio::spawn(run_node(
                        node,
                        execute.group_id,
                        steps.unwrap_or_default(),
                        fault,
                        config.unmet_conditions.contains(&node),
                        inbound.clone(),
                        state.clone(),
                    ));
                    lock(&state).running.push(handle);
                }
            }
            MessageBody::TipStatusQuery => {
                for node in targets {
                    for &(sensor, present) in config.tips.get(&node).into_iter().flatten() {
                        reply(
                            &inbound,
                            node,
                            Message::new(0, MessageBody::TipPresenceNotification { present, sensor }),
                        );
                    }
                }
            }
            ref body => {
                if let Some((group_id, step)) = sim_step(body) {
                    for node in targets {
                        if let Some(&error) = config.rejected_steps.get(&node) {
                            reply(&inbound, node, error_reply(message.index, error));
                            continue;
                        }
                        lock(&state)
                            .groups
                            .entry((node, group_id))
                            .or_default()
                            .push(step);
                        ack(node);
                    }
                }
            }
        }
    }
}

async fn run_node(
    node: NodeId,
    group_id: u8,
    mut steps: Vec<SimStep>,
    fault: Option<(ErrorCode, ErrorSeverity)>,
    unmet_condition: bool,
    inbound: mpsc::UnboundedSender<BusFrame>,
    state: Shared,
) {
    if let Some(error) = fault {
        reply(&inbound, node, error_reply(0, error));
        return;
    }

    steps.sort_by_key(|s| s.seq_id);
    for step in steps {
        sleep(step.duration).await;

        let position = {
            let mut s = lock(&state);
            let current = s.positions.get(&node).copied().unwrap_or(0.0);
            let next = match (step.end_position, step.distance) {
                (Some(end), _) => end,
                (None, Some(distance)) => current + distance,
                (None, None) => current,
            };
            s.positions.insert(node, next);
            next
        };

        let conditional = step
            .stop_condition
            .intersects(MoveStopCondition::LIMIT_SWITCH | MoveStopCondition::GRIPPER_FORCE);
        let ack_id = if conditional && !unmet_condition {
            MoveAckId::StoppedByCondition
        } else {
            MoveAckId::CompleteWithoutCondition
        };
        let position_um = (position * 1000.0).round();
        let completed = MoveCompleted {
            group_id,
            seq_id: step.seq_id,
            current_position_um: position_um.max(0.0) as u32,
            encoder_position_um: position_um as i32,
            position_flags: (PositionFlags::STEPPER_POSITION_OK | PositionFlags::ENCODER_POSITION_OK)
                .bits(),
            ack_id: ack_id as u8,
        };
        let body = match step.tip_action {
            Some(action) => MessageBody::TipActionResponse(TipActionResponse {
                completed,
                action,
                success: 1,
                gear_motor_id: 0,
            }),
            None => MessageBody::MoveCompleted(completed),
        };
        reply(&inbound, node, Message::new(0, body));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peer_sees_written_frames() {
        let (writer, mut reader, mut peer) = loopback();
        writer.write(&BusFrame::new(1, vec![2])).await.unwrap();
        assert_eq!(peer.next_sent().await, Some(BusFrame::new(1, vec![2])));

        peer.inject(BusFrame::new(3, vec![4])).unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(BusFrame::new(3, vec![4])));
    }

    #[tokio::test]
    async fn test_reader_ends_when_peer_drops() {
        let (_writer, mut reader, peer) = loopback();
        drop(peer);
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let (writer, _reader, _peer) = loopback();
        writer.fail_next(1);
        let err = writer.write(&BusFrame::new(0, vec![])).await.unwrap_err();
        assert!(err.is_transient());
        assert!(writer.write(&BusFrame::new(0, vec![])).await.is_ok());
    }
}
