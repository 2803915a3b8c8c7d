// Planned legs -> per-node move groups -> wire messages

use std::collections::BTreeMap;

use tracing::debug;

use super::steps::{
    GripperMoveKind, MoveGroup, MoveGroups, MoveStep, MoveStopCondition, TipActionType,
};
use super::units::{
    acceleration_to_wire, duration_to_wire, mm_to_um, velocity_to_wire, MotorClock,
};
use crate::bus::arbitration::{expand_nodes, NodeId};
use crate::bus::messages::{
    AddLinearMove, GripperMove, HomeRequest, MessageBody, TipActionRequest,
};
use crate::planning::types::{Axis, Move, EPSILON};

/// Default PWM duty cycle (percent) for gripper jaw moves
pub const DEFAULT_JAW_DUTY_CYCLE: f64 = 50.0;

/// Error types for move encoding
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Axes {first} and {second} both move node {node} in one leg")]
    NodeConflict { node: NodeId, first: Axis, second: Axis },

    #[error("No node assigned to axis {0}")]
    Unmapped(Axis),

    #[error("Invalid step: {0}")]
    InvalidStep(String),
}

/// Node that drives each axis under the standard wiring
pub fn default_node_map() -> BTreeMap<Axis, NodeId> {
    BTreeMap::from([
        (Axis::X, NodeId::GantryX),
        (Axis::Y, NodeId::GantryY),
        (Axis::ZLeft, NodeId::HeadL),
        (Axis::ZRight, NodeId::HeadR),
        (Axis::PlungerLeft, NodeId::PipetteLeft),
        (Axis::PlungerRight, NodeId::PipetteRight),
        (Axis::GripperJaw, NodeId::GripperG),
        (Axis::GripperZ, NodeId::GripperZ),
        (Axis::TipAction, NodeId::PipetteLeft),
    ])
}

/// Turns planned moves into move groups
#[derive(Debug, Clone)]
pub struct MoveEncoder {
    node_map: BTreeMap<Axis, NodeId>,
    jaw_duty_cycle: f64,
}

impl Default for MoveEncoder {
    fn default() -> Self {
        Self {
            node_map: default_node_map(),
            jaw_duty_cycle: DEFAULT_JAW_DUTY_CYCLE,
        }
    }
}

impl MoveEncoder {
    pub fn new(node_map: BTreeMap<Axis, NodeId>, jaw_duty_cycle: f64) -> Self {
        Self {
            node_map,
            jaw_duty_cycle,
        }
    }

    /// Physical nodes driven by `axis`
    fn nodes_for(&self, axis: Axis) -> Result<&'static [NodeId], EncodeError> {
        self.node_map
            .get(&axis)
            .map(|node| node.expand())
            .ok_or(EncodeError::Unmapped(axis))
    }

    /// Moving axes keyed by the node they drive; rejects shared nodes
    fn moving_nodes(&self, m: &Move) -> Result<BTreeMap<NodeId, Axis>, EncodeError> {
        let mut nodes: BTreeMap<NodeId, Axis> = BTreeMap::new();
        for axis in Axis::ALL.into_iter().filter(|&axis| m.moves_axis(axis)) {
            for &node in self.nodes_for(axis)? {
                if let Some(&first) = nodes.get(&node) {
                    return Err(EncodeError::NodeConflict {
                        node,
                        first,
                        second: axis,
                    });
                }
                nodes.insert(node, axis);
            }
        }
        Ok(nodes)
    }

    /// One group for one leg, one step per block that takes time
    pub fn encode_move(&self, m: &Move) -> Result<MoveGroup, EncodeError> {
        let nodes = self.moving_nodes(m)?;
        let mut steps = Vec::new();
        let mut jaw_position = m.start[Axis::GripperJaw];

        for index in 0..m.blocks.len() {
            let duration = m.blocks[index].time();
            if duration < EPSILON {
                continue;
            }

            let mut step = BTreeMap::new();
            for (&node, &axis) in &nodes {
                let block = m.axis_block(axis, index);
                // Moving-axes filter: an axis at constant zero speed has nothing to do
                if block.initial_speed.abs() < EPSILON && block.acceleration.abs() < EPSILON {
                    continue;
                }
                let encoded = match axis {
                    Axis::GripperJaw => {
                        jaw_position += block.distance;
                        MoveStep::Gripper {
                            kind: GripperMoveKind::Linear,
                            duration,
                            duty_cycle: self.jaw_duty_cycle,
                            encoder_position_um: mm_to_um(jaw_position),
                            stop_condition: MoveStopCondition::empty(),
                        }
                    }
                    Axis::TipAction => MoveStep::TipAction {
                        action: if block.distance >= 0.0 {
                            TipActionType::PickUp
                        } else {
                            TipActionType::Drop
                        },
                        velocity: block.initial_speed,
                        acceleration: block.acceleration,
                        duration,
                        stop_condition: MoveStopCondition::empty(),
                    },
                    _ => MoveStep::Linear {
                        distance: block.distance,
                        velocity: block.initial_speed,
                        acceleration: block.acceleration,
                        duration,
                        stop_condition: MoveStopCondition::empty(),
                    },
                };
                step.insert(node, encoded);
            }
            if !step.is_empty() {
                steps.push(step);
            }
        }

        debug!("Encoded leg into {} steps for {:?}", steps.len(), nodes.keys());
        Ok(MoveGroup::new(steps))
    }

    /// One group per leg; legs that move nothing are dropped
    pub fn encode_moves(&self, moves: &[Move]) -> Result<MoveGroups, EncodeError> {
        let mut groups = Vec::with_capacity(moves.len());
        for m in moves {
            let group = self.encode_move(m)?;
            if !group.is_empty() {
                groups.push(group);
            }
        }
        Ok(groups)
    }
}

/// Drive `nodes` towards their limit switches
pub fn home_group(nodes: &[NodeId], distance: f64, velocity: f64) -> Result<MoveGroup, EncodeError> {
    if velocity.abs() < EPSILON || !velocity.is_finite() || !distance.is_finite() {
        return Err(EncodeError::InvalidStep(format!(
            "home needs a finite non-zero velocity, got {}",
            velocity
        )));
    }
    // Direction comes from the distance; speed from the velocity
    let velocity = velocity.abs().copysign(distance);
    let duration = (distance / velocity).abs();
    let step = expand_nodes(nodes.iter().copied())
        .into_iter()
        .map(|node| {
            (
                node,
                MoveStep::Home {
                    distance,
                    velocity,
                    duration,
                    stop_condition: MoveStopCondition::LIMIT_SWITCH,
                },
            )
        })
        .collect();
    Ok(MoveGroup::new(vec![step]))
}

/// Close the jaw with a fixed PWM until the force condition trips
pub fn grip_group(duty_cycle: f64, duration: f64) -> MoveGroup {
    MoveGroup::new(vec![BTreeMap::from([(
        NodeId::GripperG,
        MoveStep::Gripper {
            kind: GripperMoveKind::Grip,
            duration,
            duty_cycle,
            encoder_position_um: 0,
            stop_condition: MoveStopCondition::GRIPPER_FORCE,
        },
    )])])
}

/// Open the jaw to its home switch
pub fn jaw_home_group(duty_cycle: f64, duration: f64) -> MoveGroup {
    MoveGroup::new(vec![BTreeMap::from([(
        NodeId::GripperG,
        MoveStep::Gripper {
            kind: GripperMoveKind::Home,
            duration,
            duty_cycle,
            encoder_position_um: 0,
            stop_condition: MoveStopCondition::LIMIT_SWITCH,
        },
    )])])
}

/// Pick up or drop tips with the gear motors on `node`
pub fn tip_action_group(
    node: NodeId,
    action: TipActionType,
    distance: f64,
    velocity: f64,
) -> Result<MoveGroup, EncodeError> {
    if velocity.abs() < EPSILON || !velocity.is_finite() || !distance.is_finite() {
        return Err(EncodeError::InvalidStep(format!(
            "tip action needs a finite non-zero velocity, got {}",
            velocity
        )));
    }
    let velocity = velocity.abs().copysign(distance);
    let stop_condition = match action {
        TipActionType::PickUp => MoveStopCondition::empty(),
        TipActionType::Drop => MoveStopCondition::LIMIT_SWITCH,
    };
    let step = node
        .expand()
        .iter()
        .map(|&n| {
            (
                n,
                MoveStep::TipAction {
                    action,
                    velocity,
                    acceleration: 0.0,
                    duration: (distance / velocity).abs(),
                    stop_condition,
                },
            )
        })
        .collect();
    Ok(MoveGroup::new(vec![step]))
}

/// Wire request for one node's step
pub fn step_message(step: &MoveStep, group_id: u8, seq_id: u8) -> MessageBody {
    match *step {
        MoveStep::Linear {
            velocity,
            acceleration,
            duration,
            stop_condition,
            ..
        } => MessageBody::AddLinearMove(AddLinearMove {
            group_id,
            seq_id,
            duration: duration_to_wire(duration, MotorClock::Stepper),
            acceleration: acceleration_to_wire(acceleration, MotorClock::Stepper),
            velocity: velocity_to_wire(velocity, MotorClock::Stepper),
            request_stop_condition: stop_condition.bits(),
        }),
        MoveStep::Home {
            velocity,
            duration,
            stop_condition,
            ..
        } => MessageBody::HomeRequest(HomeRequest {
            group_id,
            seq_id,
            duration: duration_to_wire(duration, MotorClock::Stepper),
            velocity: velocity_to_wire(velocity, MotorClock::Stepper),
            request_stop_condition: stop_condition.bits(),
        }),
        MoveStep::Gripper {
            kind,
            duration,
            duty_cycle,
            encoder_position_um,
            stop_condition,
        } => {
            let payload = GripperMove {
                group_id,
                seq_id,
                duration: duration_to_wire(duration, MotorClock::Brushed),
                duty_cycle: duty_cycle.clamp(0.0, 100.0) as u32,
                encoder_position_um,
                request_stop_condition: stop_condition.bits(),
            };
            match kind {
                GripperMoveKind::Grip => MessageBody::GripperGrip(payload),
                GripperMoveKind::Home => MessageBody::GripperHome(payload),
                GripperMoveKind::Linear => MessageBody::AddBrushedLinearMove(payload),
            }
        }
        MoveStep::TipAction {
            action,
            velocity,
            acceleration,
            duration,
            stop_condition,
        } => MessageBody::TipActionRequest(TipActionRequest {
            group_id,
            seq_id,
            duration: duration_to_wire(duration, MotorClock::Tip),
            velocity: velocity_to_wire(velocity, MotorClock::Tip),
            acceleration: acceleration_to_wire(acceleration, MotorClock::Tip),
            action: action as u8,
            request_stop_condition: stop_condition.bits(),
        }),
    }
}
