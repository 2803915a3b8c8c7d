// Per-node move steps and the groups the runner executes

use std::collections::{BTreeMap, BTreeSet};

use bitflags::bitflags;
use serde::{Serialize, Serializer};

use crate::bus::arbitration::NodeId;

bitflags! {
    /// Conditions that end a step early on the node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MoveStopCondition: u8 {
        const LIMIT_SWITCH = 0x01;
        const SYNC_LINE = 0x02;
        const ENCODER_POSITION = 0x04;
        const GRIPPER_FORCE = 0x08;
        const STALL = 0x10;
        const IGNORE_STALLS = 0x20;
        const LIMIT_SWITCH_BACKOFF = 0x40;
    }
}

impl Serialize for MoveStopCondition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GripperMoveKind {
    Home,
    Grip,
    Linear,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TipActionType {
    PickUp = 0,
    Drop = 1,
}

/// One node's share of one step, in physical units
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum MoveStep {
    Linear {
        /// mm, signed
        distance: f64,
        /// mm/s
        velocity: f64,
        /// mm/s^2
        acceleration: f64,
        /// s
        duration: f64,
        stop_condition: MoveStopCondition,
    },
    Home {
        distance: f64,
        velocity: f64,
        duration: f64,
        stop_condition: MoveStopCondition,
    },
    Gripper {
        kind: GripperMoveKind,
        duration: f64,
        /// percent PWM
        duty_cycle: f64,
        encoder_position_um: i32,
        stop_condition: MoveStopCondition,
    },
    TipAction {
        action: TipActionType,
        velocity: f64,
        acceleration: f64,
        duration: f64,
        stop_condition: MoveStopCondition,
    },
}

impl MoveStep {
    pub fn duration(&self) -> f64 {
        match self {
            MoveStep::Linear { duration, .. }
            | MoveStep::Home { duration, .. }
            | MoveStep::Gripper { duration, .. }
            | MoveStep::TipAction { duration, .. } => *duration,
        }
    }

    pub fn stop_condition(&self) -> MoveStopCondition {
        match self {
            MoveStep::Linear { stop_condition, .. }
            | MoveStep::Home { stop_condition, .. }
            | MoveStep::Gripper { stop_condition, .. }
            | MoveStep::TipAction { stop_condition, .. } => *stop_condition,
        }
    }
}

/// Everything the nodes do between two execute triggers
///
/// Steps run in order; within a step every node runs concurrently.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MoveGroup {
    pub steps: Vec<BTreeMap<NodeId, MoveStep>>,
}

pub type MoveGroups = Vec<MoveGroup>;

impl MoveGroup {
    pub fn new(steps: Vec<BTreeMap<NodeId, MoveStep>>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(BTreeMap::is_empty)
    }

    /// Wall-clock length: the slowest node of each step, summed
    pub fn duration(&self) -> f64 {
        self.steps
            .iter()
            .map(|step| step.values().map(MoveStep::duration).fold(0.0, f64::max))
            .sum()
    }

    /// Every node that has at least one step in this group
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.steps.iter().flat_map(|step| step.keys().copied()).collect()
    }
}
