// Node addressing and 29-bit arbitration ids
//
// Layout (LSB first):
// function code (4 bits) | destination node (7) | originating node (7) | message id (11)

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

const FUNCTION_CODE_BITS: u32 = 4;
const NODE_ID_BITS: u32 = 7;
const MESSAGE_ID_BITS: u32 = 11;

const NODE_SHIFT: u32 = FUNCTION_CODE_BITS;
const ORIGIN_SHIFT: u32 = NODE_SHIFT + NODE_ID_BITS;
const MESSAGE_SHIFT: u32 = ORIGIN_SHIFT + NODE_ID_BITS;

/// Highest value a packed arbitration id can take
pub const ARBITRATION_ID_MASK: u32 = (1 << (MESSAGE_SHIFT + MESSAGE_ID_BITS)) - 1;

/// Bus participants
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Broadcast = 0x00,
    Host = 0x10,
    Gripper = 0x20,
    GripperZ = 0x21,
    GripperG = 0x22,
    GantryX = 0x30,
    GantryY = 0x40,
    Head = 0x50,
    HeadL = 0x51,
    HeadR = 0x52,
    PipetteLeft = 0x60,
    PipetteRight = 0x70,
}

impl NodeId {
    pub const ALL: [NodeId; 12] = [
        NodeId::Broadcast,
        NodeId::Host,
        NodeId::Gripper,
        NodeId::GripperZ,
        NodeId::GripperG,
        NodeId::GantryX,
        NodeId::GantryY,
        NodeId::Head,
        NodeId::HeadL,
        NodeId::HeadR,
        NodeId::PipetteLeft,
        NodeId::PipetteRight,
    ];

    pub fn from_u8(raw: u8) -> Option<NodeId> {
        NodeId::ALL.into_iter().find(|node| *node as u8 == raw)
    }

    /// Virtual nodes stand for a board with several motor controllers
    pub fn is_virtual(self) -> bool {
        matches!(self, NodeId::Head | NodeId::Gripper)
    }

    /// Physical nodes this id addresses
    pub fn expand(self) -> &'static [NodeId] {
        match self {
            NodeId::Head => &[NodeId::HeadL, NodeId::HeadR],
            NodeId::Gripper => &[NodeId::GripperZ, NodeId::GripperG],
            NodeId::Broadcast => &[NodeId::Broadcast],
            NodeId::Host => &[NodeId::Host],
            NodeId::GripperZ => &[NodeId::GripperZ],
            NodeId::GripperG => &[NodeId::GripperG],
            NodeId::GantryX => &[NodeId::GantryX],
            NodeId::GantryY => &[NodeId::GantryY],
            NodeId::HeadL => &[NodeId::HeadL],
            NodeId::HeadR => &[NodeId::HeadR],
            NodeId::PipetteLeft => &[NodeId::PipetteLeft],
            NodeId::PipetteRight => &[NodeId::PipetteRight],
        }
    }
}

/// Expand every virtual node in `nodes`; expanding twice changes nothing
pub fn expand_nodes(nodes: impl IntoIterator<Item = NodeId>) -> BTreeSet<NodeId> {
    nodes
        .into_iter()
        .flat_map(|node| node.expand().iter().copied())
        .collect()
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeId::Broadcast => "broadcast",
            NodeId::Host => "host",
            NodeId::Gripper => "gripper",
            NodeId::GripperZ => "gripper_z",
            NodeId::GripperG => "gripper_g",
            NodeId::GantryX => "gantry_x",
            NodeId::GantryY => "gantry_y",
            NodeId::Head => "head",
            NodeId::HeadL => "head_l",
            NodeId::HeadR => "head_r",
            NodeId::PipetteLeft => "pipette_left",
            NodeId::PipetteRight => "pipette_right",
        };
        f.write_str(name)
    }
}

/// Message class carried in the low bits of the arbitration id
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    NetworkManagement = 0x0,
    Sync = 0x2,
    Error = 0x4,
    Command = 0x6,
    Status = 0x8,
    Parameters = 0xA,
    Bootloader = 0xC,
    Heartbeat = 0xE,
}

/// Unpacked arbitration id
///
/// Node and message fields keep their raw values so frames from unknown
/// senders can still be logged and filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArbitrationId {
    pub function_code: u8,
    pub node_id: u8,
    pub originating_node_id: u8,
    pub message_id: u16,
}

impl ArbitrationId {
    /// Address a message from the host to `node`
    pub fn from_host(node: NodeId, function_code: FunctionCode, message_id: u16) -> Self {
        Self {
            function_code: function_code as u8,
            node_id: node as u8,
            originating_node_id: NodeId::Host as u8,
            message_id,
        }
    }

    pub fn pack(&self) -> u32 {
        let function = u32::from(self.function_code) & ((1 << FUNCTION_CODE_BITS) - 1);
        let node = u32::from(self.node_id) & ((1 << NODE_ID_BITS) - 1);
        let origin = u32::from(self.originating_node_id) & ((1 << NODE_ID_BITS) - 1);
        let message = u32::from(self.message_id) & ((1 << MESSAGE_ID_BITS) - 1);
        function | (node << NODE_SHIFT) | (origin << ORIGIN_SHIFT) | (message << MESSAGE_SHIFT)
    }

    pub fn unpack(raw: u32) -> Self {
        Self {
            function_code: (raw & ((1 << FUNCTION_CODE_BITS) - 1)) as u8,
            node_id: ((raw >> NODE_SHIFT) & ((1 << NODE_ID_BITS) - 1)) as u8,
            originating_node_id: ((raw >> ORIGIN_SHIFT) & ((1 << NODE_ID_BITS) - 1)) as u8,
            message_id: ((raw >> MESSAGE_SHIFT) & ((1 << MESSAGE_ID_BITS) - 1)) as u16,
        }
    }

    pub fn node(&self) -> Option<NodeId> {
        NodeId::from_u8(self.node_id)
    }

    pub fn origin(&self) -> Option<NodeId> {
        NodeId::from_u8(self.originating_node_id)
    }
}
