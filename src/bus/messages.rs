// Message ids and binary payloads exchanged with the motor nodes
//
// Every payload starts with a big-endian u32 message index; the rest of the
// fields follow in declaration order, also big-endian.

use std::io::Cursor;

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Message identifiers (11 bits on the wire)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Stop = 0x00,
    Acknowledgement = 0x01,
    Error = 0x02,
    GetStatusRequest = 0x04,
    GetStatusResponse = 0x05,
    EnableMotor = 0x06,
    DisableMotor = 0x07,
    GetMotorEnabledRequest = 0x08,
    GetMotorEnabledResponse = 0x09,
    MoveCompleted = 0x13,
    AddLinearMove = 0x15,
    ExecuteMoveGroup = 0x18,
    ClearAllMoveGroups = 0x19,
    HomeRequest = 0x20,
    GripperGrip = 0x41,
    GripperHome = 0x42,
    AddBrushedLinearMove = 0x44,
    TipActionRequest = 0x501,
    TipActionResponse = 0x502,
    TipPresenceNotification = 0x503,
    TipStatusQuery = 0x504,
}

impl MessageId {
    const ALL: [MessageId; 21] = [
        MessageId::Stop,
        MessageId::Acknowledgement,
        MessageId::Error,
        MessageId::GetStatusRequest,
        MessageId::GetStatusResponse,
        MessageId::EnableMotor,
        MessageId::DisableMotor,
        MessageId::GetMotorEnabledRequest,
        MessageId::GetMotorEnabledResponse,
        MessageId::MoveCompleted,
        MessageId::AddLinearMove,
        MessageId::ExecuteMoveGroup,
        MessageId::ClearAllMoveGroups,
        MessageId::HomeRequest,
        MessageId::GripperGrip,
        MessageId::GripperHome,
        MessageId::AddBrushedLinearMove,
        MessageId::TipActionRequest,
        MessageId::TipActionResponse,
        MessageId::TipPresenceNotification,
        MessageId::TipStatusQuery,
    ];

    pub fn from_u16(raw: u16) -> Option<MessageId> {
        MessageId::ALL.into_iter().find(|id| *id as u16 == raw)
    }
}

/// Error codes reported by the nodes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0x00,
    InvalidSize = 0x01,
    BadChecksum = 0x02,
    InvalidByteCount = 0x03,
    InvalidInput = 0x04,
    Hardware = 0x05,
    Timeout = 0x06,
    EstopDetected = 0x07,
    CollisionDetected = 0x08,
    LabwareDropped = 0x09,
    EstopReleased = 0x0A,
    MotorBusy = 0x0B,
    StopRequested = 0x0C,
    OverPressure = 0x0D,
    DoorOpen = 0x0E,
    ReedOpen = 0x0F,
    MotorDriverError = 0x10,
    SafetyRelayInactive = 0x11,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 18] = [
        ErrorCode::Ok,
        ErrorCode::InvalidSize,
        ErrorCode::BadChecksum,
        ErrorCode::InvalidByteCount,
        ErrorCode::InvalidInput,
        ErrorCode::Hardware,
        ErrorCode::Timeout,
        ErrorCode::EstopDetected,
        ErrorCode::CollisionDetected,
        ErrorCode::LabwareDropped,
        ErrorCode::EstopReleased,
        ErrorCode::MotorBusy,
        ErrorCode::StopRequested,
        ErrorCode::OverPressure,
        ErrorCode::DoorOpen,
        ErrorCode::ReedOpen,
        ErrorCode::MotorDriverError,
        ErrorCode::SafetyRelayInactive,
    ];

    pub fn from_u16(raw: u16) -> Option<ErrorCode> {
        ErrorCode::ALL.into_iter().find(|code| *code as u16 == raw)
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::InvalidSize => "invalid_size",
            ErrorCode::BadChecksum => "bad_checksum",
            ErrorCode::InvalidByteCount => "invalid_byte_count",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::Hardware => "hardware",
            ErrorCode::Timeout => "timeout",
            ErrorCode::EstopDetected => "estop_detected",
            ErrorCode::CollisionDetected => "collision_detected",
            ErrorCode::LabwareDropped => "labware_dropped",
            ErrorCode::EstopReleased => "estop_released",
            ErrorCode::MotorBusy => "motor_busy",
            ErrorCode::StopRequested => "stop_requested",
            ErrorCode::OverPressure => "over_pressure",
            ErrorCode::DoorOpen => "door_open",
            ErrorCode::ReedOpen => "reed_open",
            ErrorCode::MotorDriverError => "motor_driver_error",
            ErrorCode::SafetyRelayInactive => "safety_relay_inactive",
        }
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSeverity {
    None = 0,
    Warning = 1,
    Recoverable = 2,
    Unrecoverable = 3,
}

impl ErrorSeverity {
    pub fn from_u16(raw: u16) -> Option<ErrorSeverity> {
        match raw {
            0 => Some(ErrorSeverity::None),
            1 => Some(ErrorSeverity::Warning),
            2 => Some(ErrorSeverity::Recoverable),
            3 => Some(ErrorSeverity::Unrecoverable),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorSeverity::None => "none",
            ErrorSeverity::Warning => "warning",
            ErrorSeverity::Recoverable => "recoverable",
            ErrorSeverity::Unrecoverable => "unrecoverable",
        }
    }
}

/// Why a node considers a move step finished
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveAckId {
    CompleteWithoutCondition = 1,
    StoppedByCondition = 2,
    Timeout = 3,
    PositionError = 4,
}

impl MoveAckId {
    pub fn from_u8(raw: u8) -> Option<MoveAckId> {
        match raw {
            1 => Some(MoveAckId::CompleteWithoutCondition),
            2 => Some(MoveAckId::StoppedByCondition),
            3 => Some(MoveAckId::Timeout),
            4 => Some(MoveAckId::PositionError),
            _ => None,
        }
    }
}

bitflags! {
    /// Which of the reported positions the node trusts
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PositionFlags: u8 {
        const STEPPER_POSITION_OK = 0x01;
        const ENCODER_POSITION_OK = 0x02;
    }
}

/// Error types for payload encoding and decoding
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Unknown message id 0x{0:03X}")]
    UnknownMessage(u16),

    #[error("Payload for {id:?} too short: expected {expected} bytes, got {actual}")]
    Truncated {
        id: MessageId,
        expected: usize,
        actual: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Completion report for one move step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveCompleted {
    pub group_id: u8,
    pub seq_id: u8,
    pub current_position_um: u32,
    pub encoder_position_um: i32,
    pub position_flags: u8,
    pub ack_id: u8,
}

impl MoveCompleted {
    pub fn ack(&self) -> Option<MoveAckId> {
        MoveAckId::from_u8(self.ack_id)
    }

    pub fn flags(&self) -> PositionFlags {
        PositionFlags::from_bits_truncate(self.position_flags)
    }
}

/// Fixed-point linear move step, see `motion::units`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddLinearMove {
    pub group_id: u8,
    pub seq_id: u8,
    pub duration: u32,
    pub acceleration: i32,
    pub velocity: i32,
    pub request_stop_condition: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomeRequest {
    pub group_id: u8,
    pub seq_id: u8,
    pub duration: u32,
    pub velocity: i32,
    pub request_stop_condition: u8,
}

/// Brushed motor step, shared by grip, home and linear moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GripperMove {
    pub group_id: u8,
    pub seq_id: u8,
    pub duration: u32,
    pub duty_cycle: u32,
    pub encoder_position_um: i32,
    pub request_stop_condition: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipActionRequest {
    pub group_id: u8,
    pub seq_id: u8,
    pub duration: u32,
    pub velocity: i32,
    pub acceleration: i32,
    pub action: u8,
    pub request_stop_condition: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipActionResponse {
    pub completed: MoveCompleted,
    pub action: u8,
    pub success: u8,
    pub gear_motor_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteMoveGroup {
    pub group_id: u8,
    pub start_trigger: u8,
    pub cancel_trigger: u8,
}

/// Raw error report; code and severity stay raw so unknown values survive decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorMessage {
    pub severity: u16,
    pub error_code: u16,
}

/// Payload of every message the stack sends or understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageBody {
    Stop,
    Acknowledgement,
    Error(ErrorMessage),
    GetStatusRequest,
    GetStatusResponse { status: u8, data: u32 },
    EnableMotor,
    DisableMotor,
    GetMotorEnabledRequest,
    GetMotorEnabledResponse { enabled: bool },
    MoveCompleted(MoveCompleted),
    AddLinearMove(AddLinearMove),
    ExecuteMoveGroup(ExecuteMoveGroup),
    ClearAllMoveGroups,
    HomeRequest(HomeRequest),
    GripperGrip(GripperMove),
    GripperHome(GripperMove),
    AddBrushedLinearMove(GripperMove),
    TipActionRequest(TipActionRequest),
    TipActionResponse(TipActionResponse),
    TipPresenceNotification { present: bool, sensor: u8 },
    TipStatusQuery,
}

/// A message with its index; acknowledgements echo the index they answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub index: u32,
    pub body: MessageBody,
}

impl MessageBody {
    pub fn message_id(&self) -> MessageId {
        match self {
            MessageBody::Stop => MessageId::Stop,
            MessageBody::Acknowledgement => MessageId::Acknowledgement,
            MessageBody::Error(_) => MessageId::Error,
            MessageBody::GetStatusRequest => MessageId::GetStatusRequest,
            MessageBody::GetStatusResponse { .. } => MessageId::GetStatusResponse,
            MessageBody::EnableMotor => MessageId::EnableMotor,
            MessageBody::DisableMotor => MessageId::DisableMotor,
            MessageBody::GetMotorEnabledRequest => MessageId::GetMotorEnabledRequest,
            MessageBody::GetMotorEnabledResponse { .. } => MessageId::GetMotorEnabledResponse,
            MessageBody::MoveCompleted(_) => MessageId::MoveCompleted,
            MessageBody::AddLinearMove(_) => MessageId::AddLinearMove,
            MessageBody::ExecuteMoveGroup(_) => MessageId::ExecuteMoveGroup,
            MessageBody::ClearAllMoveGroups => MessageId::ClearAllMoveGroups,
            MessageBody::HomeRequest(_) => MessageId::HomeRequest,
            MessageBody::GripperGrip(_) => MessageId::GripperGrip,
            MessageBody::GripperHome(_) => MessageId::GripperHome,
            MessageBody::AddBrushedLinearMove(_) => MessageId::AddBrushedLinearMove,
            MessageBody::TipActionRequest(_) => MessageId::TipActionRequest,
            MessageBody::TipActionResponse(_) => MessageId::TipActionResponse,
            MessageBody::TipPresenceNotification { .. } => MessageId::TipPresenceNotification,
            MessageBody::TipStatusQuery => MessageId::TipStatusQuery,
        }
    }

    /// (group, seq) of a move step request, if this is one
    pub fn step_id(&self) -> Option<(u8, u8)> {
        match self {
            MessageBody::AddLinearMove(m) => Some((m.group_id, m.seq_id)),
            MessageBody::HomeRequest(m) => Some((m.group_id, m.seq_id)),
            MessageBody::GripperGrip(m)
            | MessageBody::GripperHome(m)
            | MessageBody::AddBrushedLinearMove(m) => Some((m.group_id, m.seq_id)),
            MessageBody::TipActionRequest(m) => Some((m.group_id, m.seq_id)),
            _ => None,
        }
    }
}

/// Bytes each payload needs after the message index
fn body_len(id: MessageId) -> usize {
    match id {
        MessageId::Stop
        | MessageId::Acknowledgement
        | MessageId::GetStatusRequest
        | MessageId::EnableMotor
        | MessageId::DisableMotor
        | MessageId::GetMotorEnabledRequest
        | MessageId::ClearAllMoveGroups
        | MessageId::TipStatusQuery => 0,
        MessageId::Error => 4,
        MessageId::GetStatusResponse => 5,
        MessageId::GetMotorEnabledResponse => 1,
        MessageId::MoveCompleted => 12,
        MessageId::AddLinearMove => 15,
        MessageId::ExecuteMoveGroup => 3,
        MessageId::HomeRequest => 11,
        MessageId::GripperGrip | MessageId::GripperHome | MessageId::AddBrushedLinearMove => 15,
        MessageId::TipActionRequest => 16,
        MessageId::TipActionResponse => 15,
        MessageId::TipPresenceNotification => 2,
    }
}

fn write_completed(out: &mut Vec<u8>, m: &MoveCompleted) -> std::io::Result<()> {
    out.write_u8(m.group_id)?;
    out.write_u8(m.seq_id)?;
    out.write_u32::<BigEndian>(m.current_position_um)?;
    out.write_i32::<BigEndian>(m.encoder_position_um)?;
    out.write_u8(m.position_flags)?;
    out.write_u8(m.ack_id)
}

fn read_completed(cur: &mut Cursor<&[u8]>) -> std::io::Result<MoveCompleted> {
    Ok(MoveCompleted {
        group_id: cur.read_u8()?,
        seq_id: cur.read_u8()?,
        current_position_um: cur.read_u32::<BigEndian>()?,
        encoder_position_um: cur.read_i32::<BigEndian>()?,
        position_flags: cur.read_u8()?,
        ack_id: cur.read_u8()?,
    })
}

fn write_gripper(out: &mut Vec<u8>, m: &GripperMove) -> std::io::Result<()> {
    out.write_u8(m.group_id)?;
    out.write_u8(m.seq_id)?;
    out.write_u32::<BigEndian>(m.duration)?;
    out.write_u32::<BigEndian>(m.duty_cycle)?;
    out.write_i32::<BigEndian>(m.encoder_position_um)?;
    out.write_u8(m.request_stop_condition)
}

fn read_gripper(cur: &mut Cursor<&[u8]>) -> std::io::Result<GripperMove> {
    Ok(GripperMove {
        group_id: cur.read_u8()?,
        seq_id: cur.read_u8()?,
        duration: cur.read_u32::<BigEndian>()?,
        duty_cycle: cur.read_u32::<BigEndian>()?,
        encoder_position_um: cur.read_i32::<BigEndian>()?,
        request_stop_condition: cur.read_u8()?,
    })
}

impl Message {
    pub fn new(index: u32, body: MessageBody) -> Self {
        Self { index, body }
    }

    pub fn message_id(&self) -> MessageId {
        self.body.message_id()
    }

    /// Serialize the payload (the message id travels in the arbitration id)
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let id = self.message_id();
        let mut out = Vec::with_capacity(4 + body_len(id));
        out.write_u32::<BigEndian>(self.index)?;

        match &self.body {
            MessageBody::Stop
            | MessageBody::Acknowledgement
            | MessageBody::GetStatusRequest
            | MessageBody::EnableMotor
            | MessageBody::DisableMotor
            | MessageBody::GetMotorEnabledRequest
            | MessageBody::ClearAllMoveGroups
            | MessageBody::TipStatusQuery => {}
            MessageBody::Error(e) => {
                out.write_u16::<BigEndian>(e.severity)?;
                out.write_u16::<BigEndian>(e.error_code)?;
            }
            MessageBody::GetStatusResponse { status, data } => {
                out.write_u8(*status)?;
                out.write_u32::<BigEndian>(*data)?;
            }
            MessageBody::GetMotorEnabledResponse { enabled } => {
                out.write_u8(u8::from(*enabled))?;
            }
            MessageBody::MoveCompleted(m) => write_completed(&mut out, m)?,
            MessageBody::AddLinearMove(m) => {
                out.write_u8(m.group_id)?;
                out.write_u8(m.seq_id)?;
                out.write_u32::<BigEndian>(m.duration)?;
                out.write_i32::<BigEndian>(m.acceleration)?;
                out.write_i32::<BigEndian>(m.velocity)?;
                out.write_u8(m.request_stop_condition)?;
            }
            MessageBody::ExecuteMoveGroup(m) => {
                out.write_u8(m.group_id)?;
                out.write_u8(m.start_trigger)?;
                out.write_u8(m.cancel_trigger)?;
            }
            MessageBody::HomeRequest(m) => {
                out.write_u8(m.group_id)?;
                out.write_u8(m.seq_id)?;
                out.write_u32::<BigEndian>(m.duration)?;
                out.write_i32::<BigEndian>(m.velocity)?;
                out.write_u8(m.request_stop_condition)?;
            }
            MessageBody::GripperGrip(m)
            | MessageBody::GripperHome(m)
            | MessageBody::AddBrushedLinearMove(m) => write_gripper(&mut out, m)?,
            MessageBody::TipActionRequest(m) => {
                out.write_u8(m.group_id)?;
                out.write_u8(m.seq_id)?;
                out.write_u32::<BigEndian>(m.duration)?;
                out.write_i32::<BigEndian>(m.velocity)?;
                out.write_i32::<BigEndian>(m.acceleration)?;
                out.write_u8(m.action)?;
                out.write_u8(m.request_stop_condition)?;
            }
            MessageBody::TipActionResponse(m) => {
                write_completed(&mut out, &m.completed)?;
                out.write_u8(m.action)?;
                out.write_u8(m.success)?;
                out.write_u8(m.gear_motor_id)?;
            }
            MessageBody::TipPresenceNotification { present, sensor } => {
                out.write_u8(u8::from(*present))?;
                out.write_u8(*sensor)?;
            }
        }
        Ok(out)
    }

    /// Parse a payload; trailing bytes beyond the known layout are ignored
    pub fn decode(raw_id: u16, data: &[u8]) -> Result<Message, CodecError> {
        let id = MessageId::from_u16(raw_id).ok_or(CodecError::UnknownMessage(raw_id))?;
        let expected = 4 + body_len(id);
        if data.len() < expected {
            return Err(CodecError::Truncated {
                id,
                expected,
                actual: data.len(),
            });
        }

        let mut cur = Cursor::new(data);
        let index = cur.read_u32::<BigEndian>()?;
        let body = match id {
            MessageId::Stop => MessageBody::Stop,
            MessageId::Acknowledgement => MessageBody::Acknowledgement,
            MessageId::Error => MessageBody::Error(ErrorMessage {
                severity: cur.read_u16::<BigEndian>()?,
                error_code: cur.read_u16::<BigEndian>()?,
            }),
            MessageId::GetStatusRequest => MessageBody::GetStatusRequest,
            MessageId::GetStatusResponse => MessageBody::GetStatusResponse {
                status: cur.read_u8()?,
                data: cur.read_u32::<BigEndian>()?,
            },
            MessageId::EnableMotor => MessageBody::EnableMotor,
            MessageId::DisableMotor => MessageBody::DisableMotor,
            MessageId::GetMotorEnabledRequest => MessageBody::GetMotorEnabledRequest,
            MessageId::GetMotorEnabledResponse => MessageBody::GetMotorEnabledResponse {
                enabled: cur.read_u8()? != 0,
            },
            MessageId::MoveCompleted => MessageBody::MoveCompleted(read_completed(&mut cur)?),
            MessageId::AddLinearMove => MessageBody::AddLinearMove(AddLinearMove {
                group_id: cur.read_u8()?,
                seq_id: cur.read_u8()?,
                duration: cur.read_u32::<BigEndian>()?,
                acceleration: cur.read_i32::<BigEndian>()?,
                velocity: cur.read_i32::<BigEndian>()?,
                request_stop_condition: cur.read_u8()?,
            }),
            MessageId::ExecuteMoveGroup => MessageBody::ExecuteMoveGroup(ExecuteMoveGroup {
                group_id: cur.read_u8()?,
                start_trigger: cur.read_u8()?,
                cancel_trigger: cur.read_u8()?,
            }),
            MessageId::ClearAllMoveGroups => MessageBody::ClearAllMoveGroups,
            MessageId::HomeRequest => MessageBody::HomeRequest(HomeRequest {
                group_id: cur.read_u8()?,
                seq_id: cur.read_u8()?,
                duration: cur.read_u32::<BigEndian>()?,
                velocity: cur.read_i32::<BigEndian>()?,
                request_stop_condition: cur.read_u8()?,
            }),
            MessageId::GripperGrip => MessageBody::GripperGrip(read_gripper(&mut cur)?),
            MessageId::GripperHome => MessageBody::GripperHome(read_gripper(&mut cur)?),
            MessageId::AddBrushedLinearMove => {
                MessageBody::AddBrushedLinearMove(read_gripper(&mut cur)?)
            }
            MessageId::TipActionRequest => MessageBody::TipActionRequest(TipActionRequest {
                group_id: cur.read_u8()?,
                seq_id: cur.read_u8()?,
                duration: cur.read_u32::<BigEndian>()?,
                velocity: cur.read_i32::<BigEndian>()?,
                acceleration: cur.read_i32::<BigEndian>()?,
                action: cur.read_u8()?,
                request_stop_condition: cur.read_u8()?,
            }),
            MessageId::TipActionResponse => MessageBody::TipActionResponse(TipActionResponse {
                completed: read_completed(&mut cur)?,
                action: cur.read_u8()?,
                success: cur.read_u8()?,
                gear_motor_id: cur.read_u8()?,
            }),
            MessageId::TipPresenceNotification => MessageBody::TipPresenceNotification {
                present: cur.read_u8()? != 0,
                sensor: cur.read_u8()?,
            },
            MessageId::TipStatusQuery => MessageBody::TipStatusQuery,
        };
        Ok(Message { index, body })
    }
}
