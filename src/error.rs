// Typed motion faults and the wire error translator

use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use crate::bus::arbitration::NodeId;
use crate::bus::driver::BusError;
use crate::bus::messages::{ErrorCode, ErrorSeverity};

/// What a fault is about: who reported it, the raw wire values, free-form context
///
/// `code` and `severity` are only set when a node reported the fault; host-side
/// faults such as a missed deadline carry neither.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FaultDetail {
    pub node: Option<NodeId>,
    pub code: Option<u16>,
    pub severity: Option<u16>,
    pub context: BTreeMap<String, String>,
}

impl FaultDetail {
    pub fn new(node: Option<NodeId>) -> Self {
        Self {
            node,
            ..Self::default()
        }
    }

    /// Detail for an error report received from a node
    pub fn reported(node: Option<NodeId>, code: u16, severity: u16) -> Self {
        Self {
            node,
            code: Some(code),
            severity: Some(severity),
            context: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Wire name of the error code, `unknown(0x....)` outside the known set
    pub fn code_name(&self) -> Option<String> {
        self.code.map(|raw| match ErrorCode::from_u16(raw) {
            Some(code) => code.name().to_string(),
            None => format!("unknown(0x{:04X})", raw),
        })
    }

    pub fn severity_name(&self) -> Option<String> {
        self.severity.map(|raw| match ErrorSeverity::from_u16(raw) {
            Some(severity) => severity.name().to_string(),
            None => format!("unknown({})", raw),
        })
    }
}

impl fmt::Display for FaultDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node {
            Some(node) => write!(f, "node {}", node)?,
            None => f.write_str("host")?,
        }
        if let Some(code) = self.code_name() {
            write!(f, ", code {}", code)?;
        }
        if let Some(severity) = self.severity_name() {
            write!(f, ", severity {}", severity)?;
        }
        for (key, value) in &self.context {
            write!(f, ", {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Error types surfaced by move execution
#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error("Malformed message ({0})")]
    MalformedMessage(FaultDetail),

    #[error("Interaction busy ({0})")]
    InteractionBusy(FaultDetail),

    #[error("Command timed out ({0})")]
    CommandTimedOut(FaultDetail),

    #[error("E-stop activated ({0})")]
    EStopActivated(FaultDetail),

    #[error("Stall or collision detected ({0})")]
    StallOrCollision(FaultDetail),

    #[error("Pipette overpressure ({0})")]
    PipetteOverpressure(FaultDetail),

    #[error("Labware dropped ({0})")]
    LabwareDropped(FaultDetail),

    #[error("Control fault ({0})")]
    ControlFault(FaultDetail),

    #[error("Hardware fault ({0})")]
    HardwareFault(FaultDetail),

    #[error("Move condition not met ({0})")]
    MoveConditionNotMet(FaultDetail),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

pub type Result<T> = std::result::Result<T, MotionError>;

impl MotionError {
    pub fn detail(&self) -> Option<&FaultDetail> {
        match self {
            MotionError::MalformedMessage(d)
            | MotionError::InteractionBusy(d)
            | MotionError::CommandTimedOut(d)
            | MotionError::EStopActivated(d)
            | MotionError::StallOrCollision(d)
            | MotionError::PipetteOverpressure(d)
            | MotionError::LabwareDropped(d)
            | MotionError::ControlFault(d)
            | MotionError::HardwareFault(d)
            | MotionError::MoveConditionNotMet(d) => Some(d),
            MotionError::Bus(_) => None,
        }
    }
}

/// Map a node's `(code, severity)` report onto a typed fault
///
/// Returns `None` for `ok` codes and warnings. Values outside the known
/// code or severity sets are reported as malformed.
pub fn translate(
    node: Option<NodeId>,
    raw_code: u16,
    raw_severity: u16,
    context: BTreeMap<String, String>,
) -> Option<MotionError> {
    let detail = FaultDetail {
        context,
        ..FaultDetail::reported(node, raw_code, raw_severity)
    };

    let (Some(code), Some(severity)) = (ErrorCode::from_u16(raw_code), ErrorSeverity::from_u16(raw_severity)) else {
        warn!("Unknown error report from {:?}: code 0x{:04X}, severity {}", node, raw_code, raw_severity);
        return Some(MotionError::MalformedMessage(detail));
    };
    if code == ErrorCode::Ok || severity == ErrorSeverity::Warning {
        return None;
    }

    let fault = match code {
        ErrorCode::Ok => return None,
        ErrorCode::InvalidSize
        | ErrorCode::BadChecksum
        | ErrorCode::InvalidByteCount
        | ErrorCode::InvalidInput => MotionError::MalformedMessage(detail),
        ErrorCode::MotorBusy => MotionError::InteractionBusy(detail),
        ErrorCode::Timeout => MotionError::CommandTimedOut(detail),
        ErrorCode::EstopDetected => MotionError::EStopActivated(detail),
        ErrorCode::CollisionDetected => MotionError::StallOrCollision(detail),
        ErrorCode::OverPressure => MotionError::PipetteOverpressure(detail),
        ErrorCode::LabwareDropped => MotionError::LabwareDropped(detail),
        ErrorCode::StopRequested | ErrorCode::EstopReleased => MotionError::ControlFault(detail),
        ErrorCode::Hardware
        | ErrorCode::DoorOpen
        | ErrorCode::ReedOpen
        | ErrorCode::MotorDriverError
        | ErrorCode::SafetyRelayInactive => MotionError::HardwareFault(detail),
    };
    Some(fault)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEVERITIES: [ErrorSeverity; 4] = [
        ErrorSeverity::None,
        ErrorSeverity::Warning,
        ErrorSeverity::Recoverable,
        ErrorSeverity::Unrecoverable,
    ];

    fn fault(code: ErrorCode) -> Option<MotionError> {
        translate(
            Some(NodeId::HeadL),
            code as u16,
            ErrorSeverity::Unrecoverable as u16,
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_every_known_pair_translates() {
        for code in ErrorCode::ALL {
            for severity in SEVERITIES {
                let result = translate(Some(NodeId::GantryX), code as u16, severity as u16, BTreeMap::new());
                let expect_none = code == ErrorCode::Ok || severity == ErrorSeverity::Warning;
                assert_eq!(result.is_none(), expect_none, "{:?} {:?}", code, severity);
                if let Some(err) = result {
                    let detail = err.detail().unwrap();
                    assert_eq!(detail.node, Some(NodeId::GantryX));
                    assert_eq!(detail.code, Some(code as u16));
                    assert_eq!(detail.severity, Some(severity as u16));
                }
            }
        }
    }

    #[test]
    fn test_table() {
        assert!(matches!(fault(ErrorCode::BadChecksum), Some(MotionError::MalformedMessage(_))));
        assert!(matches!(fault(ErrorCode::MotorBusy), Some(MotionError::InteractionBusy(_))));
        assert!(matches!(fault(ErrorCode::Timeout), Some(MotionError::CommandTimedOut(_))));
        assert!(matches!(fault(ErrorCode::EstopDetected), Some(MotionError::EStopActivated(_))));
        assert!(matches!(fault(ErrorCode::CollisionDetected), Some(MotionError::StallOrCollision(_))));
        assert!(matches!(fault(ErrorCode::OverPressure), Some(MotionError::PipetteOverpressure(_))));
        assert!(matches!(fault(ErrorCode::LabwareDropped), Some(MotionError::LabwareDropped(_))));
        assert!(matches!(fault(ErrorCode::StopRequested), Some(MotionError::ControlFault(_))));
        assert!(matches!(fault(ErrorCode::EstopReleased), Some(MotionError::ControlFault(_))));
        assert!(matches!(fault(ErrorCode::DoorOpen), Some(MotionError::HardwareFault(_))));
        assert!(matches!(fault(ErrorCode::Hardware), Some(MotionError::HardwareFault(_))));
    }

    #[test]
    fn test_unknown_values_are_malformed() {
        let unknown_code = translate(None, 0x7777, ErrorSeverity::Recoverable as u16, BTreeMap::new());
        assert!(matches!(unknown_code, Some(MotionError::MalformedMessage(_))));

        // unknown severity wins even for an otherwise ignorable code
        let unknown_severity = translate(None, ErrorCode::Ok as u16, 42, BTreeMap::new());
        assert!(matches!(unknown_severity, Some(MotionError::MalformedMessage(_))));
    }

    #[test]
    fn test_context_is_kept() {
        let context = BTreeMap::from([("group".to_string(), "3".to_string())]);
        let err = translate(Some(NodeId::GantryY), ErrorCode::Timeout as u16, 2, context).unwrap();
        assert_eq!(err.detail().unwrap().context["group"], "3");
        assert!(err.to_string().contains("group=3"));
    }

    #[test]
    fn test_detail_names_code_and_severity() {
        let err = translate(
            Some(NodeId::HeadL),
            ErrorCode::OverPressure as u16,
            ErrorSeverity::Recoverable as u16,
            BTreeMap::new(),
        )
        .unwrap();
        let rendered = err.to_string();
        assert!(rendered.contains("over_pressure"), "{}", rendered);
        assert!(rendered.contains("recoverable"), "{}", rendered);
        assert!(!rendered.contains("0x0D"), "{}", rendered);

        let unknown = translate(None, 0x1234, 7, BTreeMap::new()).unwrap();
        let detail = unknown.detail().unwrap();
        assert_eq!(detail.code_name().as_deref(), Some("unknown(0x1234)"));
        assert_eq!(detail.severity_name().as_deref(), Some("unknown(7)"));
    }

    #[test]
    fn test_host_fault_has_no_wire_code() {
        let detail = FaultDetail::new(Some(NodeId::GantryY)).with("missing_nodes", "gantry_y");
        assert_eq!(detail.to_string(), "node gantry_y, missing_nodes=gantry_y");
    }
}
