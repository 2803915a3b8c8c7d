// Move encoding for the motor nodes
//
// Provides:
// - Per-node move steps and move groups
// - Fixed-point unit conversions for the firmware
// - Encoding of planned legs into groups and groups into wire requests

pub mod encoder;
pub mod steps;
pub mod units;

pub use encoder::{EncodeError, MoveEncoder};
pub use steps::{MoveGroup, MoveGroups, MoveStep, MoveStopCondition};
