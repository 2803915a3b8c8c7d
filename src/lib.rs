// Host-side motion stack for a multi-axis lab gantry
//
// Provides:
// - Trajectory planning with junction blending
// - Encoding of planned legs into per-node move groups
// - The bus protocol, transports and messenger
// - Move group execution, fault translation and node listeners

pub mod bus;
pub mod config;
pub mod error;
pub mod job;
pub mod listeners;
pub mod motion;
pub mod planning;
pub mod runner;
pub mod runtime;

pub use error::{FaultDetail, MotionError};
pub use runner::{MoveFailure, RunOutcome, StopSignal};
pub use runtime::MotionRuntime;
