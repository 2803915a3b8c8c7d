// Trajectory planning for the gantry
//
// Provides:
// - Geometry primitives (axes, coordinates, constraints, blocks, moves)
// - Junction speed rules and trapezoid construction
// - The iterative move manager

pub mod blend;
pub mod manager;
pub mod types;

pub use manager::{MoveManager, DEFAULT_ITERATION_LIMIT};
pub use types::{
    Axis, AxisBlock, AxisConstraints, Block, Coordinates, Move, MoveTarget, SystemConstraints,
    EPSILON, MINIMUM_DISPLACEMENT,
};

use crate::motion::encoder::EncodeError;

/// Error types for planning
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Invalid constraints for axis {axis}: {reason}")]
    InvalidConstraints { axis: Axis, reason: String },

    #[error("No constraints given for moving axis {0}")]
    MissingConstraints(Axis),

    #[error("Invalid target {index}: {reason}")]
    InvalidTarget { index: usize, reason: String },

    #[error("Origin is not finite")]
    InvalidOrigin,

    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),
}
