// Request and report types exchanged with callers as JSON

use serde::{Deserialize, Serialize};

use crate::motion::steps::MoveGroups;
use crate::planning::{Coordinates, MoveTarget, SystemConstraints, DEFAULT_ITERATION_LIMIT};
use crate::runner::{NodePositions, RunOutcome};

fn default_iteration_limit() -> u32 {
    DEFAULT_ITERATION_LIMIT
}

/// Where to go and under which limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    #[serde(default)]
    pub origin: Coordinates,
    pub targets: Vec<MoveTarget>,
    pub constraints: SystemConstraints,
    #[serde(default = "default_iteration_limit")]
    pub iteration_limit: u32,
}

/// Planner output as printed by `plan`
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub converged: bool,
    /// s
    pub duration: f64,
    pub groups: MoveGroups,
}

impl PlanReport {
    pub fn new(converged: bool, groups: MoveGroups) -> Self {
        let duration = groups.iter().map(|g| g.duration()).sum();
        Self {
            converged,
            duration,
            groups,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

/// Execution result as printed by `run`
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub converged: bool,
    pub status: RunStatus,
    pub positions: NodePositions,
}

impl RunReport {
    pub fn new(converged: bool, outcome: RunOutcome) -> Self {
        let (status, positions) = match outcome {
            RunOutcome::Completed(p) => (RunStatus::Completed, p),
            RunOutcome::Cancelled(p) => (RunStatus::Cancelled, p),
        };
        Self {
            converged,
            status,
            positions,
        }
    }
}
