// Junction speed rules and block construction for one leg
//
// A leg's entry speed is limited, per moving axis, by how that axis left the
// previous leg; its exit speed by how the axis enters the next one. Both are
// then capped by what the leg's acceleration can reach over its distance.

use tracing::debug;

use super::types::{Axis, Block, Move, SystemConstraints, EPSILON};
use super::PlanError;

/// How an axis crosses the junction between two legs
#[derive(Debug, Clone, Copy, PartialEq)]
enum Junction {
    /// The axis is idle on the other side, or the other side is at rest
    FromRest,
    /// Same direction on a corner: no single speed suits every axis
    Corner,
    /// Same direction and the legs are parallel, so speed can carry through
    Straight,
    Reversal,
}

fn junction(component: f64, other_component: f64, other_speed: f64, parallel: bool) -> Junction {
    if other_component.abs() < EPSILON || other_speed.abs() < EPSILON {
        Junction::FromRest
    } else if other_component * component > 0.0 {
        if parallel {
            Junction::Straight
        } else {
            Junction::Corner
        }
    } else {
        Junction::Reversal
    }
}

fn parallel(a: &Move, b: &Move) -> bool {
    Axis::ALL
        .into_iter()
        .all(|axis| (a.unit_vector[axis] - b.unit_vector[axis]).abs() < EPSILON)
}

/// Fastest path acceleration that keeps every moving axis within its limit
pub fn path_acceleration(m: &Move, constraints: &SystemConstraints) -> Result<f64, PlanError> {
    let mut acceleration = f64::INFINITY;
    for axis in Axis::ALL {
        let component = m.unit_vector[axis].abs();
        if component < EPSILON {
            continue;
        }
        let axis_constraints = constraints
            .get(&axis)
            .ok_or(PlanError::MissingConstraints(axis))?;
        acceleration = acceleration.min(axis_constraints.max_acceleration / component);
    }
    if acceleration.is_finite() {
        Ok(acceleration)
    } else {
        Ok(0.0)
    }
}

/// Speed this leg can start at, given the leg before it
pub fn find_initial_speed(
    constraints: &SystemConstraints,
    m: &Move,
    prev: Option<&Move>,
) -> Result<f64, PlanError> {
    let mut initial_speed = m.max_speed;

    for axis in Axis::ALL {
        let component = m.unit_vector[axis];
        if component.abs() < EPSILON {
            continue;
        }
        let limits = constraints
            .get(&axis)
            .ok_or(PlanError::MissingConstraints(axis))?;

        let (prev_component, prev_speed, straight) = prev
            .map(|p| (p.unit_vector[axis], p.final_speed(), parallel(p, m)))
            .unwrap_or((0.0, 0.0, false));

        let axis_limit = match junction(component, prev_component, prev_speed, straight) {
            Junction::FromRest | Junction::Corner => limits.max_speed_discontinuity,
            Junction::Straight => {
                let prev_axis_speed = (prev_speed * prev_component).abs();
                prev_axis_speed.max(limits.max_speed_discontinuity)
            }
            Junction::Reversal => limits.max_direction_change_speed_discontinuity,
        };
        let path_limit = axis_limit / component.abs();
        debug!("initial speed limit on {}: {} mm/s", axis, path_limit);
        initial_speed = initial_speed.min(path_limit);
    }

    Ok(initial_speed)
}

/// Speed this leg can finish at, given the leg after it
pub fn find_final_speed(
    constraints: &SystemConstraints,
    m: &Move,
    next: Option<&Move>,
) -> Result<f64, PlanError> {
    let mut final_speed = m.max_speed;

    for axis in Axis::ALL {
        let component = m.unit_vector[axis];
        if component.abs() < EPSILON {
            continue;
        }
        let limits = constraints
            .get(&axis)
            .ok_or(PlanError::MissingConstraints(axis))?;

        let (next_component, next_speed, straight) = next
            .map(|n| (n.unit_vector[axis], n.initial_speed(), parallel(m, n)))
            .unwrap_or((0.0, 0.0, false));

        let axis_limit = match junction(component, next_component, next_speed, straight) {
            Junction::FromRest | Junction::Corner => limits.max_speed_discontinuity,
            Junction::Straight => {
                let next_axis_speed = (next_speed * next_component).abs();
                next_axis_speed.max(limits.max_speed_discontinuity)
            }
            Junction::Reversal => limits.max_direction_change_speed_discontinuity,
        };
        let path_limit = axis_limit / component.abs();
        debug!("final speed limit on {}: {} mm/s", axis, path_limit);
        final_speed = final_speed.min(path_limit);
    }

    Ok(final_speed)
}

/// Fastest way to cover `distance` from `initial_speed` to `final_speed`
///
/// At most one acceleration phase, one coast at the peak speed, and one
/// deceleration phase. Callers must make sure the two end speeds are
/// reachable from each other over the distance.
pub fn build_blocks(
    initial_speed: f64,
    final_speed: f64,
    distance: f64,
    max_speed: f64,
    acceleration: f64,
) -> [Block; 3] {
    if distance < EPSILON || acceleration < EPSILON {
        return [Block::default(); 3];
    }

    let initial_sq = initial_speed * initial_speed;
    let final_sq = final_speed * final_speed;

    let achievable = (0.5 * (2.0 * acceleration * distance + initial_sq + final_sq)).sqrt();
    let peak = achievable.min(max_speed).max(initial_speed).max(final_speed);
    let peak_sq = peak * peak;

    let accel_distance = ((peak_sq - initial_sq) / (2.0 * acceleration)).max(0.0);
    let decel_distance = ((peak_sq - final_sq) / (2.0 * acceleration)).max(0.0);
    let coast_distance = (distance - accel_distance - decel_distance).max(0.0);

    debug!(
        "blocks: {} -> {} mm/s over {} mm at {} mm/s2, peak {} mm/s",
        initial_speed, final_speed, distance, acceleration, peak
    );

    [
        Block::new(accel_distance, initial_speed, acceleration),
        Block::new(coast_distance, peak, 0.0),
        Block::new(decel_distance, peak, -acceleration),
    ]
}

/// Re-plan one leg against its neighbours
pub fn build_move(
    m: &Move,
    prev: Option<&Move>,
    next: Option<&Move>,
    constraints: &SystemConstraints,
) -> Result<Move, PlanError> {
    if m.is_dummy() {
        return Ok(m.clone());
    }
    let acceleration = path_acceleration(m, constraints)?;
    let reach = 2.0 * acceleration * m.distance;

    let mut initial_speed = find_initial_speed(constraints, m, prev)?;
    let mut final_speed = find_final_speed(constraints, m, next)?;

    // The leg has to be able to slow down to its exit speed...
    initial_speed = initial_speed.min((final_speed * final_speed + reach).sqrt());
    // ...and to speed up to it
    final_speed = final_speed.min((initial_speed * initial_speed + reach).sqrt());

    let mut built = m.clone();
    built.blocks = build_blocks(
        initial_speed,
        final_speed,
        m.distance,
        m.max_speed,
        acceleration,
    );
    Ok(built)
}

/// Conservative plan for one leg: start and finish at rest
pub fn build_stopped_move(m: &Move, constraints: &SystemConstraints) -> Result<Move, PlanError> {
    if m.is_dummy() {
        return Ok(m.clone());
    }
    let acceleration = path_acceleration(m, constraints)?;
    let mut built = m.clone();
    built.blocks = build_blocks(0.0, 0.0, m.distance, m.max_speed, acceleration);
    Ok(built)
}

fn within(speed: f64, limit: f64) -> bool {
    speed <= limit + EPSILON
}

/// Whether the junction between two consecutive legs respects every axis
pub fn blended(constraints: &SystemConstraints, first: &Move, second: &Move) -> bool {
    if !first.blocks_complete() || !second.blocks_complete() {
        return false;
    }

    for axis in Axis::ALL {
        let first_component = first.unit_vector[axis];
        let second_component = second.unit_vector[axis];
        let exit = (first.final_speed() * first_component).abs();
        let entry = (second.initial_speed() * second_component).abs();

        let Some(limits) = constraints.get(&axis) else {
            if exit > EPSILON || entry > EPSILON {
                return false;
            }
            continue;
        };

        let at_rest = first.final_speed() < EPSILON || second.initial_speed() < EPSILON;
        let ok = if at_rest || first_component.abs() < EPSILON || second_component.abs() < EPSILON
        {
            // Axis idle or stopped on one side: the moving side has to stop or start within the jump limit
            within(exit, limits.max_speed_discontinuity)
                && within(entry, limits.max_speed_discontinuity)
        } else if first_component * second_component > 0.0 {
            let both_slow = within(exit, limits.max_speed_discontinuity)
                && within(entry, limits.max_speed_discontinuity);
            both_slow || (exit - entry).abs() < EPSILON.max(exit * 1e-9)
        } else {
            within(exit, limits.max_direction_change_speed_discontinuity)
                && within(entry, limits.max_direction_change_speed_discontinuity)
        };

        if !ok {
            debug!("junction not blended on {}: exit {} entry {}", axis, exit, entry);
            return false;
        }
    }
    true
}

pub fn all_blended(constraints: &SystemConstraints, moves: &[Move]) -> bool {
    moves
        .windows(2)
        .all(|pair| blended(constraints, &pair[0], &pair[1]))
}
