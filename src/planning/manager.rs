// Move manager: iterative blending of a waypoint list into planned legs

use tracing::{debug, info, warn};

use super::blend::{all_blended, build_move, build_stopped_move};
use super::types::{Coordinates, Move, MoveTarget, SystemConstraints, MINIMUM_DISPLACEMENT};
use super::PlanError;
use crate::motion::encoder::MoveEncoder;
use crate::motion::steps::MoveGroups;

/// Iteration limit used when the caller has no better idea
pub const DEFAULT_ITERATION_LIMIT: u32 = 20;

/// Plans blended motion under a fixed set of axis constraints
#[derive(Debug, Clone)]
pub struct MoveManager {
    constraints: SystemConstraints,
}

impl MoveManager {
    pub fn new(constraints: SystemConstraints) -> Result<Self, PlanError> {
        for (axis, c) in &constraints {
            c.validate(*axis)?;
        }
        Ok(Self { constraints })
    }

    pub fn constraints(&self) -> &SystemConstraints {
        &self.constraints
    }

    /// Plan every leg from `origin` through `targets`
    ///
    /// Returns whether blending converged within `iteration_limit`. When it did
    /// not, the legs are returned as they stood after the last iteration and the
    /// caller decides whether to use them or fall back to [`plan_stopped`].
    ///
    /// [`plan_stopped`]: MoveManager::plan_stopped
    pub fn plan(
        &self,
        origin: Coordinates,
        targets: &[MoveTarget],
        iteration_limit: u32,
    ) -> Result<(bool, Vec<Move>), PlanError> {
        let legs = self.initial_moves(origin, targets)?;
        if legs.is_empty() {
            debug!("Nothing to plan");
            return Ok((true, legs));
        }

        // Stationary dummies on both ends so every real leg has two neighbours
        let last = legs[legs.len() - 1].end;
        let mut moves = Vec::with_capacity(legs.len() + 2);
        moves.push(Move::dummy(origin));
        moves.extend(legs);
        moves.push(Move::dummy(last));

        for iteration in 1..=iteration_limit {
            let mut rebuilt: Vec<Move> = Vec::with_capacity(moves.len());
            rebuilt.push(moves[0].clone());
            for i in 1..moves.len() - 1 {
                let built = build_move(&moves[i], rebuilt.last(), moves.get(i + 1), &self.constraints)?;
                rebuilt.push(built);
            }
            rebuilt.push(moves[moves.len() - 1].clone());

            let stable = rebuilt
                .iter()
                .zip(moves.iter())
                .all(|(new, old)| new.blocks_match(old));
            moves = rebuilt;

            if stable && all_blended(&self.constraints, &moves) {
                debug!("Blending converged after {} iterations", iteration);
                return Ok((true, strip_dummies(moves)));
            }
            debug!("Blending iteration {} not settled", iteration);
        }

        warn!(
            "Blending did not converge within {} iterations ({} legs)",
            iteration_limit,
            moves.len() - 2
        );
        Ok((false, strip_dummies(moves)))
    }

    /// Plan every leg to start and end at rest; always feasible
    pub fn plan_stopped(
        &self,
        origin: Coordinates,
        targets: &[MoveTarget],
    ) -> Result<Vec<Move>, PlanError> {
        self.initial_moves(origin, targets)?
            .iter()
            .map(|m| build_stopped_move(m, &self.constraints))
            .collect()
    }

    /// Plan and encode into move groups, one group per leg
    ///
    /// Falls back to the at-rest profile when blending does not converge; the
    /// returned flag still reports the non-convergence.
    pub fn plan_groups(
        &self,
        origin: Coordinates,
        targets: &[MoveTarget],
        iteration_limit: u32,
        encoder: &MoveEncoder,
    ) -> Result<(bool, MoveGroups), PlanError> {
        let (converged, moves) = self.plan(origin, targets, iteration_limit)?;
        let moves = if converged {
            moves
        } else {
            info!("Falling back to unblended profile");
            self.plan_stopped(origin, targets)?
        };
        let groups = encoder.encode_moves(&moves)?;
        Ok((converged, groups))
    }

    fn initial_moves(
        &self,
        origin: Coordinates,
        targets: &[MoveTarget],
    ) -> Result<Vec<Move>, PlanError> {
        if !origin.is_finite() {
            return Err(PlanError::InvalidOrigin);
        }

        let mut position = origin;
        let mut moves = Vec::with_capacity(targets.len());
        for (index, target) in targets.iter().enumerate() {
            if !target.position.is_finite() {
                return Err(PlanError::InvalidTarget {
                    index,
                    reason: "position is not finite".to_string(),
                });
            }
            if !(target.max_speed.is_finite() && target.max_speed > 0.0) {
                return Err(PlanError::InvalidTarget {
                    index,
                    reason: format!("speed {} must be positive", target.max_speed),
                });
            }
            if (target.position - position).norm() < MINIMUM_DISPLACEMENT {
                debug!("Dropping target {}: too close to the previous position", index);
                continue;
            }
            let m = Move::between(position, target);
            for axis in m.unit_vector.nonzero_axes() {
                if !self.constraints.contains_key(&axis) {
                    return Err(PlanError::MissingConstraints(axis));
                }
            }
            moves.push(m);
            position = target.position;
        }
        Ok(moves)
    }
}

fn strip_dummies(moves: Vec<Move>) -> Vec<Move> {
    let count = moves.len();
    moves
        .into_iter()
        .enumerate()
        .filter(|(i, _)| *i != 0 && *i != count - 1)
        .map(|(_, m)| m)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::types::{Axis, AxisConstraints, EPSILON};
    use proptest::prelude::*;

    fn xy_constraints(accel: f64, speed_dc: f64, dir_dc: f64) -> SystemConstraints {
        [Axis::X, Axis::Y, Axis::ZLeft]
            .into_iter()
            .map(|axis| (axis, AxisConstraints::new(accel, speed_dc, dir_dc)))
            .collect()
    }

    fn xy(x: f64, y: f64) -> Coordinates {
        Coordinates::from_pairs([(Axis::X, x), (Axis::Y, y)])
    }

    #[test]
    fn test_single_target_is_one_leg() {
        let manager = MoveManager::new(xy_constraints(1000.0, 100.0, 10.0)).unwrap();
        let (converged, moves) = manager
            .plan(xy(0.0, 0.0), &[MoveTarget::new(xy(100.0, 0.0), 100.0)], 10)
            .unwrap();
        assert!(converged);
        assert_eq!(moves.len(), 1);
        // Allowed to start and stop at 100 mm/s, so the whole leg is a coast
        assert!((moves[0].duration() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_collinear_legs_carry_speed_through() {
        let manager = MoveManager::new(xy_constraints(1000.0, 5.0, 1.0)).unwrap();
        let targets = [
            MoveTarget::new(xy(100.0, 0.0), 100.0),
            MoveTarget::new(xy(200.0, 0.0), 100.0),
        ];
        let (converged, moves) = manager.plan(xy(0.0, 0.0), &targets, 20).unwrap();
        assert!(converged);
        assert_eq!(moves.len(), 2);
        assert!((moves[0].final_speed() - 100.0).abs() < 1e-6);
        assert!((moves[1].initial_speed() - 100.0).abs() < 1e-6);
        assert!(moves[1].final_speed() <= 5.0 + EPSILON);
    }

    #[test]
    fn test_reversal_slows_to_direction_change_limit() {
        let manager = MoveManager::new(xy_constraints(1000.0, 20.0, 2.0)).unwrap();
        let targets = [
            MoveTarget::new(xy(50.0, 0.0), 100.0),
            MoveTarget::new(xy(0.0, 0.0), 100.0),
        ];
        let (converged, moves) = manager.plan(xy(0.0, 0.0), &targets, 20).unwrap();
        assert!(converged);
        assert!(moves[0].final_speed() <= 2.0 + EPSILON);
        assert!(moves[1].initial_speed() <= 2.0 + EPSILON);
    }

    #[test]
    fn test_close_targets_are_dropped() {
        let manager = MoveManager::new(xy_constraints(1000.0, 20.0, 2.0)).unwrap();
        let targets = [
            MoveTarget::new(xy(0.01, 0.0), 100.0),
            MoveTarget::new(xy(10.0, 0.0), 100.0),
            MoveTarget::new(xy(10.0, 0.02), 100.0),
        ];
        let (_, moves) = manager.plan(xy(0.0, 0.0), &targets, 20).unwrap();
        assert_eq!(moves.len(), 1);
    }

    #[test]
    fn test_zero_iteration_limit_reports_non_convergence() {
        let manager = MoveManager::new(xy_constraints(1000.0, 20.0, 2.0)).unwrap();
        let (converged, _) = manager
            .plan(xy(0.0, 0.0), &[MoveTarget::new(xy(10.0, 0.0), 100.0)], 0)
            .unwrap();
        assert!(!converged);
    }

    #[test]
    fn test_bad_speed_is_rejected() {
        let manager = MoveManager::new(xy_constraints(1000.0, 20.0, 2.0)).unwrap();
        let result = manager.plan(xy(0.0, 0.0), &[MoveTarget::new(xy(10.0, 0.0), 0.0)], 5);
        assert!(matches!(result, Err(PlanError::InvalidTarget { index: 0, .. })));
    }

    #[test]
    fn test_stopped_plan_starts_and_ends_at_rest() {
        let manager = MoveManager::new(xy_constraints(500.0, 20.0, 2.0)).unwrap();
        let targets = [
            MoveTarget::new(xy(10.0, 0.0), 100.0),
            MoveTarget::new(xy(10.0, 30.0), 50.0),
        ];
        let moves = manager.plan_stopped(xy(0.0, 0.0), &targets).unwrap();
        for m in &moves {
            assert_eq!(m.initial_speed(), 0.0);
            assert!(m.final_speed() < 1e-6);
        }
    }

    fn arb_constraints() -> impl Strategy<Value = AxisConstraints> {
        (100.0f64..5000.0, 1.0f64..100.0, 0.0f64..1.0).prop_map(|(accel, speed_dc, ratio)| {
            // direction change strictly tighter than the speed discontinuity
            AxisConstraints::new(accel, speed_dc, speed_dc * ratio * 0.99)
        })
    }

    fn arb_path() -> impl Strategy<Value = Vec<(f64, f64, f64, f64)>> {
        prop::collection::vec(
            (-200.0f64..200.0, -200.0f64..200.0, -50.0f64..50.0, 5.0f64..500.0),
            1..6,
        )
    }

    proptest! {
        #[test]
        fn prop_blending_converges(
            cx in arb_constraints(),
            cy in arb_constraints(),
            cz in arb_constraints(),
            path in arb_path(),
        ) {
            let constraints: SystemConstraints =
                [(Axis::X, cx), (Axis::Y, cy), (Axis::ZLeft, cz)].into_iter().collect();
            let manager = MoveManager::new(constraints).unwrap();

            let origin = Coordinates::zero();
            let mut previous = origin;
            let mut targets = Vec::new();
            for (x, y, z, speed) in path {
                let position = Coordinates::from_pairs([(Axis::X, x), (Axis::Y, y), (Axis::ZLeft, z)]);
                let far_enough = position.iter()
                    .zip(previous.iter())
                    .any(|((_, a), (_, b))| (a - b).abs() > 1.0);
                if far_enough {
                    targets.push(MoveTarget::new(position, speed));
                    previous = position;
                }
            }

            let (converged, moves) = manager.plan(origin, &targets, DEFAULT_ITERATION_LIMIT).unwrap();
            prop_assert!(converged);
            prop_assert_eq!(moves.len(), targets.len());

            for m in &moves {
                for index in 0..3 {
                    for axis in Axis::ALL {
                        let b = m.axis_block(axis, index);
                        let t = b.duration;
                        let tolerance = 1e-6 * (1.0 + b.distance.abs());
                        prop_assert!(
                            (b.distance - (b.initial_speed * t + 0.5 * b.acceleration * t * t)).abs() < tolerance
                        );
                        if t > 0.0 {
                            prop_assert!(
                                (b.final_speed - (b.initial_speed + b.acceleration * t)).abs() < 1e-6 * (1.0 + b.final_speed.abs())
                            );
                        }
                    }
                }
            }
        }
    }
}
