// Geometry primitives for the trajectory planner
//
// Axes, coordinate vectors, per-axis constraints, and the path-level blocks
// that make up one planned leg.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Index, Sub};

use serde::{Deserialize, Serialize};

use super::PlanError;

/// Numerical tolerance used for every comparison in the planner
pub const EPSILON: f64 = 1e-6;

/// Consecutive targets closer than this (mm) are dropped before planning
pub const MINIMUM_DISPLACEMENT: f64 = 0.05;

/// A degree of freedom on the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    ZLeft,
    ZRight,
    PlungerLeft,
    PlungerRight,
    GripperJaw,
    GripperZ,
    TipAction,
}

impl Axis {
    pub const COUNT: usize = 9;

    pub const ALL: [Axis; Axis::COUNT] = [
        Axis::X,
        Axis::Y,
        Axis::ZLeft,
        Axis::ZRight,
        Axis::PlungerLeft,
        Axis::PlungerRight,
        Axis::GripperJaw,
        Axis::GripperZ,
        Axis::TipAction,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::ZLeft => "Z_L",
            Axis::ZRight => "Z_R",
            Axis::PlungerLeft => "P_L",
            Axis::PlungerRight => "P_R",
            Axis::GripperJaw => "G",
            Axis::GripperZ => "Z_G",
            Axis::TipAction => "Q",
        };
        f.write_str(name)
    }
}

/// Absolute position of every axis, in mm
///
/// Serializes as a map so requests only need to name the axes they use;
/// missing axes are zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Coordinates {
    values: [f64; Axis::COUNT],
}

impl Coordinates {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Build from (axis, value) pairs; unspecified axes are zero
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Axis, f64)>) -> Self {
        let mut values = [0.0; Axis::COUNT];
        for (axis, value) in pairs {
            values[axis.index()] = value;
        }
        Self { values }
    }

    /// Copy with one axis replaced
    pub fn with(mut self, axis: Axis, value: f64) -> Self {
        self.values[axis.index()] = value;
        self
    }

    pub fn norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self {
            values: self.values.map(|v| v * factor),
        }
    }

    /// Axes with a component larger than EPSILON in magnitude
    pub fn nonzero_axes(&self) -> impl Iterator<Item = Axis> + '_ {
        Axis::ALL
            .into_iter()
            .filter(|&axis| self[axis].abs() > EPSILON)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Axis, f64)> + '_ {
        Axis::ALL.into_iter().map(|axis| (axis, self[axis]))
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

impl Index<Axis> for Coordinates {
    type Output = f64;

    fn index(&self, axis: Axis) -> &f64 {
        &self.values[axis.index()]
    }
}

impl Add for Coordinates {
    type Output = Coordinates;

    fn add(self, rhs: Coordinates) -> Coordinates {
        let mut values = self.values;
        for (v, r) in values.iter_mut().zip(rhs.values) {
            *v += r;
        }
        Coordinates { values }
    }
}

impl Sub for Coordinates {
    type Output = Coordinates;

    fn sub(self, rhs: Coordinates) -> Coordinates {
        let mut values = self.values;
        for (v, r) in values.iter_mut().zip(rhs.values) {
            *v -= r;
        }
        Coordinates { values }
    }
}

impl Serialize for Coordinates {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let map: BTreeMap<Axis, f64> = self.iter().filter(|(_, v)| *v != 0.0).collect();
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Coordinates {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<Axis, f64>::deserialize(deserializer)?;
        Ok(Coordinates::from_pairs(map))
    }
}

/// Physical limits of one axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisConstraints {
    /// mm/s^2
    pub max_acceleration: f64,
    /// Largest speed jump (mm/s) the axis tolerates at a waypoint
    pub max_speed_discontinuity: f64,
    /// Largest speed jump (mm/s) the axis tolerates when it reverses
    pub max_direction_change_speed_discontinuity: f64,
}

impl AxisConstraints {
    pub fn new(
        max_acceleration: f64,
        max_speed_discontinuity: f64,
        max_direction_change_speed_discontinuity: f64,
    ) -> Self {
        Self {
            max_acceleration,
            max_speed_discontinuity,
            max_direction_change_speed_discontinuity,
        }
    }

    /// Check the direction-change limit is no looser than the speed limit
    pub fn validate(&self, axis: Axis) -> Result<(), PlanError> {
        let finite = self.max_acceleration.is_finite()
            && self.max_speed_discontinuity.is_finite()
            && self.max_direction_change_speed_discontinuity.is_finite();
        if !finite
            || self.max_acceleration <= 0.0
            || self.max_speed_discontinuity < 0.0
            || self.max_direction_change_speed_discontinuity < 0.0
        {
            return Err(PlanError::InvalidConstraints {
                axis,
                reason: "limits must be finite, acceleration positive".to_string(),
            });
        }
        if self.max_direction_change_speed_discontinuity > self.max_speed_discontinuity {
            return Err(PlanError::InvalidConstraints {
                axis,
                reason: format!(
                    "direction change discontinuity {} exceeds speed discontinuity {}",
                    self.max_direction_change_speed_discontinuity, self.max_speed_discontinuity
                ),
            });
        }
        Ok(())
    }
}

pub type SystemConstraints = BTreeMap<Axis, AxisConstraints>;

/// A waypoint and the fastest speed allowed on the way there
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveTarget {
    pub position: Coordinates,
    /// mm/s along the path
    pub max_speed: f64,
}

impl MoveTarget {
    pub fn new(position: Coordinates, max_speed: f64) -> Self {
        Self {
            position,
            max_speed,
        }
    }
}

/// Constant-acceleration segment of a move, measured along the path
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    pub distance: f64,
    pub initial_speed: f64,
    pub acceleration: f64,
}

impl Block {
    pub fn new(distance: f64, initial_speed: f64, acceleration: f64) -> Self {
        Self {
            distance,
            initial_speed,
            acceleration,
        }
    }

    pub fn final_speed(&self) -> f64 {
        // v_f^2 = v_i^2 + 2as
        let sq = self.initial_speed * self.initial_speed + 2.0 * self.acceleration * self.distance;
        // rounding leftovers from decelerating to a stop
        if sq < 1e-9 { 0.0 } else { sq.sqrt() }
    }

    /// Seconds to cover the block
    pub fn time(&self) -> f64 {
        if self.distance.abs() < EPSILON {
            return 0.0;
        }
        if self.acceleration.abs() < EPSILON {
            if self.initial_speed.abs() < EPSILON {
                return 0.0;
            }
            return self.distance / self.initial_speed;
        }
        (self.final_speed() - self.initial_speed) / self.acceleration
    }

    fn approx_eq(&self, other: &Block) -> bool {
        (self.distance - other.distance).abs() < EPSILON
            && (self.initial_speed - other.initial_speed).abs() < EPSILON
            && (self.acceleration - other.acceleration).abs() < EPSILON
    }
}

/// One block projected onto a single axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AxisBlock {
    pub distance: f64,
    pub duration: f64,
    pub initial_speed: f64,
    pub final_speed: f64,
    pub acceleration: f64,
}

/// One planned leg: straight line from `start` to `end`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Move {
    pub start: Coordinates,
    pub end: Coordinates,
    pub unit_vector: Coordinates,
    pub distance: f64,
    pub max_speed: f64,
    /// accelerate, coast, decelerate
    pub blocks: [Block; 3],
}

impl Move {
    /// Unplanned leg: runs at its requested speed throughout
    pub fn between(start: Coordinates, target: &MoveTarget) -> Self {
        let displacement = target.position - start;
        let distance = displacement.norm();
        let unit_vector = if distance > 0.0 {
            displacement.scale(1.0 / distance)
        } else {
            Coordinates::zero()
        };
        let cruise = Block::new(0.0, target.max_speed, 0.0);
        Self {
            start,
            end: target.position,
            unit_vector,
            distance,
            max_speed: target.max_speed,
            blocks: [cruise; 3],
        }
    }

    /// Stationary placeholder bracketing the real legs
    pub fn dummy(at: Coordinates) -> Self {
        Self {
            start: at,
            end: at,
            unit_vector: Coordinates::zero(),
            distance: 0.0,
            max_speed: 0.0,
            blocks: [Block::default(); 3],
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.distance < EPSILON
    }

    pub fn initial_speed(&self) -> f64 {
        self.blocks[0].initial_speed
    }

    pub fn final_speed(&self) -> f64 {
        self.blocks[2].final_speed()
    }

    pub fn duration(&self) -> f64 {
        self.blocks.iter().map(Block::time).sum()
    }

    /// Whether this axis moves at all during the leg
    pub fn moves_axis(&self, axis: Axis) -> bool {
        self.unit_vector[axis].abs() > EPSILON
    }

    /// Per-axis view of block `index`
    pub fn axis_block(&self, axis: Axis, index: usize) -> AxisBlock {
        let block = &self.blocks[index];
        let component = self.unit_vector[axis];
        AxisBlock {
            distance: block.distance * component,
            duration: block.time(),
            initial_speed: block.initial_speed * component,
            final_speed: block.final_speed() * component,
            acceleration: block.acceleration * component,
        }
    }

    pub(crate) fn blocks_match(&self, other: &Move) -> bool {
        self.blocks
            .iter()
            .zip(other.blocks.iter())
            .all(|(a, b)| a.approx_eq(b))
    }

    /// Whether the blocks add up to the full leg distance
    pub(crate) fn blocks_complete(&self) -> bool {
        let total: f64 = self.blocks.iter().map(|b| b.distance).sum();
        (total - self.distance).abs() < EPSILON.max(self.distance * 1e-9)
    }
}
