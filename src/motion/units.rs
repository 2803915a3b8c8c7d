// Physical units <-> firmware fixed point
//
// Velocities and accelerations travel as Q1.31 fractions of a millimetre per
// interrupt tick; durations as tick counts. Casts truncate and saturate.

use crate::config::{BRUSHED_MOTOR_INTERRUPTS_PER_SEC, INTERRUPTS_PER_SEC, TIP_INTERRUPTS_PER_SEC};

const Q31: f64 = (1u64 << 31) as f64;

/// Which motor timer a step runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorClock {
    Stepper,
    Tip,
    Brushed,
}

impl MotorClock {
    pub fn interrupts_per_sec(self) -> u32 {
        match self {
            MotorClock::Stepper => INTERRUPTS_PER_SEC,
            MotorClock::Tip => TIP_INTERRUPTS_PER_SEC,
            MotorClock::Brushed => BRUSHED_MOTOR_INTERRUPTS_PER_SEC,
        }
    }
}

/// mm/s -> mm/tick, Q1.31
pub fn velocity_to_wire(mm_per_sec: f64, clock: MotorClock) -> i32 {
    let ips = f64::from(clock.interrupts_per_sec());
    (mm_per_sec / ips * Q31) as i32
}

pub fn velocity_from_wire(raw: i32, clock: MotorClock) -> f64 {
    let ips = f64::from(clock.interrupts_per_sec());
    f64::from(raw) / Q31 * ips
}

/// mm/s^2 -> um/tick^2, Q1.31
pub fn acceleration_to_wire(mm_per_sec_sq: f64, clock: MotorClock) -> i32 {
    let ips = f64::from(clock.interrupts_per_sec());
    (mm_per_sec_sq * 1000.0 / (ips * ips) * Q31) as i32
}

pub fn acceleration_from_wire(raw: i32, clock: MotorClock) -> f64 {
    let ips = f64::from(clock.interrupts_per_sec());
    f64::from(raw) / Q31 * ips * ips / 1000.0
}

/// Seconds -> ticks
pub fn duration_to_wire(seconds: f64, clock: MotorClock) -> u32 {
    (seconds * f64::from(clock.interrupts_per_sec())) as u32
}

pub fn duration_from_wire(ticks: u32, clock: MotorClock) -> f64 {
    f64::from(ticks) / f64::from(clock.interrupts_per_sec())
}

/// Distance a fixed-point step covers, as the node will execute it
pub fn wire_distance(velocity: i32, acceleration: i32, duration: u32, clock: MotorClock) -> f64 {
    let v = velocity_from_wire(velocity, clock);
    let a = acceleration_from_wire(acceleration, clock);
    let t = duration_from_wire(duration, clock);
    v * t + 0.5 * a * t * t
}

/// mm -> um, rounded
pub fn mm_to_um(mm: f64) -> i32 {
    (mm * 1000.0).round() as i32
}

pub fn um_to_mm(um: i64) -> f64 {
    um as f64 / 1000.0
}
