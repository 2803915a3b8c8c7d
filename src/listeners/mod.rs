// Background listeners that track node-reported state

pub mod motor_enable;
pub mod tip_presence;

pub use motor_enable::MotorEnableControl;
pub use tip_presence::{SensorId, TipPresenceManager, TipState, TipSubscription};
