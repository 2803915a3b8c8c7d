// Bus layer: addressing, message codec, transports and the messenger

pub mod arbitration;
pub mod driver;
pub mod loopback;
pub mod messages;
pub mod messenger;
pub mod serial;
pub mod zenoh;

pub use arbitration::{ArbitrationId, FunctionCode, NodeId};
pub use driver::{BusError, BusFrame, FrameReader, FrameWriter};
pub use messages::{ErrorCode, ErrorSeverity, Message, MessageBody, MessageId};
pub use messenger::{AckOutcome, BusMessenger, Incoming, MessengerConfig, Subscription};
