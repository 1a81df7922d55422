/// RoArm driver library
///
/// Serial link, mission model, execution engine, jog and scheduler for one or
/// more arm controllers speaking the newline JSON protocol.

pub mod config_loader;
pub mod device_link;
pub mod errors;
pub mod executor;
pub mod frame;
pub mod jog;
pub mod mission;
pub mod notifications;
pub mod pose;
pub mod robot;
pub mod scheduler;
pub mod step;

pub use errors::{Result, RoarmError};
