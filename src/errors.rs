//! Error kinds shared by every component of the driver.
//!
//! Errors local to one worker never cross into another worker; they are
//! logged and pushed onto the notification channel by whoever observes them.

use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum RoarmError {
    /// Serial open or I/O failure. Non-fatal, the operator has to reconnect.
    Connection(String),
    /// Malformed inbound or stored frame.
    ProtocolDecode(String),
    /// Parameter rejected before any state was touched.
    Validation(String),
    NoMissionSelected,
    UnknownMission(String),
    IndexOutOfRange { index: usize, len: usize },
    DuplicateName(String),
    RunAlreadyActive,
    /// Mission or schedule file could not be read or written.
    File(String),
    UnknownRobot(String),
    InvalidTimeFormat(String),
}

impl Error for RoarmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl fmt::Display for RoarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RoarmError::Connection(ref msg) => write!(f, "Connection error: {}", msg),
            RoarmError::ProtocolDecode(ref msg) => write!(f, "Could not decode frame: {}", msg),
            RoarmError::Validation(ref msg) => write!(f, "Invalid parameter: {}", msg),
            RoarmError::NoMissionSelected => write!(f, "No mission selected"),
            RoarmError::UnknownMission(ref name) => write!(f, "Mission '{}' does not exist", name),
            RoarmError::IndexOutOfRange { index, len } => {
                write!(f, "Step index {} out of range (mission has {} steps)", index, len)
            }
            RoarmError::DuplicateName(ref name) => write!(f, "Mission '{}' already exists", name),
            RoarmError::RunAlreadyActive => write!(f, "A mission run is already active"),
            RoarmError::File(ref msg) => write!(f, "File error: {}", msg),
            RoarmError::UnknownRobot(ref name) => write!(f, "Unknown robot: {}", name),
            RoarmError::InvalidTimeFormat(ref text) => {
                write!(f, "Invalid time '{}', expected HH:MM:SS AM/PM", text)
            }
        }
    }
}

impl From<std::io::Error> for RoarmError {
    fn from(e: std::io::Error) -> Self {
        RoarmError::File(e.to_string())
    }
}

impl From<serde_json::Error> for RoarmError {
    fn from(e: serde_json::Error) -> Self {
        RoarmError::File(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RoarmError>;
