//! Defines the error type used throughout the pool control system.
//!
//! Authors of new components should map their failures into one of
//! these variants. If none fits, add a new one -- but keep it general
//! enough to be useful outside a single component (don't add, say, a
//! variant specific to one storage backend; use `StoreUnavailable` and
//! put the detail in the associated string).

use std::fmt;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// An automatic command was rejected because the actuator is
    /// latched in an emergency stop.
    EmergencyStop,

    /// An automatic command was rejected because the actuator's mode
    /// flag has been cleared by a prior manual command.
    ManualMode,

    /// The hardware board failed to initialize. Fatal at startup.
    BoardInit(String),

    /// The boot configuration file could not be parsed. Fatal at
    /// startup.
    Config(String),

    /// The persistent document store could not be reached. Callers
    /// must swallow this and keep running on in-memory state.
    StoreUnavailable(String),

    /// The light-control network link could not be reached.
    NetUnavailable(String),

    /// The requested resource (a collection row, a config section)
    /// doesn't exist.
    NotFound,

    /// A value couldn't be converted to the type a caller expected.
    TypeError,

    /// Reported when the peer of a communication channel has closed
    /// its handle.
    MissingPeer(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::EmergencyStop => write!(f, "actuator is in emergency stop"),
            Error::ManualMode => write!(f, "actuator is under manual control"),
            Error::BoardInit(v) => write!(f, "board initialization failed: {}", v),
            Error::Config(v) => write!(f, "configuration error: {}", v),
            Error::StoreUnavailable(v) => write!(f, "store unavailable: {}", v),
            Error::NetUnavailable(v) => write!(f, "network unavailable: {}", v),
            Error::NotFound => write!(f, "item not found"),
            Error::TypeError => write!(f, "incorrect type"),
            Error::MissingPeer(v) => write!(f, "{} is missing peer", v),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_error: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::MissingPeer(String::from("request channel is closed"))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_error: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::MissingPeer(String::from("request dropped"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
