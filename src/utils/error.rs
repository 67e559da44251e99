use thiserror::Error;

/// Error taxonomy for the bus core.
///
/// `BusBusy` and `Timeout` are retryable by the caller; `InvalidResponse` and
/// `Exception` are failed reads that upstream callers treat the same way;
/// `UnsupportedType` is a configuration-level problem; `NotFound` means
/// "nothing to do", not "something went wrong".
#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus busy: could not acquire exclusive access in time")]
    BusBusy,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("modbus exception 0x{0:02X}")]
    Exception(u8),

    #[error("no driver for sensor type '{0}'")]
    UnsupportedType(String),

    #[error("not found")]
    NotFound,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BusError {
    /// Numeric code used by the `ERR=<code>` sentinel payload written to
    /// storage when a sensor read fails.
    pub fn code(&self) -> u16 {
        match self {
            BusError::BusBusy => 1,
            BusError::Timeout => 2,
            BusError::InvalidResponse(_) => 3,
            BusError::Exception(_) => 4,
            BusError::UnsupportedType(_) => 5,
            BusError::NotFound => 6,
            BusError::Connection(_) => 7,
            BusError::Storage(_) => 8,
            BusError::Config(_) => 9,
        }
    }
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => BusError::Timeout,
            _ => BusError::Connection(format!("IO error: {}", err)),
        }
    }
}

impl From<tokio::time::error::Elapsed> for BusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BusError::Timeout
    }
}
