use thiserror::Error;

/// Modem transport errors
///
/// Only opening the port can fail with an error; every AT exchange after that
/// reports success as a boolean plus the raw response.
#[derive(Debug, Error)]
pub enum ModemError {
    #[error("Failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// GPIO driver errors
#[derive(Debug, Error)]
pub enum GpioError {
    #[error("GPIO {pin} {op} failed: {reason}")]
    Access {
        pin: u32,
        op: &'static str,
        reason: String,
    },

    #[error("GPIO unavailable: {0}")]
    Unavailable(String),
}
