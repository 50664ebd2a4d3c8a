//! Error types for stack operations.
//!
//! Failures are split the same way the hardware splits them:
//!
//! - **`Config`**: the inventory is malformed, or a caller asked for something the
//!   inventory cannot satisfy (unknown channel, writing an input, a COM operation on a
//!   digital channel). Reported synchronously and never retried.
//! - **`Transport`**: the raw bus transfer or a line toggle failed. The whole logical
//!   operation fails, but chip-select is always released first.
//!
//! Protocol anomalies (status-byte flags, baud-rate deviation, tick overflow) are not
//! errors. They are described by [`ProtocolWarning`], logged at `warn` level, and the
//! operation carries on with a safe fallback.

use thiserror::Error;

use crate::channel::ChannelKind;

/// Result type alias for stack operations.
pub type Result<T> = std::result::Result<T, TioError>;

/// Top-level error for every logical stack operation.
#[derive(Error, Debug)]
pub enum TioError {
    /// Inventory or request does not match the configured stack
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The bus transfer or a GPIO line operation failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl TioError {
    /// Check if this is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if this is a transport error.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Configuration errors: malformed inventory or a request the inventory cannot serve.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The inventory document could not be read or parsed
    #[error("Failed to load inventory: {message}")]
    Load { message: String },

    /// A board entry failed validation
    #[error("Invalid board '{board}': {message}")]
    InvalidBoard { board: String, message: String },

    /// Two boards share the same identifier
    #[error("Duplicate board id '{0}'")]
    DuplicateBoard(String),

    /// Two boards share the same bus address
    #[error("Duplicate bus address '{0}'")]
    DuplicateBusAddress(String),

    /// Stack-wide settings are inconsistent
    #[error("Invalid stack settings: {0}")]
    InvalidSettings(String),

    /// A header pin has no GPIO line behind it
    #[error("Header pin {0} is not a GPIO line")]
    UnknownPin(u8),

    /// No channel with this name exists
    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    /// No board with this id exists
    #[error("Unknown board '{0}'")]
    UnknownBoard(String),

    /// The operation does not apply to this channel's kind
    #[error("Channel '{name}' is {actual}, operation requires {expected}")]
    WrongChannelKind {
        name: String,
        expected: ChannelKind,
        actual: ChannelKind,
    },

    /// The operation does not apply to this board kind
    #[error("Board '{board}' does not support {operation}")]
    UnsupportedOperation { board: String, operation: String },

    /// Channel is not driven by a pattern generator
    #[error("Channel '{0}' has no pattern generator")]
    NoPatternGenerator(String),

    /// Payload does not fit the frame's length field
    #[error("Payload of {len} bytes exceeds frame limit of {max}")]
    PayloadTooLong { len: usize, max: usize },

    /// A block value has the wrong number of bits
    #[error("Block value has {actual} bits, board expects {expected}")]
    BlockWidth { expected: usize, actual: usize },

    /// A requested parameter is outside what the hardware accepts
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Load {
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        Self::Load {
            message: err.to_string(),
        }
    }
}

/// Failures reported by the external bus transport or GPIO line provider.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The SPI transfer itself failed
    #[error("SPI transfer failed: {0}")]
    Transfer(String),

    /// Response length differs from the request length
    #[error("SPI response has {actual} bytes, expected {expected}")]
    ShortResponse { expected: usize, actual: usize },

    /// A GPIO line could not be claimed, driven or read
    #[error("GPIO line {pin} failed: {message}")]
    Line { pin: u8, message: String },

    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-fatal protocol anomalies. Logged, never propagated.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolWarning {
    /// Low nibble of the status byte is not the expected device id
    DeviceIdMismatch { board: String, expected: u8, actual: u8 },
    /// Board reports it has not been reset since power-up
    NotResetSincePowerUp { board: String },
    /// Board rejected the previous command
    LastCommandInvalid { board: String },
    /// Board did not finish the previous command
    LastCommandIncomplete { board: String },
    /// Synthesized baud rate is off by more than the configured tolerance
    BaudDeviation {
        requested: u32,
        actual: f64,
        deviation: f64,
    },
    /// Baud divisor had to be clamped into the register range
    DivisorClamped { requested: u32 },
    /// Scheduled time could not be expressed as a tick; executed immediately instead
    TickOverflow { delta_ms: i64 },
    /// Scheduled time given before the stack clock was ever reset
    ClockNotReset,
}

impl std::fmt::Display for ProtocolWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceIdMismatch {
                board,
                expected,
                actual,
            } => write!(
                f,
                "{board}: device id {actual:#03x} does not match expected {expected:#03x}"
            ),
            Self::NotResetSincePowerUp { board } => {
                write!(f, "{board}: board not reset since power-up")
            }
            Self::LastCommandInvalid { board } => write!(f, "{board}: last command invalid"),
            Self::LastCommandIncomplete { board } => {
                write!(f, "{board}: last command incomplete")
            }
            Self::BaudDeviation {
                requested,
                actual,
                deviation,
            } => write!(
                f,
                "baud rate {requested} synthesized as {actual:.1} ({:.2}% off)",
                deviation * 100.0
            ),
            Self::DivisorClamped { requested } => {
                write!(f, "baud rate {requested} outside divisor range, clamped")
            }
            Self::TickOverflow { delta_ms } => write!(
                f,
                "scheduled offset {delta_ms} ms does not fit the tick field, executing immediately"
            ),
            Self::ClockNotReset => write!(
                f,
                "stack clock never reset, delayed command executes immediately"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TioError::from(ConfigError::WrongChannelKind {
            name: "DI03".into(),
            expected: ChannelKind::DigitalOut,
            actual: ChannelKind::DigitalIn,
        });
        assert!(err.to_string().contains("DI03"));
        assert!(err.is_configuration());
        assert!(!err.is_transport());
    }

    #[test]
    fn test_transport_classification() {
        let err = TioError::from(TransportError::Transfer("EIO".into()));
        assert!(err.is_transport());
        assert!(err.to_string().contains("EIO"));
    }

    #[test]
    fn test_warning_display() {
        let warning = ProtocolWarning::DeviceIdMismatch {
            board: "AIO12-1".into(),
            expected: 0x0A,
            actual: 0x03,
        };
        assert!(warning.to_string().contains("AIO12-1"));
        assert!(warning.to_string().contains("0xa"));
    }
}
