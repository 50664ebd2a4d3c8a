//! Frame encoders and decoders, one module per board concern.
//!
//! Every function here is pure: it turns a request into the exact bytes to
//! clock out, or a response into values. Bus access lives in [`crate::bus`].
//! All multi-byte fields are big-endian.

pub mod analog;
pub mod digital;
pub mod fsk;
pub mod pattern;
pub mod serial;
pub mod system;

use crate::config::{BoardKind, BoardSpec};
use crate::error::TransportError;

/// Leading opcode byte of each FPGA frame.
pub mod opcode {
    /// Read the board type id
    pub const TYPE_ID: u8 = 0x01;
    /// Drive the front-panel LEDs
    pub const LEDS: u8 = 0x02;
    /// Read the stack clock
    pub const GET_CLOCK: u8 = 0x03;
    /// Write the real-time clock
    pub const SET_RTC: u8 = 0x04;
    /// 16-bit digital block exchange
    pub const DIGITAL16: u8 = 0x10;
    /// Pattern generator bit pattern
    pub const PATTERN: u8 = 0x11;
    /// Pattern generator frequency and phase
    pub const FREQ: u8 = 0x12;
    /// Two pattern generators in one frame
    pub const FREQ_2CH: u8 = 0x13;
    /// Slave a pattern generator to another
    pub const SLAVE: u8 = 0x14;
    /// DAC write
    pub const ANALOG_OUT: u8 = 0x20;
    /// Eight-channel ADC capture
    pub const ANALOG_IN: u8 = 0x21;
    /// UART configuration
    pub const COM_CONFIG: u8 = 0x30;
    /// UART transmitter enable
    pub const COM_TX_ENABLE: u8 = 0x31;
    /// UART transmit
    pub const COM_WRITE: u8 = 0x32;
    /// UART receive
    pub const COM_READ: u8 = 0x33;
    /// FSK modem configuration
    pub const FSK_CONFIG: u8 = 0x40;
    /// FSK transmit
    pub const FSK_WRITE: u8 = 0x41;
    /// FSK stop
    pub const FSK_STOP: u8 = 0x42;
}

/// Frame format of a board, picked once when the channel map is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoardCodec {
    /// FPGA digital board: one 16-bit block frame carries outputs and inputs
    Digital16 {
        /// Outputs driven by pattern generators
        pattern_mask: u16,
    },
    /// Four port expanders, one 8-bit group per expander
    Expander32,
    /// FPGA analog board
    Analog {
        /// Volts an input must move before a change is published
        trigger_threshold: f64,
    },
    /// FPGA serial and FSK board
    Comms,
    /// Host header lines, no bus traffic
    HostLines,
}

impl BoardCodec {
    /// Codec for an inventory entry.
    pub fn for_board(spec: &BoardSpec) -> Self {
        match spec.kind {
            BoardKind::HsGpio32 => Self::Digital16 {
                pattern_mask: spec.pattern_mask(),
            },
            BoardKind::Gpio64 => Self::Expander32,
            BoardKind::HsAio12 => Self::Analog {
                trigger_threshold: spec.trigger_threshold(),
            },
            BoardKind::HsFskCom => Self::Comms,
            BoardKind::CpuRpi => Self::HostLines,
        }
    }

    /// Responses start with a status byte.
    pub fn checks_status(&self) -> bool {
        matches!(
            self,
            Self::Digital16 { .. } | Self::Analog { .. } | Self::Comms
        )
    }

    /// Width of the digital block, if the board has one.
    pub fn block_width(&self) -> Option<usize> {
        match self {
            Self::Digital16 { .. } => Some(digital::DIGITAL16_WIDTH),
            Self::Expander32 => Some(digital::EXPANDER32_WIDTH),
            _ => None,
        }
    }

    /// Board answers the common system frames (type id, LEDs, clock).
    pub fn has_system_frames(&self) -> bool {
        self.checks_status()
    }
}

/// Append a big-endian u32.
pub(crate) fn put_u32(frame: &mut Vec<u8>, value: u32) {
    frame.extend_from_slice(&value.to_be_bytes());
}

/// Big-endian u32 at `at`.
pub(crate) fn read_u32(response: &[u8], at: usize) -> Result<u32, TransportError> {
    let bytes = field(response, at, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Big-endian u16 at `at`.
pub(crate) fn read_u16(response: &[u8], at: usize) -> Result<u16, TransportError> {
    let bytes = field(response, at, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// `len` bytes at `at`, failing on a truncated response.
pub(crate) fn field(response: &[u8], at: usize, len: usize) -> Result<&[u8], TransportError> {
    response
        .get(at..at + len)
        .ok_or(TransportError::ShortResponse {
            expected: at + len,
            actual: response.len(),
        })
}
