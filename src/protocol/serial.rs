//! HS-FSKCOM serial port frames.
//!
//! The UARTs are XR16M890-style: the line control register packs data
//! length, stop bits and parity, and the baud divisor has a 16-bit integer
//! part (DLM:DLL) plus a 4-bit fraction in DLD. DLD also selects 8x or 4x
//! sampling when 16x cannot reach the requested rate.

use tracing::warn;

use crate::config::{Parity, SerialParams};
use crate::error::{ConfigError, ProtocolWarning, TransportError};
use crate::protocol::{field, opcode, put_u32};

/// Longest payload of one write or read frame.
pub const COM_MAX_PAYLOAD: usize = 32;

/// Length of a configuration frame.
pub const COM_CONFIG_FRAME_LEN: usize = 7;

/// Length of a read frame.
pub const COM_READ_FRAME_LEN: usize = 3 + COM_MAX_PAYLOAD;

/// Line control register bits.
pub mod lcr {
    /// Two stop bits
    pub const STOP_BITS_2: u8 = 0b0000_0100;
    /// Parity enabled
    pub const PARITY_ENABLE: u8 = 0b0000_1000;
    /// Even parity (with parity enabled)
    pub const PARITY_EVEN: u8 = 0b0001_0000;
}

/// Sampling mode bits of DLD.
pub mod dld {
    /// Fractional divisor bits
    pub const FRACTION_MASK: u8 = 0x0F;
    /// 8x sampling
    pub const SAMPLING_8X: u8 = 0x10;
    /// 4x sampling
    pub const SAMPLING_4X: u8 = 0x20;
}

/// Oversampling multipliers tried in order: 16x, 8x, 4x sampling.
const MULTIPLIERS: [u32; 3] = [1, 2, 4];

/// Resolved divisor registers for one baud rate.
#[derive(Debug, Clone, PartialEq)]
pub struct BaudSynthesis {
    /// Requested baud rate
    pub requested: u32,
    /// Oversampling multiplier used (1, 2 or 4)
    pub multiplier: u32,
    /// Integer divisor, 1..=0xFFFF
    pub divisor: u16,
    /// Fractional divisor in sixteenths
    pub fraction: u8,
    /// Baud rate the registers actually produce
    pub actual: f64,
    /// Relative error against the request
    pub deviation: f64,
    /// Anomalies found while synthesizing
    pub warnings: Vec<ProtocolWarning>,
}

impl BaudSynthesis {
    /// DLM register.
    pub fn dlm(&self) -> u8 {
        (self.divisor >> 8) as u8
    }

    /// DLL register.
    pub fn dll(&self) -> u8 {
        (self.divisor & 0xFF) as u8
    }

    /// DLD register: fraction plus sampling mode.
    pub fn dld(&self) -> u8 {
        let mode = match self.multiplier {
            2 => dld::SAMPLING_8X,
            4 => dld::SAMPLING_4X,
            _ => 0,
        };
        (self.fraction & dld::FRACTION_MASK) | mode
    }
}

/// Find divisor registers for `baud` from a `clock_hz` UART clock.
///
/// The first multiplier giving a divisor of at least one wins. Out-of-range
/// divisors are clamped and deviations above `tolerance` are flagged; both
/// are logged, neither fails.
pub fn synthesize_baud(baud: u32, clock_hz: u32, tolerance: f64) -> BaudSynthesis {
    let mut warnings = Vec::new();
    let clock = f64::from(clock_hz);
    let requested = f64::from(baud.max(1));

    let (multiplier, mut div) = MULTIPLIERS
        .iter()
        .map(|m| (*m, clock / (requested * 16.0 / f64::from(*m))))
        .find(|(_, div)| *div >= 1.0)
        .unwrap_or((4, 1.0));

    if div > f64::from(u16::MAX) || clock / (requested * 4.0) < 1.0 {
        warnings.push(ProtocolWarning::DivisorClamped { requested: baud });
        div = div.clamp(1.0, f64::from(u16::MAX));
    }

    let mut divisor = div.trunc() as u32;
    let mut fraction = ((div - div.trunc()) * 16.0).round() as u32;
    if fraction >= 16 {
        divisor += 1;
        fraction = 0;
    }
    if divisor > u32::from(u16::MAX) {
        divisor = u32::from(u16::MAX);
        fraction = 0;
    }

    let sampling = 16.0 / f64::from(multiplier);
    let effective = f64::from(divisor) + f64::from(fraction) / 16.0;
    let actual = clock / (sampling * effective);
    let deviation = (actual - requested).abs() / requested;

    if deviation > tolerance {
        warnings.push(ProtocolWarning::BaudDeviation {
            requested: baud,
            actual,
            deviation,
        });
    }
    for warning in &warnings {
        warn!(baud, "{warning}");
    }

    BaudSynthesis {
        requested: baud,
        multiplier,
        divisor: divisor as u16,
        fraction: fraction as u8,
        actual,
        deviation,
        warnings,
    }
}

/// Line control register for data length, stop bits and parity.
pub fn line_control(params: &SerialParams) -> u8 {
    let mut value = params.data_bits.clamp(5, 8) - 5;
    if params.stop_bits == 2 {
        value |= lcr::STOP_BITS_2;
    }
    match params.parity {
        Parity::None => {}
        Parity::Odd => value |= lcr::PARITY_ENABLE,
        Parity::Even => value |= lcr::PARITY_ENABLE | lcr::PARITY_EVEN,
    }
    value
}

/// Port configuration: `[0x30, port, lcr, dlm, dll, dld, 0]`.
pub fn encode_com_config(port: u8, params: &SerialParams, baud: &BaudSynthesis) -> Vec<u8> {
    vec![
        opcode::COM_CONFIG,
        port,
        line_control(params),
        baud.dlm(),
        baud.dll(),
        baud.dld(),
        0,
    ]
}

/// Transmitter enable: `[0x31, port, enable]`.
pub fn encode_tx_enable(port: u8, enable: bool) -> Vec<u8> {
    vec![opcode::COM_TX_ENABLE, port, u8::from(enable)]
}

/// Transmit: `[0x32, port, tick, len, data]`.
pub fn encode_com_write(port: u8, tick: u32, data: &[u8]) -> Result<Vec<u8>, ConfigError> {
    if data.len() > COM_MAX_PAYLOAD {
        return Err(ConfigError::PayloadTooLong {
            len: data.len(),
            max: COM_MAX_PAYLOAD,
        });
    }
    let mut frame = Vec::with_capacity(7 + data.len());
    frame.push(opcode::COM_WRITE);
    frame.push(port);
    put_u32(&mut frame, tick);
    frame.push(data.len() as u8);
    frame.extend_from_slice(data);
    Ok(frame)
}

/// Receive request: `[0x33, port, 0, 32 x 0]`.
pub fn encode_com_read(port: u8) -> Vec<u8> {
    let mut frame = vec![opcode::COM_READ, port, 0];
    frame.resize(COM_READ_FRAME_LEN, 0);
    frame
}

/// Received bytes: count in byte 2, data from byte 3.
pub fn decode_com_read(response: &[u8]) -> Result<Vec<u8>, TransportError> {
    let count = usize::from(field(response, 2, 1)?[0]).min(COM_MAX_PAYLOAD);
    Ok(field(response, 3, count)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOCK: u32 = 14_745_600;

    #[test]
    fn test_exact_rates() {
        let b = synthesize_baud(9600, CLOCK, 0.02);
        assert_eq!((b.multiplier, b.divisor, b.fraction), (1, 96, 0));
        assert_eq!((b.dlm(), b.dll(), b.dld()), (0, 96, 0));
        assert!(b.warnings.is_empty());

        let b = synthesize_baud(115_200, CLOCK, 0.02);
        assert_eq!(b.divisor, 8);
        assert_eq!(b.deviation, 0.0);
    }

    #[test]
    fn test_high_rates_switch_sampling() {
        let b = synthesize_baud(1_843_200, CLOCK, 0.02);
        assert_eq!((b.multiplier, b.divisor), (2, 1));
        assert_eq!(b.dld(), dld::SAMPLING_8X);

        let b = synthesize_baud(3_686_400, CLOCK, 0.02);
        assert_eq!((b.multiplier, b.divisor), (4, 1));
        assert_eq!(b.dld(), dld::SAMPLING_4X);
    }

    #[test]
    fn test_fractional_divisor() {
        // 14745600 / (16 * 1000) = 921.6
        let b = synthesize_baud(1000, CLOCK, 0.02);
        assert_eq!(b.divisor, 921);
        assert_eq!(b.fraction, 10);
        assert_eq!(b.dlm(), 3);
        assert_eq!(b.dll(), 0x99);
        assert!(b.deviation < 0.001);
    }

    #[test]
    fn test_low_rate_clamps() {
        let b = synthesize_baud(10, CLOCK, 0.02);
        assert_eq!(b.divisor, u16::MAX);
        assert!(b
            .warnings
            .iter()
            .any(|w| matches!(w, ProtocolWarning::DivisorClamped { requested: 10 })));
    }

    #[test]
    fn test_unreachable_rate_flags_deviation() {
        let b = synthesize_baud(7_000_000, CLOCK, 0.02);
        assert_eq!((b.multiplier, b.divisor), (4, 1));
        assert!(b
            .warnings
            .iter()
            .any(|w| matches!(w, ProtocolWarning::BaudDeviation { .. })));
    }

    #[test]
    fn test_line_control() {
        let params = SerialParams::default();
        assert_eq!(line_control(&params), 0x03);

        let params = SerialParams {
            baud: 9600,
            parity: Parity::Even,
            stop_bits: 2,
            data_bits: 7,
        };
        assert_eq!(line_control(&params), 0x02 | 0x04 | 0x08 | 0x10);

        let params = SerialParams {
            parity: Parity::Odd,
            data_bits: 5,
            ..SerialParams::default()
        };
        assert_eq!(line_control(&params), 0x08);
    }

    #[test]
    fn test_config_frame() {
        let params = SerialParams::default();
        let baud = synthesize_baud(9600, CLOCK, 0.02);
        assert_eq!(
            encode_com_config(1, &params, &baud),
            vec![0x30, 1, 0x03, 0, 96, 0, 0]
        );
    }

    #[test]
    fn test_write_frame() {
        let frame = encode_com_write(0, 5, b"hi").unwrap();
        assert_eq!(frame, vec![0x32, 0, 0, 0, 0, 5, 2, b'h', b'i']);
        assert!(matches!(
            encode_com_write(0, 0, &[0; 33]),
            Err(ConfigError::PayloadTooLong { len: 33, max: 32 })
        ));
    }

    #[test]
    fn test_read_frame() {
        let frame = encode_com_read(1);
        assert_eq!(frame.len(), COM_READ_FRAME_LEN);
        assert_eq!(&frame[..3], &[0x33, 1, 0]);

        let mut response = vec![0x0A, 0, 3, b'a', b'b', b'c'];
        response.resize(COM_READ_FRAME_LEN, 0);
        assert_eq!(decode_com_read(&response).unwrap(), b"abc".to_vec());
    }
}
