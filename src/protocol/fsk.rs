//! HS-FSKCOM modem frames.
//!
//! Each modem is a DDS pair switching between a space (`f0`) and a mark (`f`)
//! frequency. Frequencies are sent as 48-bit tuning words, amplitude as a
//! 12-bit gain code.

use crate::config::FskChannelSpec;
use crate::error::ConfigError;
use crate::protocol::{opcode, put_u32};

/// Longest payload of one write frame.
pub const FSK_MAX_PAYLOAD: usize = 32;

/// Largest gain code.
pub const GAIN_MAX: u16 = 0x0FFF;

/// Gain bit marking the second modem of the board.
pub const SECOND_CHANNEL_FLAG: u16 = 0x8000;

/// Write flag: repeat the payload until stopped.
pub const FLAG_CONTINUOUS: u8 = 0x01;

/// Length of a configuration frame.
pub const FSK_CONFIG_FRAME_LEN: usize = 17;

const FTW_MAX: u64 = (1 << 48) - 1;

/// 48-bit tuning word `round(f * 2^48 / reference)`.
pub fn frequency_tuning_word(freq_hz: f64, reference_hz: u64) -> u64 {
    if reference_hz == 0 || !freq_hz.is_finite() || freq_hz <= 0.0 {
        return 0;
    }
    let word = (freq_hz * (FTW_MAX as f64 + 1.0) / reference_hz as f64).round();
    if word >= FTW_MAX as f64 {
        FTW_MAX
    } else {
        word as u64
    }
}

/// Tuning word as six bytes, most significant first.
pub fn ftw_bytes(word: u64) -> [u8; 6] {
    let b = word.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// 12-bit gain for an amplitude clamped to `0..=max`.
pub fn amplitude_gain(amplitude: f64, max: f64) -> u16 {
    if max <= 0.0 || !amplitude.is_finite() {
        return 0;
    }
    let ratio = amplitude.clamp(0.0, max) / max;
    (ratio * f64::from(GAIN_MAX)).round() as u16
}

/// Modem configuration: `[0x40, sel, ftw_space, ftw_mark, bitrate, on]`.
pub fn encode_fsk_config(modem: u8, spec: &FskChannelSpec, reference_hz: u64) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FSK_CONFIG_FRAME_LEN);
    frame.push(opcode::FSK_CONFIG);
    frame.push(modem);
    frame.extend_from_slice(&ftw_bytes(frequency_tuning_word(spec.f0, reference_hz)));
    frame.extend_from_slice(&ftw_bytes(frequency_tuning_word(spec.f, reference_hz)));
    frame.extend_from_slice(&spec.bitrate.to_be_bytes());
    frame.push(u8::from(spec.on));
    frame
}

/// Transmit: `[0x41, gain, flags, tick, len, data]`.
///
/// Gain bit 15 selects the second modem.
pub fn encode_fsk_write(
    second_channel: bool,
    gain: u16,
    continuous: bool,
    tick: u32,
    data: &[u8],
) -> Result<Vec<u8>, ConfigError> {
    if data.len() > FSK_MAX_PAYLOAD {
        return Err(ConfigError::PayloadTooLong {
            len: data.len(),
            max: FSK_MAX_PAYLOAD,
        });
    }
    let mut gain = gain.min(GAIN_MAX);
    if second_channel {
        gain |= SECOND_CHANNEL_FLAG;
    }
    let mut frame = Vec::with_capacity(9 + data.len());
    frame.push(opcode::FSK_WRITE);
    frame.extend_from_slice(&gain.to_be_bytes());
    frame.push(if continuous { FLAG_CONTINUOUS } else { 0 });
    put_u32(&mut frame, tick);
    frame.push(data.len() as u8);
    frame.extend_from_slice(data);
    Ok(frame)
}

/// Stop every modem of the board: `[0x42, 0]`.
pub fn encode_fsk_stop() -> Vec<u8> {
    vec![opcode::FSK_STOP, 0]
}

#[cfg(test)]
mod tests {
    use super::*;

    const REF: u64 = 100_000_000;

    #[test]
    fn test_tuning_word() {
        // 1 MHz on a 100 MHz reference is 2^48 / 100
        assert_eq!(frequency_tuning_word(1_000_000.0, REF), 2_814_749_767_107);
        assert_eq!(frequency_tuning_word(0.0, REF), 0);
        assert_eq!(frequency_tuning_word(REF as f64 * 2.0, REF), FTW_MAX);
    }

    #[test]
    fn test_ftw_bytes() {
        assert_eq!(
            ftw_bytes(0x0123_4567_89AB),
            [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB]
        );
    }

    #[test]
    fn test_gain() {
        assert_eq!(amplitude_gain(5000.0, 5000.0), 4095);
        assert_eq!(amplitude_gain(9000.0, 5000.0), 4095);
        assert_eq!(amplitude_gain(-1.0, 5000.0), 0);
        assert_eq!(amplitude_gain(2500.0, 5000.0), 2048);
    }

    #[test]
    fn test_config_frame() {
        let spec = FskChannelSpec {
            f0: 1200.0,
            f: 2200.0,
            bitrate: 1200,
            on: true,
        };
        let frame = encode_fsk_config(1, &spec, REF);
        assert_eq!(frame.len(), FSK_CONFIG_FRAME_LEN);
        assert_eq!(&frame[..2], &[0x40, 1]);
        assert_eq!(&frame[2..8], &ftw_bytes(frequency_tuning_word(1200.0, REF)));
        assert_eq!(&frame[14..], &[0x04, 0xB0, 1]);
    }

    #[test]
    fn test_write_frame() {
        let frame = encode_fsk_write(true, 4095, true, 2, &[0xAA]).unwrap();
        assert_eq!(frame, vec![0x41, 0x8F, 0xFF, 0x01, 0, 0, 0, 2, 1, 0xAA]);

        let frame = encode_fsk_write(false, 100, false, 0, &[]).unwrap();
        assert_eq!(&frame[..4], &[0x41, 0x00, 0x64, 0x00]);
        assert!(encode_fsk_write(false, 0, false, 0, &[0; 40]).is_err());
    }
}
