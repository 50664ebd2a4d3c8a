//! HS-GPIO32 pattern generator frames.
//!
//! Each generator drives a pair of outputs from a 32-bit phase accumulator.
//! Frequency and phase are sent as accumulator words.

use crate::protocol::{opcode, put_u32};

const TWO_POW_32: f64 = 4_294_967_296.0;

/// Accumulator word for a frequency, capped at `max_hz`.
pub fn frequency_word(freq_hz: f64, clock_hz: u64, max_hz: f64) -> u32 {
    if clock_hz == 0 || !freq_hz.is_finite() || freq_hz <= 0.0 {
        return 0;
    }
    let word = (freq_hz.min(max_hz) * TWO_POW_32 / clock_hz as f64).round();
    if word >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        word as u32
    }
}

/// Accumulator word for a phase offset in degrees. 360 wraps to 0.
pub fn phase_word(degrees: f64) -> u32 {
    if !degrees.is_finite() {
        return 0;
    }
    let word = (degrees.rem_euclid(360.0) / 360.0 * TWO_POW_32).round();
    (word as u64 % (1u64 << 32)) as u32
}

/// One generator's frequency and phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorSetting {
    /// Generator number, 1-based
    pub generator: u8,
    /// Frequency word
    pub frequency: u32,
    /// Phase word
    pub phase: u32,
}

/// Bit pattern: `[0x11, pg, pattern, tick]`.
pub fn encode_pattern(generator: u8, pattern: u8, tick: u32) -> Vec<u8> {
    let mut frame = vec![opcode::PATTERN, generator, pattern];
    put_u32(&mut frame, tick);
    frame
}

/// Frequency and phase: `[0x12, pg, freq, phase, tick]`.
pub fn encode_frequency(setting: GeneratorSetting, tick: u32) -> Vec<u8> {
    let mut frame = vec![opcode::FREQ];
    put_setting(&mut frame, setting);
    put_u32(&mut frame, tick);
    frame
}

/// Two generators started together: `[0x13, a, b, tick]`.
pub fn encode_frequency_2ch(a: GeneratorSetting, b: GeneratorSetting, tick: u32) -> Vec<u8> {
    let mut frame = vec![opcode::FREQ_2CH];
    put_setting(&mut frame, a);
    put_setting(&mut frame, b);
    put_u32(&mut frame, tick);
    frame
}

/// Lock `slave` to `master` at a phase offset: `[0x14, slave, master, phase, tick]`.
pub fn encode_slave(slave: u8, master: u8, phase: u32, tick: u32) -> Vec<u8> {
    let mut frame = vec![opcode::SLAVE, slave, master];
    put_u32(&mut frame, phase);
    put_u32(&mut frame, tick);
    frame
}

fn put_setting(frame: &mut Vec<u8>, setting: GeneratorSetting) {
    frame.push(setting.generator);
    put_u32(frame, setting.frequency);
    put_u32(frame, setting.phase);
}
