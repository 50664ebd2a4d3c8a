//! HS-AIO12 DAC and ADC frames.

use crate::error::TransportError;
use crate::protocol::{field, opcode, put_u32};

/// Full-scale voltage of both converters.
pub const FULL_SCALE_VOLTS: f64 = 10.0;

/// Code at full scale.
pub const FULL_SCALE_CODE: f64 = 32767.0;

/// Samples returned by one capture frame.
pub const ANALOG_IN_CHANNELS: usize = 8;

/// Length of a DAC write frame.
pub const ANALOG_OUT_FRAME_LEN: usize = 8;

/// Length of a capture frame.
pub const ANALOG_IN_FRAME_LEN: usize = 5 + 2 * ANALOG_IN_CHANNELS;

/// Clamp to ±10 V and scale to a signed DAC code.
pub fn volts_to_code(volts: f64) -> i16 {
    let clamped = volts.clamp(-FULL_SCALE_VOLTS, FULL_SCALE_VOLTS);
    (clamped * FULL_SCALE_CODE / FULL_SCALE_VOLTS).round() as i16
}

/// Scale a signed ADC code back to volts.
pub fn code_to_volts(code: i16) -> f64 {
    f64::from(code) * FULL_SCALE_VOLTS / FULL_SCALE_CODE
}

/// DAC write: `[0x20, channel, code, tick]`.
pub fn encode_analog_out(channel: u8, volts: f64, tick: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ANALOG_OUT_FRAME_LEN);
    frame.push(opcode::ANALOG_OUT);
    frame.push(channel);
    frame.extend_from_slice(&volts_to_code(volts).to_be_bytes());
    put_u32(&mut frame, tick);
    frame
}

/// Capture request for all eight inputs: `[0x21, tick, 16 x 0]`.
pub fn encode_analog_in(tick: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ANALOG_IN_FRAME_LEN);
    frame.push(opcode::ANALOG_IN);
    put_u32(&mut frame, tick);
    frame.resize(ANALOG_IN_FRAME_LEN, 0);
    frame
}

/// Eight samples in volts from a capture response.
pub fn decode_analog_in(response: &[u8]) -> Result<[f64; ANALOG_IN_CHANNELS], TransportError> {
    let samples = field(response, 5, 2 * ANALOG_IN_CHANNELS)?;
    let mut volts = [0.0; ANALOG_IN_CHANNELS];
    for (v, pair) in volts.iter_mut().zip(samples.chunks_exact(2)) {
        *v = code_to_volts(i16::from_be_bytes([pair[0], pair[1]]));
    }
    Ok(volts)
}

/// An input changed if it was never read or moved by more than the threshold.
pub fn exceeds_threshold(previous: Option<f64>, current: f64, threshold: f64) -> bool {
    match previous {
        None => true,
        Some(prev) => (current - prev).abs() > threshold,
    }
}
