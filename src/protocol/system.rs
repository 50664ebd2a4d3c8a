//! Frames every FPGA board answers: type id, LEDs and the stack clock.

use crate::error::TransportError;
use crate::protocol::{opcode, put_u32, read_u32};

/// Length of the type id and clock frames.
pub const QUERY_FRAME_LEN: usize = 5;

/// Type id request: `[0x01, 0, 0, 0, 0]`.
pub fn encode_type_id() -> Vec<u8> {
    query(opcode::TYPE_ID)
}

/// Board type id from bytes 1..5.
pub fn decode_type_id(response: &[u8]) -> Result<u32, TransportError> {
    read_u32(response, 1)
}

/// LED frame: bit n drives LED n+1.
pub fn encode_leds(leds: [bool; 3]) -> Vec<u8> {
    let mask = leds
        .iter()
        .enumerate()
        .fold(0u8, |acc, (i, on)| acc | (u8::from(*on) << i));
    vec![opcode::LEDS, mask]
}

/// Stack clock request: `[0x03, 0, 0, 0, 0]`.
pub fn encode_get_clock() -> Vec<u8> {
    query(opcode::GET_CLOCK)
}

/// Ticks since the last synchronized reset, bytes 1..5.
pub fn decode_clock(response: &[u8]) -> Result<u32, TransportError> {
    read_u32(response, 1)
}

/// Real-time clock write, seconds since the Unix epoch.
pub fn encode_set_rtc(unix_seconds: u32) -> Vec<u8> {
    let mut frame = vec![opcode::SET_RTC];
    put_u32(&mut frame, unix_seconds);
    frame
}

fn query(op: u8) -> Vec<u8> {
    let mut frame = vec![op];
    frame.resize(QUERY_FRAME_LEN, 0);
    frame
}
