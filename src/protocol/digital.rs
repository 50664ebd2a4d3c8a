//! Digital block frames.
//!
//! Two board families carry digital I/O:
//!
//! - **HS-GPIO32** exchanges a 16-bit block per frame: the request carries all
//!   sixteen outputs, the response carries all sixteen inputs.
//! - **GPIO64** is four MCP23S17 port expanders behind one chip-select. Each
//!   expander is picked by the hardware-address bits of the control byte and
//!   owns one 8-bit group of the 32-bit block (port B drives outputs, port A
//!   reads inputs).
//!
//! Output levels are given MSB first: output `c` is position `c` of the bit
//! string.

use crate::bits::{self, BitSource};
use crate::error::TransportError;
use crate::protocol::{field, opcode, put_u32};

/// Bits in an HS-GPIO32 block.
pub const DIGITAL16_WIDTH: usize = 16;

/// Bits in a GPIO64 block.
pub const EXPANDER32_WIDTH: usize = 32;

/// Length of an HS-GPIO32 block frame.
pub const DIGITAL16_FRAME_LEN: usize = 7;

/// HS-GPIO32 block frame: `[0x10, out_hi, out_lo, tick]`.
pub fn encode_digital16(outputs: u16, tick: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(DIGITAL16_FRAME_LEN);
    frame.push(opcode::DIGITAL16);
    frame.extend_from_slice(&outputs.to_be_bytes());
    put_u32(&mut frame, tick);
    frame
}

/// Input word from an HS-GPIO32 block response.
pub fn decode_digital16(response: &[u8]) -> Result<u16, TransportError> {
    let bytes = field(response, 1, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Pack output levels MSB first into a `width`-bit word.
///
/// Missing trailing levels are low.
pub fn outputs_word(levels: &[bool], width: usize) -> u64 {
    levels
        .iter()
        .take(width)
        .enumerate()
        .filter(|(_, on)| **on)
        .fold(0u64, |word, (c, _)| bits::insert_field(word, c, 1, width, 1))
}

/// Output level `c` of a block word.
pub fn output_level(word: u64, channel: usize, width: usize) -> bool {
    bits::extract_field(BitSource::Word(word), channel, 1, width) == 1
}

/// HS-GPIO32 input `k` is integer bit `k`: the MSB is the highest input.
pub fn digital16_input_level(inputs: u16, input: usize) -> bool {
    input < DIGITAL16_WIDTH && (inputs >> input) & 1 == 1
}

/// MCP23S17 register addresses (IOCON.BANK = 0).
pub mod mcp23s17 {
    /// Configuration register
    pub const IOCON: u8 = 0x0A;
    /// Port B direction
    pub const IODIRB: u8 = 0x01;
    /// Port A level (inputs)
    pub const GPIOA: u8 = 0x12;
    /// Port B level (outputs)
    pub const GPIOB: u8 = 0x13;
    /// IOCON value enabling hardware addressing
    pub const IOCON_HAEN: u8 = 0x08;
    /// IODIRB value making port B all outputs
    pub const IODIR_ALL_OUTPUTS: u8 = 0x00;
    /// Base control byte before address bits
    pub const CONTROL_BASE: u8 = 0x4E;
    /// Hardware-address masks of the four expanders
    pub const ADDRESS_MASKS: [u8; 4] = [0xF1, 0xF9, 0xF5, 0xF3];
}

/// Expander serving each 8-bit group of the block, group 0 = bits 0..8 of the string.
pub const GROUP_EXPANDER: [usize; 4] = [0, 2, 1, 3];

/// Control byte addressing expander `expander` for a read or a write.
pub fn control_byte(expander: usize, read: bool) -> u8 {
    (mcp23s17::CONTROL_BASE | u8::from(read)) & mcp23s17::ADDRESS_MASKS[expander % 4]
}

/// Register write frame.
pub fn write_frame(expander: usize, register: u8, data: u8) -> [u8; 3] {
    [control_byte(expander, false), register, data]
}

/// Register read frame. The value comes back in byte 2.
pub fn read_frame(expander: usize, register: u8) -> [u8; 3] {
    [control_byte(expander, true), register, 0]
}

/// Register value from a read response.
pub fn decode_read(response: &[u8]) -> Result<u8, TransportError> {
    Ok(field(response, 2, 1)?[0])
}

/// Bring-up frames: hardware addressing first on every expander, then port B as outputs.
pub fn init_frames() -> Vec<[u8; 3]> {
    let haen = (0..4).map(|e| write_frame(e, mcp23s17::IOCON, mcp23s17::IOCON_HAEN));
    let dir = (0..4).map(|e| write_frame(e, mcp23s17::IODIRB, mcp23s17::IODIR_ALL_OUTPUTS));
    haen.chain(dir).collect()
}

/// Four port B writes carrying a 32-bit output block.
pub fn block_write_frames(word: u32) -> [[u8; 3]; 4] {
    let mut frames = [[0u8; 3]; 4];
    for (group, frame) in frames.iter_mut().enumerate() {
        let byte = bits::extract_field(BitSource::Word(u64::from(word)), group * 8, 8, 32);
        *frame = write_frame(GROUP_EXPANDER[group], mcp23s17::GPIOB, byte as u8);
    }
    frames
}

/// Four port A reads, one per group.
pub fn block_read_frames() -> [[u8; 3]; 4] {
    let mut frames = [[0u8; 3]; 4];
    for (group, frame) in frames.iter_mut().enumerate() {
        *frame = read_frame(GROUP_EXPANDER[group], mcp23s17::GPIOA);
    }
    frames
}

/// Rebuild the 32-bit input block from the four group bytes.
pub fn assemble_groups(groups: [u8; 4]) -> u32 {
    u32::from_be_bytes(groups)
}

/// Expander and bit offset of one GPIO64 channel.
///
/// The offset is a [`bits::pack_bit`] offset, so channel 0 is the MSB of
/// group 0.
pub fn channel_location(channel: u8) -> (usize, u8) {
    let group = usize::from(channel / 8) % 4;
    (GROUP_EXPANDER[group], 7 - channel % 8)
}
