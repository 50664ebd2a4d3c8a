//! Digital channels: HS-GPIO32 blocks, GPIO64 expanders and host lines.

mod common;

use common::{drain, response};
use tio_stack::{BitSource, ChannelValue, ConfigError, TioError};

fn digital16(inputs: u16) -> Vec<u8> {
    response(7, &inputs.to_be_bytes())
}

// =============================================================================
// HS-GPIO32
// =============================================================================

#[test]
fn test_single_writes_merge_into_block() {
    let (mut stack, hw) = common::stack();

    stack.write_digital("DO00", true, None).unwrap();
    stack.write_digital("DO15", true, None).unwrap();
    stack.write_digital("DO00", false, None).unwrap();

    let transfers = hw.transfers();
    assert_eq!(transfers[0], vec![0x10, 0x80, 0x00, 0, 0, 0, 0]);
    assert_eq!(transfers[1], vec![0x10, 0x80, 0x01, 0, 0, 0, 0]);
    assert_eq!(transfers[2], vec![0x10, 0x00, 0x01, 0, 0, 0, 0]);
    assert_eq!(
        stack.channel("DO15").unwrap().last_value(),
        Some(&ChannelValue::Digital(true))
    );
}

#[test]
fn test_block_write_from_bit_string() {
    let (mut stack, hw) = common::stack();

    stack
        .write_digital_block("gpio-a", BitSource::Text("1010101010101010"), None)
        .unwrap();

    assert_eq!(hw.transfers(), vec![vec![0x10, 0xAA, 0xAA, 0, 0, 0, 0]]);
    assert!(stack.channel("DO00").unwrap().cached_level());
    assert!(!stack.channel("DO01").unwrap().cached_level());
    assert!(!stack.channel("DO15").unwrap().cached_level());
}

#[test]
fn test_block_width_mismatch_sends_nothing() {
    let (mut stack, hw) = common::stack();

    let err = stack
        .write_digital_block("gpio-a", BitSource::Text("1010"), None)
        .unwrap_err();
    assert!(matches!(
        err,
        TioError::Config(ConfigError::BlockWidth { expected: 16, actual: 4 })
    ));
    assert!(hw.events().is_empty());
}

#[test]
fn test_unchanged_block_read_is_silent() {
    let (mut stack, hw) = common::stack();
    let mut rx = stack.subscribe();

    hw.push_response(digital16(0x0001));
    hw.push_response(digital16(0x0001));
    hw.push_response(digital16(0x0003));

    assert_eq!(stack.read_digital_block("gpio-a").unwrap(), 0x0001);
    assert_eq!(drain(&mut rx).len(), 16);

    assert_eq!(stack.read_digital_block("gpio-a").unwrap(), 0x0001);
    assert!(drain(&mut rx).is_empty());

    assert_eq!(stack.read_digital_block("gpio-a").unwrap(), 0x0003);
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].channel, "DI01");
    assert_eq!(events[0].value, ChannelValue::Digital(true));
}

#[test]
fn test_msb_is_highest_input() {
    let (mut stack, hw) = common::stack();
    hw.push_response(digital16(0x8000));

    assert!(!stack.read_digital("DI00").unwrap());
    assert_eq!(
        stack.channel("DI15").unwrap().last_value(),
        Some(&ChannelValue::Digital(true))
    );
}

#[test]
fn test_block_read_carries_cached_outputs() {
    let (mut stack, hw) = common::stack();
    stack.write_digital("DO01", true, None).unwrap();
    hw.clear_events();

    stack.read_digital_block("gpio-a").unwrap();
    assert_eq!(hw.transfers(), vec![vec![0x10, 0x40, 0x00, 0, 0, 0, 0]]);
}

#[test]
fn test_output_channel_cannot_be_read_as_input() {
    let (mut stack, _hw) = common::stack();
    assert!(stack.read_digital("DO00").unwrap_err().is_configuration());
    assert!(stack.write_digital("DI00", true, None).unwrap_err().is_configuration());
}

#[test]
fn test_outputs_never_notify() {
    let (mut stack, _hw) = common::stack();
    let mut rx = stack.subscribe();
    stack.write_digital("DO64", true, None).unwrap();
    stack.write_analog("AO00", 1.0, None).unwrap();
    assert!(drain(&mut rx).is_empty());
}

// =============================================================================
// GPIO64
// =============================================================================

#[test]
fn test_expander_block_write_groups() {
    let (mut stack, hw) = common::stack();

    stack
        .write_digital_block("io64", BitSource::Word(0x8000_0001), None)
        .unwrap();

    assert_eq!(
        hw.transfers(),
        vec![
            vec![0x40, 0x13, 0x80],
            vec![0x44, 0x13, 0x00],
            vec![0x48, 0x13, 0x00],
            vec![0x42, 0x13, 0x01],
        ]
    );
    assert!(stack.channel("DO32").unwrap().cached_level());
    assert!(!stack.channel("DO33").unwrap().cached_level());
    assert!(stack.channel("DO63").unwrap().cached_level());
}

#[test]
fn test_expander_single_write_is_read_modify_write() {
    let (mut stack, hw) = common::stack();
    hw.push_response(vec![0, 0, 0x80]);

    stack.write_digital("DO33", true, None).unwrap();

    assert_eq!(
        hw.transfers(),
        vec![vec![0x41, 0x13, 0x00], vec![0x40, 0x13, 0xC0]]
    );
}

#[test]
fn test_expander_block_read() {
    let (mut stack, hw) = common::stack();
    hw.set_responder(|frame| match frame[0] {
        0x41 => Some(vec![0, 0, 0x80]),
        0x43 => Some(vec![0, 0, 0x01]),
        0x45 | 0x49 => Some(vec![0, 0, 0x00]),
        _ => None,
    });
    let mut rx = stack.subscribe();

    assert_eq!(stack.read_digital_block("io64").unwrap(), 0x8000_0001);
    assert_eq!(drain(&mut rx).len(), 32);
    assert!(stack.channel("DI16").unwrap().cached_level());
    assert!(!stack.channel("DI17").unwrap().cached_level());
    assert!(stack.channel("DI47").unwrap().cached_level());

    // one select around the four group reads
    let selects = hw
        .events()
        .iter()
        .filter(|e| matches!(e, tio_stack::mock::BusEvent::Line { line: common::CS_IO64, level: false }))
        .count();
    assert_eq!(selects, 1);
}

#[test]
fn test_expander_single_read() {
    let (mut stack, hw) = common::stack();
    hw.push_response(vec![0, 0, 0b0000_0100]);

    assert!(stack.read_digital("DI21").unwrap());
    assert_eq!(hw.transfers(), vec![vec![0x41, 0x12, 0x00]]);
}

// =============================================================================
// Host lines
// =============================================================================

#[test]
fn test_host_lines_bypass_the_bus() {
    let (mut stack, hw) = common::stack();
    let mut rx = stack.subscribe();

    stack.write_digital("DO64", true, None).unwrap();
    assert_eq!(hw.line_level(17), Some(true));

    hw.set_input(22, true);
    assert!(stack.read_digital("DI48").unwrap());
    assert!(stack.read_digital("DI48").unwrap());

    assert!(hw.transfers().is_empty());
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].channel, "DI48");
}
