//! Inventory files on disk.

use std::io::Write;
use std::path::PathBuf;

use tio_stack::config::Parity;
use tio_stack::mock::MockHardware;
use tio_stack::{BoardKind, ChannelKind, ConfigError, TioConfig, TioStack};

fn example_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/inventory.example.toml")
}

#[test]
fn test_example_inventory_loads() {
    let config = TioConfig::load(example_path()).unwrap();

    assert_eq!(config.boards.len(), 5);
    assert_eq!(config.stack.rtc_board.as_deref(), Some("AIO-1"));
    assert_eq!(config.boards[1].pattern_mask(), 0x00FF);
    assert_eq!(config.boards[3].mux, [1, 0, 0]);
    assert_eq!(config.boards[3].trigger_threshold(), 0.02);

    let com = config.board("COM-1").unwrap();
    assert_eq!(com.kind, BoardKind::HsFskCom);
    let ports = &com.com.as_ref().unwrap().channels;
    assert_eq!(ports[1].params.baud, 115200);
    assert_eq!(ports[1].params.parity, Parity::Even);
    assert!(!com.fsk.as_ref().unwrap().channels[1].on);
}

#[test]
fn test_example_inventory_drives_a_stack() {
    let config = TioConfig::load(example_path()).unwrap();
    let hw = MockHardware::new();
    let mut stack = TioStack::new(&config, hw.bus(), hw.lines(), hw.clock()).unwrap();
    stack.init().unwrap();

    let names: Vec<&str> = stack
        .channels()
        .iter()
        .filter(|c| c.kind == ChannelKind::DigitalOut)
        .map(|c| c.name.as_str())
        .take(3)
        .collect();
    assert_eq!(names, vec!["DO00", "DO01", "DO02"]);
    assert_eq!(stack.channel("DO02").unwrap().channel, 0);
    assert_eq!(stack.channel("DO02").unwrap().pattern_generator, Some(1));

    stack.reset_clock().unwrap();
    assert_eq!(hw.transfers().last().unwrap()[0], 0x04);
    stack.end();
}

#[test]
fn test_json_file() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        file,
        r#"{{ "stack": {{ "tick_period_ms": 2.0 }},
             "boards": [{{ "id": "A", "type": "HS-AIO12", "spi_address": 7, "pin_number": 24,
                           "AI": {{ "channels": 8 }} }}] }}"#
    )
    .unwrap();

    let config = TioConfig::load(file.path()).unwrap();
    assert_eq!(config.stack.tick_period_ms, 2.0);
    assert_eq!(config.boards[0].channel_count(ChannelKind::AnalogIn), 8);
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = TioConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Load { .. }));
}

#[test]
fn test_unsupported_extension() {
    let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    assert!(matches!(
        TioConfig::load(file.path()),
        Err(ConfigError::Load { message }) if message.contains("yaml")
    ));
}

#[test]
fn test_unknown_board_kind_fails_to_parse() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[[boards]]\nid = \"X\"\ntype = \"GPIO128\"").unwrap();
    assert!(TioConfig::load(file.path()).is_err());
}

#[test]
fn test_rtc_board_must_exist() {
    let mut config = TioConfig::load(example_path()).unwrap();
    config.stack.rtc_board = Some("nope".into());
    let hw = MockHardware::new();
    let err = TioStack::new(&config, hw.bus(), hw.lines(), hw.clock()).unwrap_err();
    assert!(err.is_configuration());
}
