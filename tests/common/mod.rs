//! Shared fixture: a six-board stack on mock hardware.
//!
//! | Board  | Kind      | Address | CS pin (BCM) | Mux     | Channels            |
//! |--------|-----------|---------|--------------|---------|---------------------|
//! | gpio-a | HS-GPIO32 | 1       | 24 (8)       | -       | DO00-15, DI00-15    |
//! | gpio-b | HS-GPIO32 | 2       | 24 (8)       | 1,0,0   | DO16-31             |
//! | io64   | GPIO64    | 3       | 26 (7)       | -       | DO32-63, DI16-47    |
//! | aio    | HS-AIO12  | 4       | 22 (25)      | -       | AO00-03, AI00-07    |
//! | com    | HS-FSKCOM | 5       | 22 (25)      | 0,1,0   | COM1-2, FSK1-2      |
//! | cpu    | CPU-RPI   | -       | -            | -       | DO64-65, DI48       |

#![allow(dead_code)]

use tio_stack::mock::MockHardware;
use tio_stack::{ChangeEvent, TioConfig, TioStack};
use tokio::sync::broadcast;

pub const INVENTORY: &str = r#"{
    "boards": [
        { "id": "gpio-a", "type": "HS-GPIO32", "spi_address": 1, "pin_number": 24,
          "DO": { "channels": 16 }, "DI": { "channels": 16 } },
        { "id": "gpio-b", "type": "HS-GPIO32", "spi_address": 2, "pin_number": 24, "mux": [1, 0, 0],
          "DO": { "channels": 16 } },
        { "id": "io64", "type": "GPIO64", "spi_address": 3, "pin_number": 26,
          "DO": { "channels": 32 }, "DI": { "channels": 32 } },
        { "id": "aio", "type": "HS-AIO12", "spi_address": 4, "pin_number": 22,
          "AO": { "channels": 4 }, "AI": { "channels": 8 },
          "options": { "trigger_threshold": 0.05 } },
        { "id": "com", "type": "HS-FSKCOM", "spi_address": 5, "pin_number": 22, "mux": [0, 1, 0],
          "COM": { "channels": [{ "protocol": "RS232" }, { "protocol": "RS485", "baud": 115200 }] },
          "FSK": { "channels": [{ "f0": 1200, "f": 2200 }, { "f0": 1300, "f": 2100 }] } },
        { "id": "cpu", "type": "CPU-RPI", "spi_master": true,
          "DO": { "channels": [{ "pin": 11 }, { "pin": 13 }] },
          "DI": { "channels": [{ "pin": 15 }] } }
    ]
}"#;

/// BCM chip-select lines.
pub const CS_GPIO: u8 = 8;
pub const CS_IO64: u8 = 7;
pub const CS_AIO: u8 = 25;
/// BCM multiplexer lines (header 29, 31, 32).
pub const MUX: [u8; 3] = [5, 6, 12];
/// BCM reset and sync reset lines (header 36, 38).
pub const RESET: u8 = 16;
pub const SYNC_RESET: u8 = 20;

pub fn config() -> TioConfig {
    TioConfig::from_json_str(INVENTORY).unwrap()
}

/// Initialized stack with the init traffic cleared.
pub fn stack() -> (TioStack, MockHardware) {
    stack_with(&config())
}

pub fn stack_with(config: &TioConfig) -> (TioStack, MockHardware) {
    let hw = MockHardware::new();
    let mut stack = TioStack::new(config, hw.bus(), hw.lines(), hw.clock()).unwrap();
    stack.init().unwrap();
    hw.clear_events();
    (stack, hw)
}

/// Every event waiting on a receiver.
pub fn drain(rx: &mut broadcast::Receiver<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Healthy status byte followed by `payload`, padded to `len`.
pub fn response(len: usize, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x0A];
    frame.extend_from_slice(payload);
    frame.resize(len, 0);
    frame
}
