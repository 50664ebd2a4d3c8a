//! Raspberry Pi 40-pin header to BCM GPIO line table.
//!
//! The inventory and stack settings refer to lines by physical header pin,
//! the line provider expects BCM numbers.

use crate::error::ConfigError;

/// (header pin, BCM line) for every header pin wired to a GPIO.
const HEADER_TO_BCM: [(u8, u8); 26] = [
    (3, 2),
    (5, 3),
    (7, 4),
    (8, 14),
    (10, 15),
    (11, 17),
    (12, 18),
    (13, 27),
    (15, 22),
    (16, 23),
    (18, 24),
    (19, 10),
    (21, 9),
    (22, 25),
    (23, 11),
    (24, 8),
    (26, 7),
    (29, 5),
    (31, 6),
    (32, 12),
    (33, 13),
    (35, 19),
    (36, 16),
    (37, 26),
    (38, 20),
    (40, 21),
];

/// BCM line number behind a header pin, if the pin is a GPIO.
pub fn bcm_line(header_pin: u8) -> Option<u8> {
    HEADER_TO_BCM
        .iter()
        .find(|(pin, _)| *pin == header_pin)
        .map(|(_, bcm)| *bcm)
}

/// Like [`bcm_line`], failing with a configuration error.
pub fn require_bcm_line(header_pin: u8) -> Result<u8, ConfigError> {
    bcm_line(header_pin).ok_or(ConfigError::UnknownPin(header_pin))
}
