//! Bus addressing.
//!
//! Boards share one SPI bus. Each bus board is reached through a chip-select
//! line (active low) and, when several boards share a chip-select line, a
//! 3-bit multiplexer value written on three dedicated host lines first.
//!
//! The physical transfer and line toggling are supplied by the caller through
//! [`BusTransport`] and [`GpioLines`]. This module only owns the sequencing:
//!
//! ```text
//! mux lines (if non-zero) -> CS low -> transfer(s) -> CS high -> mux 000 (if set)
//! ```
//!
//! Chip-select is released on every exit path of
//! [`Bus::with_board_selected`], including when the transaction fails.

use std::collections::{BTreeSet, HashMap};

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::config::{BoardSpec, StackSettings};
use crate::error::{ConfigError, ProtocolWarning, Result, TransportError};
use crate::pins;

/// Raw full-duplex transfer on the shared bus.
pub trait BusTransport: Send {
    /// Clock `frame` out and return the bytes clocked in, same length.
    fn transfer(&mut self, frame: &[u8]) -> std::result::Result<Vec<u8>, TransportError>;
}

/// Raw host GPIO line control. Lines are BCM numbers.
pub trait GpioLines: Send {
    /// Claim a line as output.
    fn claim_output(&mut self, line: u8) -> std::result::Result<(), TransportError>;

    /// Claim a line as input.
    fn claim_input(&mut self, line: u8) -> std::result::Result<(), TransportError>;

    /// Drive a claimed output line.
    fn write_line(&mut self, line: u8, level: bool) -> std::result::Result<(), TransportError>;

    /// Sample a claimed line.
    fn read_line(&mut self, line: u8) -> std::result::Result<bool, TransportError>;

    /// Give a line back to the system.
    fn release(&mut self, line: u8) -> std::result::Result<(), TransportError>;
}

/// Device id reported in the low nibble of every FPGA status byte.
pub const DEVICE_ID: u8 = 0x0A;

/// Mask of the device id nibble.
pub const DEVICE_ID_MASK: u8 = 0x0F;

bitflags! {
    /// Condition bits in the high nibble of an FPGA status byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u8 {
        /// Powered up and not reset since
        const NOT_RESET = 0b1000_0000;
        /// Previous command was rejected
        const LAST_INVALID = 0b0100_0000;
        /// Previous command did not complete
        const INCOMPLETE = 0b0010_0000;
    }
}

/// Decode a status byte into warnings. Empty when the board is healthy.
pub fn decode_status(board: &str, status: u8) -> Vec<ProtocolWarning> {
    let mut warnings = Vec::new();
    let id = status & DEVICE_ID_MASK;
    if id != DEVICE_ID {
        warnings.push(ProtocolWarning::DeviceIdMismatch {
            board: board.to_string(),
            expected: DEVICE_ID,
            actual: id,
        });
    }
    let flags = StatusFlags::from_bits_truncate(status);
    if flags.contains(StatusFlags::NOT_RESET) {
        warnings.push(ProtocolWarning::NotResetSincePowerUp {
            board: board.to_string(),
        });
    }
    if flags.contains(StatusFlags::LAST_INVALID) {
        warnings.push(ProtocolWarning::LastCommandInvalid {
            board: board.to_string(),
        });
    }
    if flags.contains(StatusFlags::INCOMPLETE) {
        warnings.push(ProtocolWarning::LastCommandIncomplete {
            board: board.to_string(),
        });
    }
    warnings
}

/// Select lines of one bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSelectEntry {
    /// Bus address
    pub address: u8,
    /// BCM line of the chip-select
    pub cs_line: u8,
    /// Multiplexer bits, MSB first
    pub mux: [u8; 3],
}

impl BusSelectEntry {
    /// Multiplexer lines are only driven for a non-zero selector.
    pub fn has_mux(&self) -> bool {
        self.mux.iter().any(|b| *b != 0)
    }
}

/// Address to select-line table, built once from the inventory.
#[derive(Debug, Clone, Default)]
pub struct BusSelectTable {
    entries: HashMap<u8, BusSelectEntry>,
    mux_lines: [u8; 3],
}

impl BusSelectTable {
    /// Build from every board that is not a bus master.
    pub fn build(settings: &StackSettings, boards: &[BoardSpec]) -> std::result::Result<Self, ConfigError> {
        let mut mux_lines = [0u8; 3];
        for (line, pin) in mux_lines.iter_mut().zip(settings.mux_pins) {
            *line = pins::require_bcm_line(pin)?;
        }

        let mut entries = HashMap::new();
        for board in boards.iter().filter(|b| b.needs_select()) {
            let (Some(address), Some(pin)) = (board.spi_address, board.pin_number) else {
                continue;
            };
            let entry = BusSelectEntry {
                address,
                cs_line: pins::require_bcm_line(pin)?,
                mux: board.mux,
            };
            if entries.insert(address, entry).is_some() {
                return Err(ConfigError::DuplicateBusAddress(address.to_string()));
            }
        }
        Ok(Self { entries, mux_lines })
    }

    /// Entry for a bus address.
    pub fn get(&self, address: u8) -> Option<&BusSelectEntry> {
        self.entries.get(&address)
    }

    /// Distinct chip-select lines, ascending.
    pub fn cs_lines(&self) -> Vec<u8> {
        self.entries
            .values()
            .map(|e| e.cs_line)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// BCM lines of the multiplexer selector, MSB first.
    pub fn mux_lines(&self) -> [u8; 3] {
        self.mux_lines
    }

    /// Number of addressable boards.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no board needs selecting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Board addressed by a transaction.
#[derive(Debug, Clone, Copy)]
pub struct BusTarget<'a> {
    /// Board id, for logs
    pub id: &'a str,
    /// Bus address
    pub address: u8,
    /// Inspect the status byte of every response
    pub checks_status: bool,
}

/// Transfers issued while a board is selected.
pub struct Transaction<'a> {
    transport: &'a mut dyn BusTransport,
    target: BusTarget<'a>,
}

impl Transaction<'_> {
    /// One full-duplex transfer. The status byte is checked on FPGA boards.
    pub fn transfer(&mut self, frame: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
        let response = checked_transfer(self.transport, frame)?;
        debug!(
            board = self.target.id,
            opcode = frame.first().copied().unwrap_or_default(),
            len = frame.len(),
            "SPI transfer"
        );
        if self.target.checks_status {
            if let Some(status) = response.first() {
                for warning in decode_status(self.target.id, *status) {
                    warn!(board = self.target.id, status = *status, "{warning}");
                }
            }
        }
        Ok(response)
    }
}

fn checked_transfer(
    transport: &mut dyn BusTransport,
    frame: &[u8],
) -> std::result::Result<Vec<u8>, TransportError> {
    let response = transport.transfer(frame)?;
    if response.len() != frame.len() {
        return Err(TransportError::ShortResponse {
            expected: frame.len(),
            actual: response.len(),
        });
    }
    Ok(response)
}

/// The shared bus: transport, select lines and their table.
pub struct Bus {
    transport: Box<dyn BusTransport>,
    lines: Box<dyn GpioLines>,
    table: BusSelectTable,
}

impl Bus {
    /// Wrap a transport and line provider.
    pub fn new(
        transport: Box<dyn BusTransport>,
        lines: Box<dyn GpioLines>,
        table: BusSelectTable,
    ) -> Self {
        Self {
            transport,
            lines,
            table,
        }
    }

    /// Select table.
    pub fn table(&self) -> &BusSelectTable {
        &self.table
    }

    /// Host line provider, for channels wired straight to the host.
    pub fn lines(&mut self) -> &mut dyn GpioLines {
        self.lines.as_mut()
    }

    /// Claim mux and chip-select lines as outputs and leave every board deselected.
    pub fn claim_select_lines(&mut self) -> Result<()> {
        for line in self.table.mux_lines() {
            self.lines.claim_output(line)?;
            self.lines.write_line(line, false)?;
        }
        for line in self.table.cs_lines() {
            self.lines.claim_output(line)?;
        }
        self.deselect_all()
    }

    /// Drive every chip-select line high.
    pub fn deselect_all(&mut self) -> Result<()> {
        for line in self.table.cs_lines() {
            self.lines.write_line(line, true)?;
        }
        Ok(())
    }

    /// Release mux and chip-select lines, returning the failures.
    pub fn release_select_lines(&mut self) -> Vec<TransportError> {
        let mut failures = Vec::new();
        let lines = self
            .table
            .cs_lines()
            .into_iter()
            .chain(self.table.mux_lines());
        for line in lines {
            if let Err(err) = self.lines.release(line) {
                failures.push(err);
            }
        }
        failures
    }

    fn entry(&self, address: u8) -> Result<BusSelectEntry> {
        self.table
            .get(address)
            .copied()
            .ok_or_else(|| ConfigError::UnknownBoard(format!("bus address {address}")).into())
    }

    /// Select or deselect one bus address.
    ///
    /// Selecting writes the multiplexer first when the address has a
    /// non-zero selector, then pulls chip-select low. Deselecting such an
    /// address raises chip-select and returns the multiplexer to 000, so
    /// boards without a selector on the same chip-select stay reachable.
    pub fn select(&mut self, address: u8, enable: bool) -> Result<()> {
        let entry = self.entry(address)?;
        if enable && entry.has_mux() {
            self.write_mux(entry.mux)?;
        }
        self.lines.write_line(entry.cs_line, !enable)?;
        if !enable && entry.has_mux() {
            self.write_mux([0; 3])?;
        }
        Ok(())
    }

    fn write_mux(&mut self, bits: [u8; 3]) -> Result<()> {
        for (line, bit) in self.table.mux_lines().into_iter().zip(bits) {
            self.lines.write_line(line, bit != 0)?;
        }
        Ok(())
    }

    /// Run `op` with the board selected.
    ///
    /// Chip-select is released whatever `op` returns. When both `op` and the
    /// release fail, the error from `op` is returned.
    pub fn with_board_selected<T, F>(&mut self, target: BusTarget<'_>, op: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        self.select(target.address, true)?;

        let outcome = {
            let mut tx = Transaction {
                transport: self.transport.as_mut(),
                target,
            };
            op(&mut tx)
        };

        let released = self.select(target.address, false);
        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(board = target.id, error = %release_err, "Deselect failed after error");
                Err(err)
            }
            (Ok(_), Err(release_err)) => Err(release_err),
        }
    }

    /// Transfer without touching any select line.
    pub fn raw_transfer(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        Ok(checked_transfer(self.transport.as_mut(), frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TioConfig;
    use crate::error::TioError;
    use crate::mock::{BusEvent, MockHardware};

    fn table() -> BusSelectTable {
        let config = TioConfig::from_json_str(
            r#"{ "boards": [
                { "id": "A", "type": "HS-GPIO32", "spi_address": 1, "pin_number": 24,
                  "DO": { "channels": 16 } },
                { "id": "B", "type": "HS-AIO12", "spi_address": 2, "pin_number": 24, "mux": [1, 0, 1],
                  "AO": { "channels": 4 } }
            ] }"#,
        )
        .unwrap();
        BusSelectTable::build(&config.stack, &config.boards).unwrap()
    }

    const CS: u8 = 8; // header pin 24
    const MUX: [u8; 3] = [5, 6, 12]; // header pins 29, 31, 32

    fn target(address: u8) -> BusTarget<'static> {
        BusTarget {
            id: "A",
            address,
            checks_status: false,
        }
    }

    #[test]
    fn test_table() {
        let table = table();
        assert_eq!(table.len(), 2);
        assert_eq!(table.cs_lines(), vec![CS]);
        assert_eq!(table.mux_lines(), MUX);
        assert!(!table.get(1).unwrap().has_mux());
        assert!(table.get(2).unwrap().has_mux());
    }

    #[test]
    fn test_select_sequence_with_mux() {
        let hw = MockHardware::new();
        let mut bus = Bus::new(hw.bus(), hw.lines(), table());
        bus.with_board_selected(target(2), |tx| Ok(tx.transfer(&[0x20, 0, 0])?))
            .unwrap();

        assert_eq!(
            hw.events(),
            vec![
                BusEvent::Line { line: MUX[0], level: true },
                BusEvent::Line { line: MUX[1], level: false },
                BusEvent::Line { line: MUX[2], level: true },
                BusEvent::Line { line: CS, level: false },
                BusEvent::Transfer(vec![0x20, 0, 0]),
                BusEvent::Line { line: CS, level: true },
                BusEvent::Line { line: MUX[0], level: false },
                BusEvent::Line { line: MUX[1], level: false },
                BusEvent::Line { line: MUX[2], level: false },
            ]
        );
    }

    #[test]
    fn test_zero_mux_skips_mux_lines() {
        let hw = MockHardware::new();
        let mut bus = Bus::new(hw.bus(), hw.lines(), table());
        bus.with_board_selected(target(1), |tx| Ok(tx.transfer(&[0x10])?))
            .unwrap();
        assert_eq!(
            hw.events(),
            vec![
                BusEvent::Line { line: CS, level: false },
                BusEvent::Transfer(vec![0x10]),
                BusEvent::Line { line: CS, level: true },
            ]
        );
    }

    #[test]
    fn test_deselects_after_transfer_failure() {
        let hw = MockHardware::new();
        let mut bus = Bus::new(hw.bus(), hw.lines(), table());
        for _ in 0..20 {
            hw.fail_next_transfer("EIO");
            let result = bus.with_board_selected(target(1), |tx| Ok(tx.transfer(&[0x10, 0])?));
            assert!(result.unwrap_err().is_transport());
            assert_eq!(hw.line_level(CS), Some(true));
        }
    }

    #[test]
    fn test_deselects_after_encoder_failure() {
        let hw = MockHardware::new();
        let mut bus = Bus::new(hw.bus(), hw.lines(), table());
        let result: Result<()> = bus.with_board_selected(target(2), |_| {
            Err(ConfigError::InvalidParameter("bad".into()).into())
        });
        assert!(result.unwrap_err().is_configuration());
        assert_eq!(hw.line_level(CS), Some(true));
    }

    #[test]
    fn test_unknown_address() {
        let hw = MockHardware::new();
        let mut bus = Bus::new(hw.bus(), hw.lines(), table());
        assert!(bus.select(9, true).unwrap_err().is_configuration());
    }

    #[test]
    fn test_short_response_rejected() {
        let hw = MockHardware::new();
        hw.push_response(vec![0x0A]);
        let mut bus = Bus::new(hw.bus(), hw.lines(), table());
        let err = bus.raw_transfer(&[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            TioError::Transport(TransportError::ShortResponse { expected: 3, actual: 1 })
        ));
    }

    #[test]
    fn test_decode_status() {
        assert!(decode_status("A", 0x0A).is_empty());
        let warnings = decode_status("A", 0xE3);
        assert_eq!(warnings.len(), 4);
        assert!(matches!(
            warnings[0],
            ProtocolWarning::DeviceIdMismatch { actual: 0x03, .. }
        ));
        assert_eq!(
            decode_status("A", 0x4A),
            vec![ProtocolWarning::LastCommandInvalid { board: "A".into() }]
        );
    }
}
