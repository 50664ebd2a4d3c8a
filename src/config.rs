//! Board inventory and stack-wide settings.
//!
//! The inventory is one document listing every board on the stack plus an
//! optional `[stack]` table of tuning values. It is loaded with figment from a
//! TOML or JSON file (chosen by extension), then environment variables
//! prefixed `TIO_` override individual keys, nested with `__`:
//!
//! ```text
//! TIO_STACK__LOG_LEVEL=debug
//! TIO_STACK__TICK_PERIOD_MS=1.0
//! ```
//!
//! # Example
//! ```no_run
//! use tio_stack::config::TioConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TioConfig::load("config/inventory.example.toml")?;
//! config.validate()?;
//! println!("{} boards", config.boards.len());
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelKind;
use crate::error::ConfigError;
use crate::pins;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TIO_";

/// Whole inventory document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TioConfig {
    /// Stack-wide settings
    #[serde(default)]
    pub stack: StackSettings,
    /// Boards in stack order. Order fixes channel numbering.
    pub boards: Vec<BoardSpec>,
}

/// Tuning values shared by every board on the stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackSettings {
    /// Duration of one stack tick in milliseconds
    pub tick_period_ms: f64,
    /// Header pins driving the three chip-select multiplexer lines, MSB first
    pub mux_pins: [u8; 3],
    /// Header pin of the stack hardware reset line
    pub reset_pin: Option<u8>,
    /// Header pin of the synchronized clock reset line
    pub sync_reset_pin: Option<u8>,
    /// Board holding the real-time clock written on clock reset
    pub rtc_board: Option<String>,
    /// UART input clock in Hz
    pub uart_clock_hz: u32,
    /// Relative baud error above which a warning is logged
    pub baud_tolerance: f64,
    /// DDS reference clock for FSK tuning words in Hz
    pub fsk_reference_clock_hz: u64,
    /// Full-scale FSK amplitude in millivolts
    pub fsk_max_amplitude: f64,
    /// Phase accumulator clock of the pattern generators in Hz
    pub pattern_reference_clock_hz: u64,
    /// Highest frequency a pattern generator can produce in Hz
    pub pattern_max_frequency_hz: f64,
    /// Buffered change events per subscriber
    pub event_capacity: usize,
    /// Prefix of every key written to the state bus
    pub state_key_prefix: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            tick_period_ms: 1.024,
            mux_pins: [29, 31, 32],
            reset_pin: Some(36),
            sync_reset_pin: Some(38),
            rtc_board: None,
            uart_clock_hz: 14_745_600,
            baud_tolerance: 0.02,
            fsk_reference_clock_hz: 100_000_000,
            fsk_max_amplitude: 5000.0,
            pattern_reference_clock_hz: 50_000_000,
            pattern_max_frequency_hz: 1_000_000.0,
            event_capacity: 256,
            state_key_prefix: "TIO.".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Board families that can sit on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoardKind {
    /// FPGA digital board, 16 outputs with pattern generators and 16 inputs
    #[serde(rename = "HS-GPIO32")]
    HsGpio32,
    /// Four 16-bit port expanders behind one chip-select, 32 outputs and 32 inputs
    #[serde(rename = "GPIO64")]
    Gpio64,
    /// FPGA analog board, 4 DAC outputs and 8 ADC inputs
    #[serde(rename = "HS-AIO12")]
    HsAio12,
    /// FPGA communications board, 2 UARTs and 2 FSK modems
    #[serde(rename = "HS-FSKCOM")]
    HsFskCom,
    /// Host CPU header lines
    #[serde(rename = "CPU-RPI")]
    CpuRpi,
}

/// How many channels of one kind a board can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// At most this many channels, addressed by local index
    Max(usize),
    /// Any number of host header pins
    HeaderPins,
}

impl BoardKind {
    /// Inventory label.
    pub fn label(self) -> &'static str {
        match self {
            Self::HsGpio32 => "HS-GPIO32",
            Self::Gpio64 => "GPIO64",
            Self::HsAio12 => "HS-AIO12",
            Self::HsFskCom => "HS-FSKCOM",
            Self::CpuRpi => "CPU-RPI",
        }
    }

    /// Channel capacity for one kind, `None` when the board has no such channels.
    pub fn capacity(self, kind: ChannelKind) -> Option<Capacity> {
        use ChannelKind::*;
        match (self, kind) {
            (Self::HsGpio32, DigitalOut | DigitalIn) => Some(Capacity::Max(16)),
            (Self::Gpio64, DigitalOut | DigitalIn) => Some(Capacity::Max(32)),
            (Self::HsAio12, AnalogOut) => Some(Capacity::Max(4)),
            (Self::HsAio12, AnalogIn) => Some(Capacity::Max(8)),
            (Self::HsFskCom, Com | Fsk) => Some(Capacity::Max(2)),
            (Self::CpuRpi, DigitalOut | DigitalIn) => Some(Capacity::HeaderPins),
            _ => None,
        }
    }

    /// FPGA-class boards prefix every response with a status byte.
    pub fn has_status_byte(self) -> bool {
        matches!(self, Self::HsGpio32 | Self::HsAio12 | Self::HsFskCom)
    }

    /// Board carries pattern generators on its outputs.
    pub fn has_pattern_generators(self) -> bool {
        matches!(self, Self::HsGpio32)
    }

    /// Board is reached over the shared bus rather than host lines.
    pub fn is_bus_board(self) -> bool {
        !matches!(self, Self::CpuRpi)
    }
}

impl fmt::Display for BoardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One physical board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSpec {
    /// Unique board identifier
    pub id: String,
    /// Board family
    #[serde(rename = "type")]
    pub kind: BoardKind,
    /// Bus address used to look up the select lines
    #[serde(default)]
    pub spi_address: Option<u8>,
    /// The host itself; never selected over the bus
    #[serde(default)]
    pub spi_master: bool,
    /// Header pin of the board's chip-select line
    #[serde(default)]
    pub pin_number: Option<u8>,
    /// Chip-select multiplexer bits, MSB first
    #[serde(default)]
    pub mux: [u8; 3],
    /// Digital outputs
    #[serde(rename = "DO", default, skip_serializing_if = "Option::is_none")]
    pub digital_out: Option<IoBlock>,
    /// Digital inputs
    #[serde(rename = "DI", default, skip_serializing_if = "Option::is_none")]
    pub digital_in: Option<IoBlock>,
    /// Analog outputs
    #[serde(rename = "AO", default, skip_serializing_if = "Option::is_none")]
    pub analog_out: Option<IoBlock>,
    /// Analog inputs
    #[serde(rename = "AI", default, skip_serializing_if = "Option::is_none")]
    pub analog_in: Option<IoBlock>,
    /// Serial ports
    #[serde(rename = "COM", default, skip_serializing_if = "Option::is_none")]
    pub com: Option<ComBlock>,
    /// FSK modems
    #[serde(rename = "FSK", default, skip_serializing_if = "Option::is_none")]
    pub fsk: Option<FskBlock>,
    /// Board-specific options
    #[serde(default)]
    pub options: BoardOptions,
}

/// Digital or analog channel declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoBlock {
    /// Channel count or explicit pin list
    pub channels: ChannelList,
}

/// A channel count, or one entry per channel naming its physical pin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelList {
    /// Channels 0..count
    Count(i64),
    /// One channel per listed pin
    Pins(Vec<PinSpec>),
}

impl ChannelList {
    /// Number of channels declared.
    pub fn len(&self) -> usize {
        match self {
            Self::Count(n) => usize::try_from(*n).unwrap_or(0),
            Self::Pins(pins) => pins.len(),
        }
    }

    /// True when no channel is declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical channel number of each declared channel, in order.
    pub fn channel_numbers(&self) -> Vec<u8> {
        match self {
            Self::Count(n) => (0..(*n).clamp(0, 256)).filter_map(|c| u8::try_from(c).ok()).collect(),
            Self::Pins(pins) => pins.iter().map(|p| p.pin).collect(),
        }
    }
}

/// Explicit pin of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSpec {
    /// Header pin (host boards) or in-board channel number (bus boards)
    pub pin: u8,
}

/// Serial port declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComBlock {
    /// One entry per port
    pub channels: Vec<ComChannelSpec>,
}

/// Physical layer of a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialProtocol {
    /// RS-232
    #[default]
    #[serde(rename = "RS232")]
    Rs232,
    /// RS-422
    #[serde(rename = "RS422")]
    Rs422,
    /// RS-485 half duplex
    #[serde(rename = "RS485")]
    Rs485,
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Serial link parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SerialParams {
    /// Baud rate
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Parity
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Data bits (5 to 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud: default_baud(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            data_bits: default_data_bits(),
        }
    }
}

impl SerialParams {
    /// Check the parameters against what the UART accepts.
    pub fn validate(&self) -> Result<(), String> {
        if self.baud == 0 {
            return Err("baud rate must be positive".to_string());
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(format!("stop bits must be 1 or 2, got {}", self.stop_bits));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(format!("data bits must be 5 to 8, got {}", self.data_bits));
        }
        Ok(())
    }
}

/// One serial port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComChannelSpec {
    /// Physical layer
    #[serde(default)]
    pub protocol: SerialProtocol,
    /// Initial link parameters
    #[serde(flatten)]
    pub params: SerialParams,
}

/// FSK modem declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FskBlock {
    /// One entry per modem
    pub channels: Vec<FskChannelSpec>,
}

/// One FSK modem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FskChannelSpec {
    /// Space (low) frequency in Hz
    pub f0: f64,
    /// Mark (high) frequency in Hz
    pub f: f64,
    /// Bits per second
    #[serde(default = "default_fsk_bitrate")]
    pub bitrate: u16,
    /// Modem enabled after configuration
    #[serde(default = "default_true")]
    pub on: bool,
}

impl FskChannelSpec {
    /// Check frequencies and bit rate.
    pub fn validate(&self) -> Result<(), String> {
        let valid = |f: f64| f.is_finite() && f > 0.0;
        if !valid(self.f0) || !valid(self.f) {
            return Err(format!("FSK frequencies must be positive, got f0={} f={}", self.f0, self.f));
        }
        if self.bitrate == 0 {
            return Err("FSK bitrate must be positive".to_string());
        }
        Ok(())
    }
}

/// Board-specific options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardOptions {
    /// Outputs driven by pattern generators, bit n = output n
    #[serde(default)]
    pub pattern_mask: Option<u16>,
    /// Analog change threshold in volts
    #[serde(default)]
    pub trigger_threshold: Option<f64>,
}

fn default_baud() -> u32 {
    9600
}

fn default_stop_bits() -> u8 {
    1
}

fn default_data_bits() -> u8 {
    8
}

fn default_fsk_bitrate() -> u16 {
    1200
}

fn default_true() -> bool {
    true
}

/// Default analog trigger threshold in volts.
pub const DEFAULT_TRIGGER_THRESHOLD: f64 = 0.01;

impl BoardSpec {
    /// Declaration for one channel kind, if present. COM and FSK are not `IoBlock`s.
    pub fn io_block(&self, kind: ChannelKind) -> Option<&IoBlock> {
        match kind {
            ChannelKind::DigitalOut => self.digital_out.as_ref(),
            ChannelKind::DigitalIn => self.digital_in.as_ref(),
            ChannelKind::AnalogOut => self.analog_out.as_ref(),
            ChannelKind::AnalogIn => self.analog_in.as_ref(),
            ChannelKind::Com | ChannelKind::Fsk => None,
        }
    }

    /// Number of channels of one kind declared on this board.
    pub fn channel_count(&self, kind: ChannelKind) -> usize {
        match kind {
            ChannelKind::Com => self.com.as_ref().map_or(0, |c| c.channels.len()),
            ChannelKind::Fsk => self.fsk.as_ref().map_or(0, |c| c.channels.len()),
            _ => self.io_block(kind).map_or(0, |b| b.channels.len()),
        }
    }

    fn declares(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Com => self.com.is_some(),
            ChannelKind::Fsk => self.fsk.is_some(),
            _ => self.io_block(kind).is_some(),
        }
    }

    /// Pattern-enabled outputs. All sixteen by default on pattern boards.
    pub fn pattern_mask(&self) -> u16 {
        match self.options.pattern_mask {
            Some(mask) => mask,
            None if self.kind.has_pattern_generators() => 0xFFFF,
            None => 0,
        }
    }

    /// Analog change threshold in volts.
    pub fn trigger_threshold(&self) -> f64 {
        self.options
            .trigger_threshold
            .unwrap_or(DEFAULT_TRIGGER_THRESHOLD)
    }

    /// True when the board is addressed through a chip-select entry.
    pub fn needs_select(&self) -> bool {
        !self.spi_master && self.spi_address.is_some()
    }

    fn invalid(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::InvalidBoard {
            board: self.id.clone(),
            message: message.into(),
        }
    }

    /// Validate this board on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(self.invalid("board id must not be empty"));
        }
        if self.kind.is_bus_board() && (self.spi_master || self.spi_address.is_none()) {
            return Err(self.invalid(format!("{} needs an spi_address and cannot be the bus master", self.kind)));
        }
        if self.needs_select() {
            let pin = self
                .pin_number
                .ok_or_else(|| self.invalid("spi_address given without pin_number"))?;
            pins::require_bcm_line(pin)?;
        }
        if let Some(bit) = self.mux.iter().find(|b| **b > 1) {
            return Err(self.invalid(format!("mux bits must be 0 or 1, got {bit}")));
        }

        for kind in ChannelKind::ALL.into_iter().filter(|k| self.declares(*k)) {
            let capacity = self
                .kind
                .capacity(kind)
                .ok_or_else(|| self.invalid(format!("{} has no {kind} channels", self.kind)))?;
            self.validate_channels(kind, capacity)?;
        }
        for port in self.com.iter().flat_map(|c| &c.channels) {
            port.params.validate().map_err(|m| self.invalid(m))?;
        }
        for modem in self.fsk.iter().flat_map(|c| &c.channels) {
            modem.validate().map_err(|m| self.invalid(m))?;
        }

        if self.options.pattern_mask.is_some() && !self.kind.has_pattern_generators() {
            return Err(self.invalid(format!("{} has no pattern generators", self.kind)));
        }
        match self.options.trigger_threshold {
            Some(t) if !t.is_finite() || t < 0.0 => Err(self.invalid(format!(
                "trigger_threshold must be non-negative, got {t}"
            ))),
            _ => Ok(()),
        }
    }

    /// Count, emptiness and range of one declared channel kind against the board's capacity.
    fn validate_channels(&self, kind: ChannelKind, capacity: Capacity) -> Result<(), ConfigError> {
        let listed: &[PinSpec] = match self.io_block(kind).map(|b| &b.channels) {
            Some(ChannelList::Count(n)) if *n <= 0 => {
                return Err(self.invalid(format!("{kind} channel count must be positive, got {n}")))
            }
            Some(ChannelList::Count(_)) if capacity == Capacity::HeaderPins => {
                return Err(self.invalid(format!("{kind} channels must list header pins")))
            }
            Some(ChannelList::Pins(pins)) => pins.as_slice(),
            _ => &[][..],
        };
        let count = self.channel_count(kind);
        if count == 0 {
            return Err(self.invalid(format!("{kind} channel list is empty")));
        }
        match capacity {
            Capacity::Max(max) if count > max => Err(self.invalid(format!(
                "{count} {kind} channels declared, board has {max}"
            ))),
            Capacity::Max(max) => match listed.iter().find(|p| usize::from(p.pin) >= max) {
                Some(p) => Err(self.invalid(format!("{kind} channel {} out of range 0..{max}", p.pin))),
                None => Ok(()),
            },
            Capacity::HeaderPins => listed
                .iter()
                .try_for_each(|p| pins::require_bcm_line(p.pin).map(|_| ())),
        }
    }
}

impl TioConfig {
    /// Load an inventory file, TOML or JSON by extension, then apply `TIO_` overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Figment::new().merge(Json::file(path)),
            Some("toml") | None => Figment::new().merge(Toml::file(path)),
            Some(other) => {
                return Err(ConfigError::Load {
                    message: format!("unsupported inventory format '.{other}'"),
                })
            }
        };
        if !path.exists() {
            return Err(ConfigError::Load {
                message: format!("inventory file {} not found", path.display()),
            });
        }
        Ok(figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse an in-memory JSON inventory.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse an in-memory TOML inventory.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml)?)
    }

    /// Look up a board by id.
    pub fn board(&self, id: &str) -> Option<&BoardSpec> {
        self.boards.iter().find(|b| b.id == id)
    }

    /// Validate the whole inventory. Run once before mapping channels.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_settings()?;

        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        let mut selectors = HashSet::new();
        let mut claimed: HashSet<u8> = self.stack.reserved_pins().collect();

        for board in &self.boards {
            board.validate()?;
            if !ids.insert(board.id.as_str()) {
                return Err(ConfigError::DuplicateBoard(board.id.clone()));
            }
            if let (true, Some(address), Some(pin)) =
                (board.needs_select(), board.spi_address, board.pin_number)
            {
                if !addresses.insert(address) {
                    return Err(ConfigError::DuplicateBusAddress(address.to_string()));
                }
                if self.stack.reserved_pins().any(|p| p == pin) {
                    return Err(board.invalid(format!(
                        "chip-select pin {pin} is a multiplexer or reset line"
                    )));
                }
                if !selectors.insert((pin, board.mux)) {
                    return Err(board.invalid(format!(
                        "chip-select pin {pin} with mux {:?} is already used by another board",
                        board.mux
                    )));
                }
            }
            if board.kind == BoardKind::CpuRpi {
                for kind in [ChannelKind::DigitalOut, ChannelKind::DigitalIn] {
                    if let Some(block) = board.io_block(kind) {
                        for pin in block.channels.channel_numbers() {
                            if !claimed.insert(pin) {
                                return Err(board.invalid(format!(
                                    "header pin {pin} is already in use"
                                )));
                            }
                        }
                    }
                }
            }
        }

        if let Some(rtc) = &self.stack.rtc_board {
            let board = self
                .board(rtc)
                .ok_or_else(|| ConfigError::UnknownBoard(rtc.clone()))?;
            if !board.kind.has_status_byte() {
                return Err(ConfigError::InvalidSettings(format!(
                    "rtc_board '{rtc}' is a {} and has no clock",
                    board.kind
                )));
            }
        }
        Ok(())
    }

    fn validate_settings(&self) -> Result<(), ConfigError> {
        let s = &self.stack;
        let fail = |m: String| -> Result<(), ConfigError> { Err(ConfigError::InvalidSettings(m)) };

        if !s.tick_period_ms.is_finite() || s.tick_period_ms <= 0.0 {
            return fail(format!("tick_period_ms must be positive, got {}", s.tick_period_ms));
        }
        for pin in s.mux_pins.iter().chain(s.reset_pin.iter()).chain(s.sync_reset_pin.iter()) {
            pins::require_bcm_line(*pin)?;
        }
        if s.uart_clock_hz == 0 || s.fsk_reference_clock_hz == 0 || s.pattern_reference_clock_hz == 0 {
            return fail("reference clocks must be positive".to_string());
        }
        if !s.baud_tolerance.is_finite() || s.baud_tolerance < 0.0 {
            return fail(format!("baud_tolerance must be non-negative, got {}", s.baud_tolerance));
        }
        if !s.fsk_max_amplitude.is_finite() || s.fsk_max_amplitude <= 0.0 {
            return fail("fsk_max_amplitude must be positive".to_string());
        }
        if !s.pattern_max_frequency_hz.is_finite() || s.pattern_max_frequency_hz <= 0.0 {
            return fail("pattern_max_frequency_hz must be positive".to_string());
        }
        if s.event_capacity == 0 {
            return fail("event_capacity must be positive".to_string());
        }
        if s.log_level.parse::<tracing::Level>().is_err() {
            return fail(format!("invalid log_level '{}'", s.log_level));
        }
        Ok(())
    }
}

impl StackSettings {
    /// Header pins owned by the stack itself (mux and reset lines).
    pub fn reserved_pins(&self) -> impl Iterator<Item = u8> + '_ {
        self.mux_pins
            .iter()
            .copied()
            .chain(self.reset_pin)
            .chain(self.sync_reset_pin)
    }
}
