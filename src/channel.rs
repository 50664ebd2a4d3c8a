//! Channel mapper.
//!
//! Turns the board inventory into one flat namespace of named channels
//! (`DO00`, `AI03`, `COM1`, ...). Ordinals are assigned per channel kind in
//! inventory order and never restart between boards, so a board's channels
//! are always the contiguous range starting at its recorded start index.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{BoardKind, BoardSpec, ComChannelSpec, FskChannelSpec, TioConfig};
use crate::error::ConfigError;
use crate::protocol::BoardCodec;

/// Kind of a logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Digital output
    DigitalOut,
    /// Digital input
    DigitalIn,
    /// Analog output
    AnalogOut,
    /// Analog input
    AnalogIn,
    /// Serial port
    Com,
    /// FSK modem
    Fsk,
}

impl ChannelKind {
    /// Every kind, in the order ordinals are assigned on a board.
    pub const ALL: [ChannelKind; 6] = [
        Self::DigitalOut,
        Self::DigitalIn,
        Self::AnalogOut,
        Self::AnalogIn,
        Self::Com,
        Self::Fsk,
    ];

    /// Name prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::DigitalOut => "DO",
            Self::DigitalIn => "DI",
            Self::AnalogOut => "AO",
            Self::AnalogIn => "AI",
            Self::Com => "COM",
            Self::Fsk => "FSK",
        }
    }

    /// Channel name for a global ordinal.
    ///
    /// I/O channels are two-digit zero-padded from 0, ports are 1-based.
    pub fn channel_name(self, ordinal: usize) -> String {
        match self {
            Self::Com | Self::Fsk => format!("{}{}", self.prefix(), ordinal + 1),
            _ => format!("{}{:02}", self.prefix(), ordinal),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Cached value of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    /// Digital level
    Digital(bool),
    /// Engineering value (volts)
    Analog(f64),
    /// Serial payload
    Bytes(Vec<u8>),
}

impl ChannelValue {
    /// Digital level, if this is a digital value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Digital(b) => Some(*b),
            _ => None,
        }
    }

    /// Engineering value, if this is an analog value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Analog(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digital(b) => write!(f, "{}", u8::from(*b)),
            Self::Analog(v) => write!(f, "{v:.4}"),
            Self::Bytes(b) => write!(f, "{} bytes", b.len()),
        }
    }
}

/// Per-kind first global ordinal of a board's channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartIndices([Option<usize>; 6]);

impl StartIndices {
    fn slot(kind: ChannelKind) -> usize {
        match kind {
            ChannelKind::DigitalOut => 0,
            ChannelKind::DigitalIn => 1,
            ChannelKind::AnalogOut => 2,
            ChannelKind::AnalogIn => 3,
            ChannelKind::Com => 4,
            ChannelKind::Fsk => 5,
        }
    }

    /// First ordinal for a kind, `None` if the board has none.
    pub fn get(&self, kind: ChannelKind) -> Option<usize> {
        self.0[Self::slot(kind)]
    }

    fn set(&mut self, kind: ChannelKind, start: usize) {
        self.0[Self::slot(kind)] = Some(start);
    }
}

/// One board after mapping.
#[derive(Debug, Clone)]
pub struct BoardRecord {
    /// Position in the inventory
    pub index: usize,
    /// Inventory entry
    pub spec: BoardSpec,
    /// Frame format, fixed at build time
    pub codec: BoardCodec,
    /// First global ordinal per kind
    pub start: StartIndices,
}

impl BoardRecord {
    /// Board id.
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Board family.
    pub fn kind(&self) -> BoardKind {
        self.spec.kind
    }

    /// First digital output ordinal.
    pub fn out_start_index(&self) -> Option<usize> {
        self.start.get(ChannelKind::DigitalOut)
    }

    /// First digital input ordinal.
    pub fn in_start_index(&self) -> Option<usize> {
        self.start.get(ChannelKind::DigitalIn)
    }

    /// Number of channels of one kind.
    pub fn count(&self, kind: ChannelKind) -> usize {
        self.spec.channel_count(kind)
    }
}

/// Serial port parameters carried by a COM channel.
#[derive(Debug, Clone)]
pub struct SerialPort {
    /// Inventory declaration, updated by reconfiguration
    pub spec: ComChannelSpec,
    /// Transmitter enabled
    pub tx_enabled: bool,
}

/// One logical channel.
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    /// Stable name, e.g. `DO07`
    pub name: String,
    /// Channel kind
    pub kind: ChannelKind,
    /// Owning board (index into the board list)
    pub board: usize,
    /// Position among the board's channels of this kind
    pub local_index: usize,
    /// Physical channel: header pin on host boards, in-board number elsewhere
    pub channel: u8,
    /// Global ordinal within the kind
    pub ordinal: usize,
    /// Pattern generator driving this output, 1-based
    pub pattern_generator: Option<u8>,
    /// Serial parameters, COM channels only
    pub serial: Option<SerialPort>,
    /// Modem parameters, FSK channels only
    pub fsk: Option<FskChannelSpec>,
    last_value: Option<ChannelValue>,
}

impl ChannelEntry {
    /// Last value read or written, `None` before the first access.
    pub fn last_value(&self) -> Option<&ChannelValue> {
        self.last_value.as_ref()
    }

    pub(crate) fn set_last_value(&mut self, value: ChannelValue) {
        self.last_value = Some(value);
    }

    /// Cached digital level, low when never written.
    pub fn cached_level(&self) -> bool {
        self.last_value
            .as_ref()
            .and_then(ChannelValue::as_bool)
            .unwrap_or(false)
    }
}

/// The flat channel namespace plus per-board bookkeeping.
#[derive(Debug, Clone)]
pub struct ChannelMap {
    boards: Vec<BoardRecord>,
    entries: Vec<ChannelEntry>,
    by_name: HashMap<String, usize>,
}

impl ChannelMap {
    /// Validate the inventory and assign every channel.
    pub fn build(config: &TioConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut counters = [0usize; 6];
        let mut boards = Vec::with_capacity(config.boards.len());
        let mut entries = Vec::new();

        for (index, spec) in config.boards.iter().enumerate() {
            let mut start = StartIndices::default();

            for kind in ChannelKind::ALL {
                let channels = channel_numbers(spec, kind);
                if channels.is_empty() {
                    continue;
                }
                let counter = &mut counters[StartIndices::slot(kind)];
                start.set(kind, *counter);

                for (local_index, channel) in channels.into_iter().enumerate() {
                    entries.push(ChannelEntry {
                        name: kind.channel_name(*counter),
                        kind,
                        board: index,
                        local_index,
                        channel,
                        ordinal: *counter,
                        pattern_generator: pattern_generator(spec, kind, local_index),
                        serial: serial_port(spec, kind, local_index),
                        fsk: modem(spec, kind, local_index),
                        last_value: None,
                    });
                    *counter += 1;
                }
            }

            debug!(
                board = %spec.id,
                kind = %spec.kind,
                out_start = ?start.get(ChannelKind::DigitalOut),
                in_start = ?start.get(ChannelKind::DigitalIn),
                "Mapped board"
            );

            boards.push(BoardRecord {
                index,
                codec: BoardCodec::for_board(spec),
                spec: spec.clone(),
                start,
            });
        }

        let mut by_name = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if by_name.insert(entry.name.clone(), i).is_some() {
                return Err(ConfigError::InvalidSettings(format!(
                    "channel name {} assigned twice",
                    entry.name
                )));
            }
        }

        Ok(Self {
            boards,
            entries,
            by_name,
        })
    }

    /// All boards in inventory order.
    pub fn boards(&self) -> &[BoardRecord] {
        &self.boards
    }

    /// Board by inventory position.
    pub fn board(&self, index: usize) -> Option<&BoardRecord> {
        self.boards.get(index)
    }

    /// Board by id.
    pub fn board_by_id(&self, id: &str) -> Result<&BoardRecord, ConfigError> {
        self.boards
            .iter()
            .find(|b| b.spec.id == id)
            .ok_or_else(|| ConfigError::UnknownBoard(id.to_string()))
    }

    /// All channels in assignment order.
    pub fn entries(&self) -> &[ChannelEntry] {
        &self.entries
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the inventory declares no channel at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a name to its position in [`Self::entries`].
    pub fn index_of(&self, name: &str) -> Result<usize, ConfigError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownChannel(name.to_string()))
    }

    /// Channel by name.
    pub fn get(&self, name: &str) -> Result<&ChannelEntry, ConfigError> {
        let index = self.index_of(name)?;
        Ok(&self.entries[index])
    }

    /// Channel by name, checked against the kind an operation needs.
    pub fn get_kind(&self, name: &str, expected: ChannelKind) -> Result<&ChannelEntry, ConfigError> {
        let entry = self.get(name)?;
        if entry.kind != expected {
            return Err(ConfigError::WrongChannelKind {
                name: name.to_string(),
                expected,
                actual: entry.kind,
            });
        }
        Ok(entry)
    }

    pub(crate) fn entry(&self, index: usize) -> &ChannelEntry {
        &self.entries[index]
    }

    pub(crate) fn entry_mut(&mut self, index: usize) -> &mut ChannelEntry {
        &mut self.entries[index]
    }

    /// Positions of a board's channels of one kind, recomputed from its start index.
    pub fn board_channel_indices(&self, board: usize, kind: ChannelKind) -> Vec<usize> {
        let Some(record) = self.boards.get(board) else {
            return Vec::new();
        };
        let Some(start) = record.start.get(kind) else {
            return Vec::new();
        };
        (start..start + record.count(kind))
            .filter_map(|ordinal| self.by_name.get(&kind.channel_name(ordinal)).copied())
            .collect()
    }
}

fn channel_numbers(spec: &BoardSpec, kind: ChannelKind) -> Vec<u8> {
    match kind {
        ChannelKind::Com | ChannelKind::Fsk => (0..spec.channel_count(kind))
            .filter_map(|c| u8::try_from(c).ok())
            .collect(),
        _ => spec
            .io_block(kind)
            .map(|block| block.channels.channel_numbers())
            .unwrap_or_default(),
    }
}

/// Generator of an output, by its position among the board's outputs.
fn pattern_generator(spec: &BoardSpec, kind: ChannelKind, local_index: usize) -> Option<u8> {
    if kind != ChannelKind::DigitalOut || !spec.kind.has_pattern_generators() || local_index >= 16 {
        return None;
    }
    let enabled = spec.pattern_mask() & (1 << local_index) != 0;
    (enabled && local_index % 2 == 0).then(|| (local_index / 2 + 1) as u8)
}

fn serial_port(spec: &BoardSpec, kind: ChannelKind, local_index: usize) -> Option<SerialPort> {
    if kind != ChannelKind::Com {
        return None;
    }
    spec.com
        .as_ref()
        .and_then(|c| c.channels.get(local_index))
        .map(|port| SerialPort {
            spec: port.clone(),
            tx_enabled: false,
        })
}

fn modem(spec: &BoardSpec, kind: ChannelKind, local_index: usize) -> Option<FskChannelSpec> {
    if kind != ChannelKind::Fsk {
        return None;
    }
    spec.fsk
        .as_ref()
        .and_then(|f| f.channels.get(local_index))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_digital_boards() -> TioConfig {
        TioConfig::from_json_str(
            r#"{ "boards": [
                { "id": "A", "type": "HS-GPIO32", "spi_address": 1, "pin_number": 24,
                  "DO": { "channels": 16 }, "DI": { "channels": 16 } },
                { "id": "B", "type": "HS-GPIO32", "spi_address": 2, "pin_number": 26,
                  "DO": { "channels": 16 }, "DI": { "channels": 16 },
                  "options": { "pattern_mask": 15 } }
            ] }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_second_board_starts_after_first() {
        let map = ChannelMap::build(&two_digital_boards()).unwrap();

        let do16 = map.get("DO16").unwrap();
        assert_eq!(do16.board, 1);
        assert_eq!(do16.local_index, 0);
        assert_eq!(map.boards()[1].out_start_index(), Some(16));
        assert_eq!(map.boards()[1].in_start_index(), Some(16));
        assert_eq!(map.boards()[0].out_start_index(), Some(0));
        assert_eq!(map.len(), 64);
    }

    #[test]
    fn test_names_are_dense() {
        let map = ChannelMap::build(&two_digital_boards()).unwrap();
        for ordinal in 0..32 {
            assert!(map.get(&format!("DO{ordinal:02}")).is_ok());
            assert!(map.get(&format!("DI{ordinal:02}")).is_ok());
        }
        assert!(map.get("DO32").is_err());
    }

    #[test]
    fn test_board_channel_indices_follow_start_index() {
        let map = ChannelMap::build(&two_digital_boards()).unwrap();
        let outputs = map.board_channel_indices(1, ChannelKind::DigitalOut);
        assert_eq!(outputs.len(), 16);
        assert_eq!(map.entry(outputs[0]).name, "DO16");
        assert_eq!(map.entry(outputs[15]).name, "DO31");
        assert!(map.board_channel_indices(1, ChannelKind::AnalogIn).is_empty());
    }

    #[test]
    fn test_pattern_generators() {
        let map = ChannelMap::build(&two_digital_boards()).unwrap();
        // default mask: every even output gets a generator
        assert_eq!(map.get("DO00").unwrap().pattern_generator, Some(1));
        assert_eq!(map.get("DO01").unwrap().pattern_generator, None);
        assert_eq!(map.get("DO14").unwrap().pattern_generator, Some(8));
        // mask 0b1111 on board B
        assert_eq!(map.get("DO16").unwrap().pattern_generator, Some(1));
        assert_eq!(map.get("DO18").unwrap().pattern_generator, Some(2));
        assert_eq!(map.get("DO20").unwrap().pattern_generator, None);
    }

    #[test]
    fn test_pattern_generators_follow_output_position() {
        let config = TioConfig::from_json_str(
            r#"{ "boards": [
                { "id": "A", "type": "HS-GPIO32", "spi_address": 1, "pin_number": 24,
                  "DO": { "channels": [{ "pin": 5 }, { "pin": 6 }, { "pin": 9 }] } }
            ] }"#,
        )
        .unwrap();
        let map = ChannelMap::build(&config).unwrap();

        assert_eq!(map.get("DO00").unwrap().channel, 5);
        assert_eq!(map.get("DO00").unwrap().pattern_generator, Some(1));
        assert_eq!(map.get("DO01").unwrap().pattern_generator, None);
        assert_eq!(map.get("DO02").unwrap().channel, 9);
        assert_eq!(map.get("DO02").unwrap().pattern_generator, Some(2));
    }

    #[test]
    fn test_pin_lists_and_ports() {
        let config = TioConfig::from_json_str(
            r#"{ "boards": [
                { "id": "CPU", "type": "CPU-RPI", "spi_master": true,
                  "DO": { "channels": [{ "pin": 11 }, { "pin": 13 }] } },
                { "id": "C1", "type": "HS-FSKCOM", "spi_address": 3, "pin_number": 24,
                  "COM": { "channels": [{ "baud": 4800 }, { "protocol": "RS422" }] },
                  "FSK": { "channels": [{ "f0": 1200, "f": 2200 }, { "f0": 1300, "f": 2100 }] } },
                { "id": "C2", "type": "HS-FSKCOM", "spi_address": 5, "pin_number": 26,
                  "COM": { "channels": [{}] } }
            ] }"#,
        )
        .unwrap();
        let map = ChannelMap::build(&config).unwrap();

        let do01 = map.get("DO01").unwrap();
        assert_eq!(do01.channel, 13);
        assert_eq!(do01.pattern_generator, None);

        let com1 = map.get("COM1").unwrap();
        assert_eq!(com1.serial.as_ref().unwrap().spec.params.baud, 4800);
        assert_eq!(map.get("COM3").unwrap().board, 2);
        assert_eq!(map.get("COM3").unwrap().local_index, 0);
        assert_eq!(map.get("FSK2").unwrap().fsk.unwrap().f0, 1300.0);
        assert!(map.get("FSK3").is_err());
    }

    #[test]
    fn test_wrong_kind() {
        let map = ChannelMap::build(&two_digital_boards()).unwrap();
        let err = map.get_kind("DI03", ChannelKind::DigitalOut).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::WrongChannelKind {
                actual: ChannelKind::DigitalIn,
                ..
            }
        ));
        assert!(matches!(
            map.get("XX99"),
            Err(ConfigError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_malformed_inventory_rejected() {
        let mut config = two_digital_boards();
        config.boards[1].id = "A".into();
        assert!(ChannelMap::build(&config).is_err());
    }

    #[test]
    fn test_values_start_empty() {
        let map = ChannelMap::build(&two_digital_boards()).unwrap();
        assert!(map.entries().iter().all(|e| e.last_value().is_none()));
        assert!(!map.get("DO00").unwrap().cached_level());
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(ChannelKind::DigitalOut.channel_name(7), "DO07");
        assert_eq!(ChannelKind::AnalogIn.channel_name(123), "AI123");
        assert_eq!(ChannelKind::Com.channel_name(0), "COM1");
        assert_eq!(ChannelKind::Fsk.channel_name(1), "FSK2");
    }
}
