//! The stack context object.
//!
//! [`TioStack`] owns everything the logical API needs: the channel map, the
//! bus with its select table, the host clock, the clock correlation and the
//! change publisher. Every operation takes `&mut self`, so one bus
//! transaction is in flight at a time by construction.
//!
//! ```text
//! name -> ChannelMap -> encoder -> Bus (select, transfer, deselect) -> decoder -> ChangePublisher
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bits::{self, BitSource};
use crate::bus::{Bus, BusSelectTable, BusTarget, BusTransport, GpioLines};
use crate::channel::{BoardRecord, ChannelEntry, ChannelKind, ChannelMap, ChannelValue};
use crate::clock::{ClockCorrelation, HostClock};
use crate::config::{FskChannelSpec, SerialParams, StackSettings, TioConfig};
use crate::error::{ConfigError, Result, TioError};
use crate::pins;
use crate::protocol::serial::BaudSynthesis;
use crate::protocol::{analog, digital, fsk, pattern, serial, system, BoardCodec};
use crate::publisher::{ChangeEvent, ChangePublisher, NullStateBus, StateBus};

/// Frequency and phase request for one pattern-generator output.
#[derive(Debug, Clone, Copy)]
pub struct FrequencyRequest<'a> {
    /// Output channel, e.g. `DO04`
    pub channel: &'a str,
    /// Frequency in Hz, 0 stops the generator
    pub frequency_hz: f64,
    /// Phase offset in degrees
    pub phase_deg: f64,
}

/// Hardware abstraction for one tactical I/O stack.
pub struct TioStack {
    settings: StackSettings,
    map: ChannelMap,
    bus: Bus,
    clock: Box<dyn HostClock>,
    correlation: ClockCorrelation,
    publisher: ChangePublisher,
    reset_line: Option<u8>,
    sync_reset_line: Option<u8>,
    claimed_lines: Vec<u8>,
}

fn bus_target(map: &ChannelMap, board: usize) -> Result<BusTarget<'_>> {
    let record = map
        .board(board)
        .ok_or_else(|| ConfigError::UnknownBoard(format!("#{board}")))?;
    let address = match record.spec.spi_address {
        Some(address) if record.spec.needs_select() => address,
        _ => return Err(unsupported(record, "bus transfers")),
    };
    Ok(BusTarget {
        id: record.id(),
        address,
        checks_status: record.codec.checks_status(),
    })
}

fn unsupported(record: &BoardRecord, operation: &str) -> TioError {
    ConfigError::UnsupportedOperation {
        board: record.id().to_string(),
        operation: operation.to_string(),
    }
    .into()
}

fn require_line(line: Option<u8>, what: &str) -> Result<u8> {
    Ok(line.ok_or_else(|| ConfigError::InvalidSettings(format!("no {what} line configured")))?)
}

impl TioStack {
    /// Build the stack from a validated inventory.
    ///
    /// No line or bus traffic happens until [`Self::init`].
    pub fn new(
        config: &TioConfig,
        transport: Box<dyn BusTransport>,
        lines: Box<dyn GpioLines>,
        clock: Box<dyn HostClock>,
    ) -> Result<Self> {
        let map = ChannelMap::build(config)?;
        let table = BusSelectTable::build(&config.stack, &config.boards)?;
        let settings = config.stack.clone();

        let reset_line = settings.reset_pin.map(pins::require_bcm_line).transpose()?;
        let sync_reset_line = settings
            .sync_reset_pin
            .map(pins::require_bcm_line)
            .transpose()?;

        debug!(
            boards = map.boards().len(),
            channels = map.len(),
            selectable = table.len(),
            "Stack mapped"
        );

        Ok(Self {
            publisher: ChangePublisher::new(
                settings.event_capacity,
                Arc::new(NullStateBus),
                settings.state_key_prefix.clone(),
            ),
            correlation: ClockCorrelation::new(settings.tick_period_ms),
            bus: Bus::new(transport, lines, table),
            settings,
            map,
            clock,
            reset_line,
            sync_reset_line,
            claimed_lines: Vec::new(),
        })
    }

    /// Forward changes and output state to an external state bus.
    ///
    /// Replaces the publisher, so call it before subscribing.
    pub fn with_state_bus(mut self, state: Arc<dyn StateBus>) -> Self {
        self.publisher = ChangePublisher::new(
            self.settings.event_capacity,
            state,
            self.settings.state_key_prefix.clone(),
        );
        self
    }

    /// Stack-wide settings.
    pub fn settings(&self) -> &StackSettings {
        &self.settings
    }

    /// Every mapped channel.
    pub fn channels(&self) -> &[ChannelEntry] {
        self.map.entries()
    }

    /// One channel by name.
    pub fn channel(&self, name: &str) -> Result<&ChannelEntry> {
        Ok(self.map.get(name)?)
    }

    /// Every board, in inventory order.
    pub fn boards(&self) -> &[BoardRecord] {
        self.map.boards()
    }

    /// New change subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.publisher.subscribe()
    }

    /// Host time of the last clock reset.
    pub fn reset_epoch(&self) -> Option<DateTime<Utc>> {
        self.correlation.reset_epoch()
    }

    /// Tick a command scheduled at `when` would carry right now.
    pub fn tick_for(&self, when: Option<DateTime<Utc>>) -> u32 {
        self.correlation.tick_for(when, self.clock.now())
    }

    /// Host time of a stack tick.
    pub fn tick_to_host(&self, ticks: u32) -> Option<DateTime<Utc>> {
        self.correlation.tick_to_host(ticks)
    }

    fn board_index(&self, id: &str) -> Result<usize> {
        Ok(self.map.board_by_id(id)?.index)
    }

    fn record(&self, board: usize) -> Result<&BoardRecord> {
        Ok(self
            .map
            .board(board)
            .ok_or_else(|| ConfigError::UnknownBoard(format!("#{board}")))?)
    }

    fn entry_index(&self, name: &str, kind: ChannelKind) -> Result<usize> {
        self.map.get_kind(name, kind)?;
        Ok(self.map.index_of(name)?)
    }

    fn transact<F: AsRef<[u8]>>(&mut self, board: usize, frames: &[F]) -> Result<Vec<Vec<u8>>> {
        let target = bus_target(&self.map, board)?;
        self.bus.with_board_selected(target, |tx| {
            frames
                .iter()
                .map(|frame| tx.transfer(frame.as_ref()).map_err(TioError::from))
                .collect()
        })
    }

    fn exchange<F: AsRef<[u8]>>(&mut self, board: usize, frame: F) -> Result<Vec<u8>> {
        let mut responses = self.transact(board, &[frame])?;
        Ok(responses.pop().unwrap_or_default())
    }

    fn publish_inputs<F>(&mut self, board: usize, kind: ChannelKind, threshold: f64, value_of: F)
    where
        F: Fn(&ChannelEntry) -> Option<ChannelValue>,
    {
        let now = self.clock.now();
        for index in self.map.board_channel_indices(board, kind) {
            if let Some(value) = value_of(self.map.entry(index)) {
                self.publisher
                    .observe(self.map.entry_mut(index), value, threshold, now);
            }
        }
    }

    fn record_output(&mut self, index: usize, value: ChannelValue) {
        self.publisher.record_output(self.map.entry_mut(index), value);
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Claim lines, deselect every board and bring up boards that need it.
    ///
    /// Runs sequentially; the first failure aborts.
    pub fn init(&mut self) -> Result<()> {
        for line in [self.reset_line, self.sync_reset_line].into_iter().flatten() {
            self.bus.lines().claim_output(line)?;
            self.bus.lines().write_line(line, true)?;
            self.claimed_lines.push(line);
        }

        self.bus.claim_select_lines()?;
        self.claim_host_channels()?;
        self.bring_up_expanders()?;

        info!(
            boards = self.map.boards().len(),
            channels = self.map.len(),
            "Stack initialized"
        );
        Ok(())
    }

    fn claim_host_channels(&mut self) -> Result<()> {
        let host: Vec<(usize, ChannelKind, u8)> = self
            .map
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| self.map.board(e.board).map(|b| b.codec) == Some(BoardCodec::HostLines))
            .map(|(i, e)| (i, e.kind, e.channel))
            .collect();

        for (index, kind, pin) in host {
            let line = pins::require_bcm_line(pin)?;
            match kind {
                ChannelKind::DigitalOut => {
                    self.bus.lines().claim_output(line)?;
                    self.bus.lines().write_line(line, false)?;
                    self.record_output(index, ChannelValue::Digital(false));
                }
                _ => self.bus.lines().claim_input(line)?,
            }
            self.claimed_lines.push(line);
        }
        Ok(())
    }

    fn bring_up_expanders(&mut self) -> Result<()> {
        let expanders: Vec<usize> = self
            .map
            .boards()
            .iter()
            .filter(|b| b.codec == BoardCodec::Expander32)
            .map(|b| b.index)
            .collect();
        for board in expanders {
            for frame in digital::init_frames() {
                self.transact(board, &[frame])?;
            }
            debug!(board = self.record(board)?.id(), "Expanders configured");
        }
        Ok(())
    }

    /// Deselect every board and release every claimed line.
    ///
    /// Best effort: failures are logged and teardown carries on.
    pub fn end(&mut self) {
        if let Err(err) = self.bus.deselect_all() {
            warn!(error = %err, "Deselect during teardown failed");
        }
        for line in std::mem::take(&mut self.claimed_lines) {
            if let Err(err) = self.bus.lines().release(line) {
                warn!(line, error = %err, "Line release failed");
            }
        }
        for err in self.bus.release_select_lines() {
            warn!(error = %err, "Select line release failed");
        }
        info!("Stack released");
    }

    /// Raw chip-select control of one board.
    pub fn select(&mut self, board: &str, enable: bool) -> Result<()> {
        let index = self.board_index(board)?;
        let address = bus_target(&self.map, index)?.address;
        self.bus.select(address, enable)
    }

    /// Pass-through transfer. With a board, it is selected around the transfer.
    pub fn spi_transfer(&mut self, board: Option<&str>, frame: &[u8]) -> Result<Vec<u8>> {
        match board {
            Some(id) => {
                let index = self.board_index(id)?;
                self.exchange(index, frame)
            }
            None => self.bus.raw_transfer(frame),
        }
    }

    fn pulse(&mut self, line: u8) -> Result<()> {
        self.bus.lines().write_line(line, false)?;
        self.bus.lines().write_line(line, true)?;
        Ok(())
    }

    /// Pulse the stack reset line, then reconfigure the port expanders.
    pub fn hw_reset(&mut self) -> Result<()> {
        let line = require_line(self.reset_line, "reset")?;
        self.pulse(line)?;
        self.bring_up_expanders()?;
        info!("Stack hardware reset");
        Ok(())
    }

    /// Pulse the synchronized clock reset line.
    pub fn hw_sync_reset(&mut self) -> Result<()> {
        let line = require_line(self.sync_reset_line, "sync reset")?;
        self.pulse(line)
    }

    /// Zero every board clock and restart the host correlation.
    ///
    /// Writes the current time to the real-time clock board when one is configured.
    pub fn reset_clock(&mut self) -> Result<()> {
        self.hw_sync_reset()?;
        let now = self.clock.now();
        if let Some(rtc) = self.settings.rtc_board.clone() {
            let index = self.board_index(&rtc)?;
            let seconds = u32::try_from(now.timestamp().max(0)).unwrap_or(u32::MAX);
            self.exchange(index, system::encode_set_rtc(seconds))?;
        }
        self.correlation.reset(now);
        info!(epoch = %now, "Stack clock reset");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // System frames
    // ---------------------------------------------------------------------

    fn system_board(&self, board: &str, operation: &str) -> Result<usize> {
        let index = self.board_index(board)?;
        let record = self.record(index)?;
        if !record.codec.has_system_frames() {
            return Err(unsupported(record, operation));
        }
        Ok(index)
    }

    /// Board type id.
    pub fn type_id(&mut self, board: &str) -> Result<u32> {
        let index = self.system_board(board, "type id")?;
        let response = self.exchange(index, system::encode_type_id())?;
        Ok(system::decode_type_id(&response)?)
    }

    /// Drive the three front-panel LEDs.
    pub fn leds(&mut self, board: &str, leds: [bool; 3]) -> Result<()> {
        let index = self.system_board(board, "LEDs")?;
        self.exchange(index, system::encode_leds(leds))?;
        Ok(())
    }

    /// Stack ticks counted by a board since the last clock reset.
    pub fn get_clock(&mut self, board: &str) -> Result<u32> {
        let index = self.system_board(board, "clock readout")?;
        let response = self.exchange(index, system::encode_get_clock())?;
        Ok(system::decode_clock(&response)?)
    }

    // ---------------------------------------------------------------------
    // Digital
    // ---------------------------------------------------------------------

    fn cached_outputs16(&self, board: usize) -> u16 {
        let mut levels = [false; digital::DIGITAL16_WIDTH];
        for index in self.map.board_channel_indices(board, ChannelKind::DigitalOut) {
            let entry = self.map.entry(index);
            if let Some(level) = levels.get_mut(usize::from(entry.channel)) {
                *level = entry.cached_level();
            }
        }
        digital::outputs_word(&levels, digital::DIGITAL16_WIDTH) as u16
    }

    /// One HS-GPIO32 block exchange. Inputs in the response are published.
    fn exchange16(&mut self, board: usize, outputs: u16, tick: u32) -> Result<u16> {
        let response = self.exchange(board, digital::encode_digital16(outputs, tick))?;
        let inputs = digital::decode_digital16(&response)?;
        self.publish_inputs(board, ChannelKind::DigitalIn, 0.0, |entry| {
            Some(ChannelValue::Digital(digital::digital16_input_level(
                inputs,
                usize::from(entry.channel),
            )))
        });
        Ok(inputs)
    }

    /// Boards without a stack clock execute at once; a requested time is dropped.
    fn warn_unscheduled(&self, board: usize, when: Option<DateTime<Utc>>) {
        if let (Some(when), Some(record)) = (when, self.map.board(board)) {
            warn!(board = record.id(), %when, "Board has no stack clock, write executes immediately");
        }
    }

    fn expander_register(&mut self, board: usize, expander: usize, register: u8) -> Result<u8> {
        let response = self.exchange(board, digital::read_frame(expander, register))?;
        Ok(digital::decode_read(&response)?)
    }

    /// Set one digital output.
    pub fn write_digital(&mut self, name: &str, value: bool, when: Option<DateTime<Utc>>) -> Result<()> {
        let index = self.entry_index(name, ChannelKind::DigitalOut)?;
        let entry = self.map.entry(index);
        let (board, channel) = (entry.board, entry.channel);
        let codec = self.record(board)?.codec;

        match codec {
            BoardCodec::HostLines => {
                self.warn_unscheduled(board, when);
                let line = pins::require_bcm_line(channel)?;
                self.bus.lines().write_line(line, value)?;
            }
            BoardCodec::Digital16 { .. } => {
                let mut word = u64::from(self.cached_outputs16(board));
                word = bits::insert_field(
                    word,
                    usize::from(channel),
                    1,
                    digital::DIGITAL16_WIDTH,
                    u64::from(value),
                );
                let tick = self.tick_for(when);
                self.exchange16(board, word as u16, tick)?;
            }
            BoardCodec::Expander32 => {
                self.warn_unscheduled(board, when);
                let (expander, offset) = digital::channel_location(channel);
                let current = self.expander_register(board, expander, digital::mcp23s17::GPIOB)?;
                let updated = bits::pack_bit(current, offset, value);
                self.exchange(board, digital::write_frame(expander, digital::mcp23s17::GPIOB, updated))?;
            }
            _ => return Err(unsupported(self.record(board)?, "digital writes")),
        }

        debug!(channel = name, value, "Digital output written");
        self.record_output(index, ChannelValue::Digital(value));
        Ok(())
    }

    /// Read one digital input. A change is published.
    pub fn read_digital(&mut self, name: &str) -> Result<bool> {
        let index = self.entry_index(name, ChannelKind::DigitalIn)?;
        let entry = self.map.entry(index);
        let (board, channel) = (entry.board, entry.channel);
        let codec = self.record(board)?.codec;

        let level = match codec {
            BoardCodec::HostLines => {
                let line = pins::require_bcm_line(channel)?;
                let level = self.bus.lines().read_line(line)?;
                let now = self.clock.now();
                self.publisher.observe(
                    self.map.entry_mut(index),
                    ChannelValue::Digital(level),
                    0.0,
                    now,
                );
                level
            }
            BoardCodec::Digital16 { .. } => {
                let outputs = self.cached_outputs16(board);
                let inputs = self.exchange16(board, outputs, 0)?;
                digital::digital16_input_level(inputs, usize::from(channel))
            }
            BoardCodec::Expander32 => {
                let (expander, offset) = digital::channel_location(channel);
                let byte = self.expander_register(board, expander, digital::mcp23s17::GPIOA)?;
                let level = bits::bit_at(byte, offset);
                let now = self.clock.now();
                self.publisher.observe(
                    self.map.entry_mut(index),
                    ChannelValue::Digital(level),
                    0.0,
                    now,
                );
                level
            }
            _ => return Err(unsupported(self.record(board)?, "digital reads")),
        };
        Ok(level)
    }

    /// Write every digital output of a board at once.
    ///
    /// `values` must be exactly as wide as the board's block (16 or 32 bits)
    /// when given as a string or bit array; integers are taken as is.
    pub fn write_digital_block(
        &mut self,
        board: &str,
        values: BitSource<'_>,
        when: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let board = self.board_index(board)?;
        let record = self.record(board)?;
        let codec = record.codec;
        let width = codec
            .block_width()
            .ok_or_else(|| unsupported(record, "digital block writes"))?;
        if let Some(actual) = values.natural_width() {
            if actual != width {
                return Err(ConfigError::BlockWidth {
                    expected: width,
                    actual,
                }
                .into());
            }
        }
        let word = values.extract(0, width, width);

        match codec {
            BoardCodec::Digital16 { .. } => {
                let tick = self.tick_for(when);
                self.exchange16(board, word as u16, tick)?;
            }
            _ => {
                self.warn_unscheduled(board, when);
                self.transact(board, &digital::block_write_frames(word as u32))?;
            }
        }

        for index in self.map.board_channel_indices(board, ChannelKind::DigitalOut) {
            let channel = usize::from(self.map.entry(index).channel);
            let level = digital::output_level(word, channel, width);
            self.record_output(index, ChannelValue::Digital(level));
        }
        debug!(board = self.record(board)?.id(), word, "Digital block written");
        Ok(())
    }

    /// Read every digital input of a board. Changed inputs are published.
    ///
    /// HS-GPIO32 returns the 16-bit input word (input k = bit k), GPIO64 the
    /// 32-bit block (input c = bit-string position c).
    pub fn read_digital_block(&mut self, board: &str) -> Result<u64> {
        let board = self.board_index(board)?;
        let codec = self.record(board)?.codec;
        match codec {
            BoardCodec::Digital16 { .. } => {
                let outputs = self.cached_outputs16(board);
                Ok(u64::from(self.exchange16(board, outputs, 0)?))
            }
            BoardCodec::Expander32 => {
                let responses = self.transact(board, &digital::block_read_frames())?;
                let mut groups = [0u8; 4];
                for (group, response) in groups.iter_mut().zip(&responses) {
                    *group = digital::decode_read(response)?;
                }
                let word = u64::from(digital::assemble_groups(groups));
                self.publish_inputs(board, ChannelKind::DigitalIn, 0.0, |entry| {
                    Some(ChannelValue::Digital(digital::output_level(
                        word,
                        usize::from(entry.channel),
                        digital::EXPANDER32_WIDTH,
                    )))
                });
                Ok(word)
            }
            _ => Err(unsupported(self.record(board)?, "digital block reads")),
        }
    }

    // ---------------------------------------------------------------------
    // Analog
    // ---------------------------------------------------------------------

    /// Set one analog output, clamped to ±10 V.
    pub fn write_analog(&mut self, name: &str, volts: f64, when: Option<DateTime<Utc>>) -> Result<()> {
        let index = self.entry_index(name, ChannelKind::AnalogOut)?;
        let entry = self.map.entry(index);
        let (board, channel) = (entry.board, entry.channel);
        let tick = self.tick_for(when);

        self.exchange(board, analog::encode_analog_out(channel, volts, tick))?;

        let written = analog::code_to_volts(analog::volts_to_code(volts));
        debug!(channel = name, volts = written, tick, "Analog output written");
        self.record_output(index, ChannelValue::Analog(written));
        Ok(())
    }

    /// Capture all analog inputs of a board. Changes beyond the trigger
    /// threshold are published.
    pub fn read_analog_block(
        &mut self,
        board: &str,
        when: Option<DateTime<Utc>>,
    ) -> Result<[f64; analog::ANALOG_IN_CHANNELS]> {
        let board = self.board_index(board)?;
        self.capture_analog(board, when)
    }

    fn capture_analog(
        &mut self,
        board: usize,
        when: Option<DateTime<Utc>>,
    ) -> Result<[f64; analog::ANALOG_IN_CHANNELS]> {
        let record = self.record(board)?;
        let BoardCodec::Analog { trigger_threshold } = record.codec else {
            return Err(unsupported(record, "analog capture"));
        };
        let tick = self.tick_for(when);
        let response = self.exchange(board, analog::encode_analog_in(tick))?;
        let volts = analog::decode_analog_in(&response)?;

        self.publish_inputs(board, ChannelKind::AnalogIn, trigger_threshold, |entry| {
            volts
                .get(usize::from(entry.channel))
                .map(|v| ChannelValue::Analog(*v))
        });
        Ok(volts)
    }

    /// Read one analog input through a board capture.
    pub fn read_analog(&mut self, name: &str) -> Result<f64> {
        let index = self.entry_index(name, ChannelKind::AnalogIn)?;
        let entry = self.map.entry(index);
        let (board, channel) = (entry.board, usize::from(entry.channel));
        let volts = self.capture_analog(board, None)?;
        Ok(volts.get(channel).copied().unwrap_or_default())
    }

    // ---------------------------------------------------------------------
    // Serial
    // ---------------------------------------------------------------------

    /// Reprogram a serial port. Returns the synthesized divisor.
    pub fn configure_com(&mut self, name: &str, params: SerialParams) -> Result<BaudSynthesis> {
        params.validate().map_err(ConfigError::InvalidParameter)?;
        let index = self.entry_index(name, ChannelKind::Com)?;
        let entry = self.map.entry(index);
        let (board, port) = (entry.board, entry.channel);

        let baud = serial::synthesize_baud(
            params.baud,
            self.settings.uart_clock_hz,
            self.settings.baud_tolerance,
        );
        self.exchange(board, serial::encode_com_config(port, &params, &baud))?;

        if let Some(port) = self.map.entry_mut(index).serial.as_mut() {
            port.spec.params = params;
        }
        debug!(channel = name, baud = params.baud, actual = baud.actual, "Serial port configured");
        Ok(baud)
    }

    /// Enable or disable a port's transmitter.
    pub fn enable_com_tx(&mut self, name: &str, enable: bool) -> Result<()> {
        let index = self.entry_index(name, ChannelKind::Com)?;
        let entry = self.map.entry(index);
        let (board, port) = (entry.board, entry.channel);
        self.exchange(board, serial::encode_tx_enable(port, enable))?;
        if let Some(port) = self.map.entry_mut(index).serial.as_mut() {
            port.tx_enabled = enable;
        }
        Ok(())
    }

    /// Send bytes on a serial port.
    pub fn write_com(&mut self, name: &str, data: &[u8], when: Option<DateTime<Utc>>) -> Result<()> {
        let index = self.entry_index(name, ChannelKind::Com)?;
        let entry = self.map.entry(index);
        let (board, port) = (entry.board, entry.channel);
        let tick = self.tick_for(when);
        let frame = serial::encode_com_write(port, tick, data)?;
        self.exchange(board, frame)?;
        debug!(channel = name, len = data.len(), tick, "Serial data written");
        Ok(())
    }

    /// Fetch received bytes from a serial port. Non-empty data is published.
    pub fn read_com(&mut self, name: &str) -> Result<Vec<u8>> {
        let index = self.entry_index(name, ChannelKind::Com)?;
        let entry = self.map.entry(index);
        let (board, port) = (entry.board, entry.channel);
        let response = self.exchange(board, serial::encode_com_read(port))?;
        let data = serial::decode_com_read(&response)?;

        let now = self.clock.now();
        self.publisher.observe(
            self.map.entry_mut(index),
            ChannelValue::Bytes(data.clone()),
            0.0,
            now,
        );
        Ok(data)
    }

    // ---------------------------------------------------------------------
    // FSK
    // ---------------------------------------------------------------------

    /// Reprogram a modem's frequencies, bit rate and on/off state.
    pub fn configure_fsk(&mut self, name: &str, spec: FskChannelSpec) -> Result<()> {
        spec.validate().map_err(ConfigError::InvalidParameter)?;
        let index = self.entry_index(name, ChannelKind::Fsk)?;
        let entry = self.map.entry(index);
        let (board, modem) = (entry.board, entry.channel);

        let frame = fsk::encode_fsk_config(modem, &spec, self.settings.fsk_reference_clock_hz);
        self.exchange(board, frame)?;
        self.map.entry_mut(index).fsk = Some(spec);
        debug!(channel = name, f0 = spec.f0, f = spec.f, on = spec.on, "FSK configured");
        Ok(())
    }

    /// Transmit bytes on a modem. `amplitude` is in millivolts.
    pub fn write_fsk(
        &mut self,
        name: &str,
        amplitude: f64,
        data: &[u8],
        continuous: bool,
        when: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let index = self.entry_index(name, ChannelKind::Fsk)?;
        let entry = self.map.entry(index);
        let (board, second) = (entry.board, entry.local_index == 1);
        let gain = fsk::amplitude_gain(amplitude, self.settings.fsk_max_amplitude);
        let tick = self.tick_for(when);
        let frame = fsk::encode_fsk_write(second, gain, continuous, tick, data)?;
        self.exchange(board, frame)?;
        debug!(channel = name, gain, continuous, tick, "FSK data written");
        Ok(())
    }

    /// Stop every modem of a board.
    pub fn stop_fsk(&mut self, board: &str) -> Result<()> {
        let index = self.board_index(board)?;
        let record = self.record(index)?;
        if record.codec != BoardCodec::Comms {
            return Err(unsupported(record, "FSK stop"));
        }
        self.exchange(index, fsk::encode_fsk_stop())?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Pattern generators
    // ---------------------------------------------------------------------

    fn generator(&self, name: &str) -> Result<(usize, u8)> {
        let entry = self.map.get_kind(name, ChannelKind::DigitalOut)?;
        let generator = entry
            .pattern_generator
            .ok_or_else(|| ConfigError::NoPatternGenerator(name.to_string()))?;
        Ok((entry.board, generator))
    }

    fn generator_setting(&self, request: FrequencyRequest<'_>) -> Result<(usize, pattern::GeneratorSetting)> {
        let (board, generator) = self.generator(request.channel)?;
        Ok((
            board,
            pattern::GeneratorSetting {
                generator,
                frequency: pattern::frequency_word(
                    request.frequency_hz,
                    self.settings.pattern_reference_clock_hz,
                    self.settings.pattern_max_frequency_hz,
                ),
                phase: pattern::phase_word(request.phase_deg),
            },
        ))
    }

    /// Load an 8-bit pattern into an output's generator.
    pub fn set_digital_pattern(&mut self, name: &str, bits: u8, when: Option<DateTime<Utc>>) -> Result<()> {
        let (board, generator) = self.generator(name)?;
        let tick = self.tick_for(when);
        self.exchange(board, pattern::encode_pattern(generator, bits, tick))?;
        Ok(())
    }

    /// Set an output generator's frequency and phase.
    pub fn set_digital_freq(&mut self, request: FrequencyRequest<'_>, when: Option<DateTime<Utc>>) -> Result<()> {
        let (board, setting) = self.generator_setting(request)?;
        let tick = self.tick_for(when);
        self.exchange(board, pattern::encode_frequency(setting, tick))?;
        debug!(channel = request.channel, hz = request.frequency_hz, tick, "Generator frequency set");
        Ok(())
    }

    /// Start two generators of the same board in one frame.
    pub fn set_digital_freq_2ch(
        &mut self,
        a: FrequencyRequest<'_>,
        b: FrequencyRequest<'_>,
        when: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let (board_a, setting_a) = self.generator_setting(a)?;
        let (board_b, setting_b) = self.generator_setting(b)?;
        if board_a != board_b {
            return Err(ConfigError::InvalidParameter(format!(
                "{} and {} are on different boards",
                a.channel, b.channel
            ))
            .into());
        }
        let tick = self.tick_for(when);
        self.exchange(board_a, pattern::encode_frequency_2ch(setting_a, setting_b, tick))?;
        Ok(())
    }

    /// Lock one output's generator to another's at a phase offset.
    pub fn set_digital_slave(
        &mut self,
        name: &str,
        master: &str,
        phase_deg: f64,
        when: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let (board, slave) = self.generator(name)?;
        let (master_board, master_generator) = self.generator(master)?;
        if board != master_board {
            return Err(ConfigError::InvalidParameter(format!(
                "{name} and {master} are on different boards"
            ))
            .into());
        }
        let tick = self.tick_for(when);
        let frame = pattern::encode_slave(slave, master_generator, pattern::phase_word(phase_deg), tick);
        self.exchange(board, frame)?;
        Ok(())
    }
}

impl std::fmt::Debug for TioStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TioStack")
            .field("boards", &self.map.boards().len())
            .field("channels", &self.map.len())
            .field("reset_epoch", &self.correlation.reset_epoch())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHardware;
    use crate::publisher::MemoryStateBus;
    use chrono::Duration;
    use tracing_test::traced_test;

    fn stack(json: &str) -> (TioStack, MockHardware) {
        let config = TioConfig::from_json_str(json).unwrap();
        let hw = MockHardware::new();
        let stack = TioStack::new(&config, hw.bus(), hw.lines(), hw.clock()).unwrap();
        (stack, hw)
    }

    const AIO: &str = r#"{ "boards": [
        { "id": "aio", "type": "HS-AIO12", "spi_address": 1, "pin_number": 24,
          "AO": { "channels": 4 }, "AI": { "channels": 8 } }
    ] }"#;

    #[test]
    #[traced_test]
    fn test_status_anomalies_are_logged_not_fatal() {
        let (mut stack, hw) = stack(AIO);
        hw.push_response(vec![0x85, 0, 0, 0, 0, 0, 0, 0]);

        stack.write_analog("AO00", 1.0, None).unwrap();

        assert!(logs_contain("does not match expected"));
        assert!(logs_contain("not reset since power-up"));
    }

    #[test]
    #[traced_test]
    fn test_delayed_write_without_reset_warns() {
        let (mut stack, hw) = stack(AIO);
        let later = hw.manual_clock().now() + Duration::seconds(2);

        stack.write_analog("AO01", 1.0, Some(later)).unwrap();

        assert!(logs_contain("stack clock never reset"));
        assert_eq!(&hw.transfers()[0][4..], &[0, 0, 0, 0]);
    }

    #[test]
    #[traced_test]
    fn test_baud_deviation_is_logged() {
        let (mut stack, _hw) = stack(
            r#"{ "boards": [
                { "id": "com", "type": "HS-FSKCOM", "spi_address": 1, "pin_number": 24,
                  "COM": { "channels": [{}] } }
            ] }"#,
        );
        let params = SerialParams {
            baud: 7_000_000,
            ..SerialParams::default()
        };

        let baud = stack.configure_com("COM1", params).unwrap();

        assert!(!baud.warnings.is_empty());
        assert!(logs_contain("synthesized as"));
    }

    #[test]
    #[traced_test]
    fn test_scheduled_expander_write_warns() {
        let (mut stack, hw) = stack(
            r#"{ "boards": [
                { "id": "io64", "type": "GPIO64", "spi_address": 1, "pin_number": 24,
                  "DO": { "channels": 32 } }
            ] }"#,
        );
        let later = hw.manual_clock().now() + Duration::seconds(2);

        stack.write_digital("DO03", true, Some(later)).unwrap();

        assert!(logs_contain("has no stack clock"));
        assert_eq!(hw.transfers().len(), 2);
    }

    #[test]
    fn test_state_bus_mirrors_values() {
        let state = Arc::new(MemoryStateBus::new());
        let (base, hw) = stack(AIO);
        let mut stack = base.with_state_bus(state.clone());
        hw.set_responder(|frame| {
            (frame[0] == crate::protocol::opcode::ANALOG_IN).then(|| {
                let mut response = vec![0x0A, 0, 0, 0, 0, 0x40, 0x00];
                response.resize(frame.len(), 0);
                response
            })
        });

        stack.write_analog("AO00", 2.0, None).unwrap();
        stack.read_analog("AI00").unwrap();

        let written = state.get("TIO.AO00").and_then(|v| v.as_f64()).unwrap();
        assert!((written - 2.0).abs() < 0.001);
        assert!(state.get("TIO.AI00").is_some());
        assert_eq!(state.published().len(), 8);
    }
}
