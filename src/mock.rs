//! Mock hardware.
//!
//! In-memory stand-ins for the SPI transport, the host GPIO lines and the
//! host clock, for tests and dry runs without a stack attached.
//!
//! All handles produced by one [`MockHardware`] share state, so a test can
//! hand the transport and lines to a [`crate::TioStack`] and keep inspecting
//! them afterwards.
//!
//! # Available Mocks
//!
//! - [`MockBus`] - records every frame; replies from a script, a responder
//!   closure, or a healthy FPGA status byte followed by zeros
//! - [`MockLines`] - records line writes, serves scripted input levels
//! - [`ManualClock`] - host time that only moves when told to
//!
//! # Example
//!
//! ```rust,ignore
//! let hw = MockHardware::new();
//! hw.push_response(vec![0x0A, 0x00, 0x01, 0, 0, 0, 0]);
//! let mut stack = TioStack::new(config, hw.bus(), hw.lines(), hw.clock())?;
//! stack.read_digital("DI00")?;
//! assert_eq!(hw.transfers().len(), 1);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;

use crate::bus::{BusTransport, GpioLines, DEVICE_ID};
use crate::clock::HostClock;
use crate::error::TransportError;

/// One recorded bus or line operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Line claimed
    Claim {
        /// BCM line
        line: u8,
        /// Claimed as output
        output: bool,
    },
    /// Output line driven
    Line {
        /// BCM line
        line: u8,
        /// Level written
        level: bool,
    },
    /// Frame clocked out
    Transfer(Vec<u8>),
    /// Line released
    Release(u8),
}

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct MockState {
    events: Vec<BusEvent>,
    levels: HashMap<u8, bool>,
    claimed: HashSet<u8>,
    responses: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    transfer_failures: VecDeque<String>,
    line_failures: HashMap<u8, String>,
}

/// Factory for mock transport, lines and clock sharing one state.
#[derive(Clone)]
pub struct MockHardware {
    state: Arc<Mutex<MockState>>,
    clock: ManualClock,
}

impl Default for MockHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHardware {
    /// Fresh mock with no scripted responses.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            clock: ManualClock::default(),
        }
    }

    /// Transport handle.
    pub fn bus(&self) -> Box<dyn BusTransport> {
        Box::new(MockBus {
            state: Arc::clone(&self.state),
        })
    }

    /// Line provider handle.
    pub fn lines(&self) -> Box<dyn GpioLines> {
        Box::new(MockLines {
            state: Arc::clone(&self.state),
        })
    }

    /// Host clock handle.
    pub fn clock(&self) -> Box<dyn HostClock> {
        Box::new(self.clock.clone())
    }

    /// The shared manual clock.
    pub fn manual_clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<BusEvent> {
        self.state.lock().events.clone()
    }

    /// Forget recorded events.
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Recorded frames, oldest first.
    pub fn transfers(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                BusEvent::Transfer(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    /// Last level written to or scripted on a line.
    pub fn line_level(&self, line: u8) -> Option<bool> {
        self.state.lock().levels.get(&line).copied()
    }

    /// Script the level an input line reads.
    pub fn set_input(&self, line: u8, level: bool) {
        self.state.lock().levels.insert(line, level);
    }

    /// Line currently claimed.
    pub fn is_claimed(&self, line: u8) -> bool {
        self.state.lock().claimed.contains(&line)
    }

    /// Queue a response for the next transfer, returned as is.
    pub fn push_response(&self, response: Vec<u8>) {
        self.state.lock().responses.push_back(response);
    }

    /// Answer transfers not covered by queued responses.
    ///
    /// Returning `None` falls back to the default reply.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Make the next transfer fail.
    pub fn fail_next_transfer(&self, message: &str) {
        self.state
            .lock()
            .transfer_failures
            .push_back(message.to_string());
    }

    /// Make every operation on a line fail until cleared.
    pub fn fail_line(&self, line: u8, message: &str) {
        self.state
            .lock()
            .line_failures
            .insert(line, message.to_string());
    }

    /// Stop failing a line.
    pub fn clear_line_failure(&self, line: u8) {
        self.state.lock().line_failures.remove(&line);
    }
}

/// Mock SPI transport.
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl BusTransport for MockBus {
    fn transfer(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        if let Some(message) = state.transfer_failures.pop_front() {
            return Err(TransportError::Transfer(message));
        }
        state.events.push(BusEvent::Transfer(frame.to_vec()));

        if let Some(response) = state.responses.pop_front() {
            return Ok(response);
        }
        if let Some(responder) = state.responder.as_mut() {
            if let Some(response) = responder(frame) {
                return Ok(response);
            }
        }
        let mut response = vec![0u8; frame.len()];
        if let Some(status) = response.first_mut() {
            *status = DEVICE_ID;
        }
        Ok(response)
    }
}

/// Mock host GPIO lines.
pub struct MockLines {
    state: Arc<Mutex<MockState>>,
}

impl MockLines {
    fn check(state: &MockState, line: u8) -> Result<(), TransportError> {
        match state.line_failures.get(&line) {
            Some(message) => Err(TransportError::Line {
                pin: line,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl GpioLines for MockLines {
    fn claim_output(&mut self, line: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check(&state, line)?;
        state.claimed.insert(line);
        state.events.push(BusEvent::Claim { line, output: true });
        Ok(())
    }

    fn claim_input(&mut self, line: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check(&state, line)?;
        state.claimed.insert(line);
        state.events.push(BusEvent::Claim {
            line,
            output: false,
        });
        Ok(())
    }

    fn write_line(&mut self, line: u8, level: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check(&state, line)?;
        state.levels.insert(line, level);
        state.events.push(BusEvent::Line { line, level });
        Ok(())
    }

    fn read_line(&mut self, line: u8) -> Result<bool, TransportError> {
        let state = self.state.lock();
        Self::check(&state, line)?;
        Ok(state.levels.get(&line).copied().unwrap_or(false))
    }

    fn release(&mut self, line: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check(&state, line)?;
        state.claimed.remove(&line);
        state.events.push(BusEvent::Release(line));
        Ok(())
    }
}

/// Host clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::new(start)
    }
}

impl ManualClock {
    /// Clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_reply_is_healthy_status() {
        let hw = MockHardware::new();
        let mut bus = hw.bus();
        assert_eq!(bus.transfer(&[0x01, 0, 0]).unwrap(), vec![0x0A, 0, 0]);
    }

    #[test]
    fn test_scripted_then_responder() {
        let hw = MockHardware::new();
        hw.push_response(vec![1, 2]);
        hw.set_responder(|frame| Some(frame.iter().map(|b| b + 1).collect()));
        let mut bus = hw.bus();
        assert_eq!(bus.transfer(&[0, 0]).unwrap(), vec![1, 2]);
        assert_eq!(bus.transfer(&[5, 6]).unwrap(), vec![6, 7]);
        assert_eq!(hw.transfers(), vec![vec![0, 0], vec![5, 6]]);
    }

    #[test]
    fn test_failures() {
        let hw = MockHardware::new();
        hw.fail_next_transfer("EIO");
        let mut bus = hw.bus();
        assert!(bus.transfer(&[0]).is_err());
        assert!(bus.transfer(&[0]).is_ok());

        hw.fail_line(8, "busy");
        let mut lines = hw.lines();
        assert!(lines.write_line(8, true).is_err());
        hw.clear_line_failure(8);
        assert!(lines.write_line(8, true).is_ok());
        assert_eq!(hw.line_level(8), Some(true));
    }

    #[test]
    fn test_inputs_and_claims() {
        let hw = MockHardware::new();
        let mut lines = hw.lines();
        lines.claim_input(17).unwrap();
        assert!(hw.is_claimed(17));
        assert!(!lines.read_line(17).unwrap());
        hw.set_input(17, true);
        assert!(lines.read_line(17).unwrap());
        lines.release(17).unwrap();
        assert!(!hw.is_claimed(17));
    }

    #[test]
    fn test_manual_clock() {
        let hw = MockHardware::new();
        let clock = hw.clock();
        let start = clock.now();
        hw.manual_clock().advance(Duration::milliseconds(1024));
        assert_eq!(clock.now() - start, Duration::milliseconds(1024));
    }
}
