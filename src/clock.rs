//! Host-to-stack clock correlation.
//!
//! Every board runs a tick counter that is zeroed by the synchronized clock
//! reset. The host records the instant of that reset (`reset_epoch`) and
//! converts requested execution times into ticks relative to it:
//!
//! ```text
//! tick = round((when - reset_epoch) / tick_period_ms)
//! ```
//!
//! The tick travels in the command frame and the board's own clock fires the
//! action; nothing here schedules work on the host.
//!
//! Tick 0 means "execute now". It is used whenever no time is given, the
//! time is already past, or the offset does not fit the 32-bit tick field.

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::error::ProtocolWarning;

/// Source of host wall-clock time.
pub trait HostClock: Send {
    /// Current host time.
    fn now(&self) -> DateTime<Utc>;
}

/// Host clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl HostClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Correlation between host time and stack ticks.
#[derive(Debug, Clone)]
pub struct ClockCorrelation {
    reset_epoch: Option<DateTime<Utc>>,
    tick_period_ms: f64,
}

impl ClockCorrelation {
    /// New correlation with no reset recorded yet.
    pub fn new(tick_period_ms: f64) -> Self {
        Self {
            reset_epoch: None,
            tick_period_ms,
        }
    }

    /// Record a stack clock reset at `now`.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.reset_epoch = Some(now);
    }

    /// Host time of the last reset.
    pub fn reset_epoch(&self) -> Option<DateTime<Utc>> {
        self.reset_epoch
    }

    /// Tick duration in milliseconds.
    pub fn tick_period_ms(&self) -> f64 {
        self.tick_period_ms
    }

    /// Tick for a requested execution time, or the reason it must run now.
    ///
    /// `Ok(0)` for immediate execution that is not an anomaly (no time, the
    /// Unix epoch, or a time not after `now`).
    pub fn resolve(
        &self,
        when: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<u32, ProtocolWarning> {
        let Some(when) = when else {
            return Ok(0);
        };
        if when.timestamp_millis() == 0 || when <= now {
            return Ok(0);
        }
        let Some(epoch) = self.reset_epoch else {
            return Err(ProtocolWarning::ClockNotReset);
        };

        let delta = when - epoch;
        let delta_ms = match delta.num_microseconds() {
            Some(us) => us as f64 / 1000.0,
            None => delta.num_milliseconds() as f64,
        };
        let ticks = (delta_ms / self.tick_period_ms).round();
        if !(0.0..=f64::from(u32::MAX)).contains(&ticks) {
            return Err(ProtocolWarning::TickOverflow {
                delta_ms: delta.num_milliseconds(),
            });
        }
        Ok(ticks as u32)
    }

    /// Like [`Self::resolve`], logging the anomaly and falling back to tick 0.
    pub fn tick_for(&self, when: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u32 {
        match self.resolve(when, now) {
            Ok(tick) => tick,
            Err(warning) => {
                warn!(when = ?when, "{warning}");
                0
            }
        }
    }

    /// Host time of a stack tick, if the clock was ever reset.
    pub fn tick_to_host(&self, ticks: u32) -> Option<DateTime<Utc>> {
        let micros = (f64::from(ticks) * self.tick_period_ms * 1000.0).round() as i64;
        self.reset_epoch
            .map(|epoch| epoch + Duration::microseconds(micros))
    }
}
