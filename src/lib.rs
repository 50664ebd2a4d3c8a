//! # Tactical I/O Stack
//!
//! Hardware abstraction layer for a modular stack of I/O boards sharing one
//! SPI bus behind a chip-select and 3-bit multiplexer scheme. Applications
//! address named channels (`DO07`, `AI03`, `COM1`, `FSK2`); the crate maps each
//! name to its board, encodes the board's command frame, runs the selected
//! bus transaction and publishes input changes to subscribers.
//!
//! ## Crate Structure
//!
//! - **`config`**: Inventory and stack settings, loaded with `figment` from
//!   JSON or TOML plus `TIO_` environment overrides.
//! - **`channel`**: The channel mapper. Flat, stable channel names and
//!   per-board bookkeeping.
//! - **`bits`**: Fixed-width bit-field codec shared by the encoders.
//! - **`bus`**: Bus addressing. Chip-select and multiplexer lines, scoped
//!   selection, status byte checks.
//! - **`protocol`**: Per-board frame encoders and decoders.
//! - **`clock`**: Host to stack tick correlation for scheduled commands.
//! - **`publisher`**: Change detection and fan-out.
//! - **`stack`**: [`TioStack`], the logical API tying it all together.
//! - **`mock`**: In-memory transport, lines and clock.
//! - **`logging`**: `tracing` subscriber setup.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tio_stack::{mock::MockHardware, TioConfig, TioStack};
//!
//! let config = TioConfig::load("config/inventory.example.toml")?;
//! let hw = MockHardware::new();
//! let mut stack = TioStack::new(&config, hw.bus(), hw.lines(), hw.clock())?;
//! stack.init()?;
//! stack.write_digital("DO00", true, None)?;
//! let mut changes = stack.subscribe();
//! stack.read_digital_block("gpio-a")?;
//! ```

pub mod bits;
pub mod bus;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod mock;
pub mod pins;
pub mod protocol;
pub mod publisher;
pub mod stack;

pub use bits::BitSource;
pub use bus::{BusTransport, GpioLines};
pub use channel::{ChannelEntry, ChannelKind, ChannelMap, ChannelValue};
pub use clock::{HostClock, SystemClock};
pub use config::{BoardKind, BoardSpec, FskChannelSpec, SerialParams, StackSettings, TioConfig};
pub use error::{ConfigError, ProtocolWarning, Result, TioError, TransportError};
pub use publisher::{ChangeEvent, MemoryStateBus, StateBus};
pub use stack::{FrequencyRequest, TioStack};
