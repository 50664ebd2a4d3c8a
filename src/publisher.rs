//! Change publisher.
//!
//! Inputs are diffed against their cached value after every read. A changed
//! input updates the cache, goes out as a [`ChangeEvent`] to every subscriber
//! and is forwarded to the external [`StateBus`]. Output writes only refresh
//! the cache and the state bus key; they raise no event.
//!
//! Subscribers receive events over a `tokio::sync::broadcast` channel. Sending
//! never blocks and needs no runtime; a subscriber that falls behind by more
//! than the configured capacity loses the oldest events.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::channel::{ChannelEntry, ChannelValue};
use crate::protocol::analog;

/// External key/value and publish/subscribe store.
///
/// Written to, never read back as the source of truth.
pub trait StateBus: Send + Sync {
    /// Broadcast a channel change.
    fn publish(&self, channel: &str, value: &ChannelValue);

    /// Read an externally visible key.
    fn get(&self, key: &str) -> Option<Value>;

    /// Write an externally visible key.
    fn set(&self, key: &str, value: Value);
}

/// State bus that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStateBus;

impl StateBus for NullStateBus {
    fn publish(&self, _channel: &str, _value: &ChannelValue) {}

    fn get(&self, _key: &str) -> Option<Value> {
        None
    }

    fn set(&self, _key: &str, _value: Value) {}
}

/// In-process state bus keeping the latest value of every key.
#[derive(Debug, Default)]
pub struct MemoryStateBus {
    values: RwLock<HashMap<String, Value>>,
    published: Mutex<Vec<(String, ChannelValue)>>,
}

impl MemoryStateBus {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every publication so far, oldest first.
    pub fn published(&self) -> Vec<(String, ChannelValue)> {
        self.published.lock().clone()
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// True when no key was ever set.
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl StateBus for MemoryStateBus {
    fn publish(&self, channel: &str, value: &ChannelValue) {
        self.published
            .lock()
            .push((channel.to_string(), value.clone()));
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.values.write().insert(key.to_string(), value);
    }
}

/// A published input change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Channel name
    pub channel: String,
    /// New value
    pub value: ChannelValue,
    /// Host time of the read
    pub timestamp: DateTime<Utc>,
}

impl From<&ChannelValue> for Value {
    fn from(value: &ChannelValue) -> Self {
        match value {
            ChannelValue::Digital(b) => Value::Bool(*b),
            ChannelValue::Analog(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ChannelValue::Bytes(bytes) => {
                Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
            }
        }
    }
}

/// Diffs reads against the cache and fans out changes.
pub struct ChangePublisher {
    sender: broadcast::Sender<ChangeEvent>,
    state: Arc<dyn StateBus>,
    key_prefix: String,
}

impl ChangePublisher {
    /// Publisher buffering `capacity` events per subscriber.
    pub fn new(capacity: usize, state: Arc<dyn StateBus>, key_prefix: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            state,
            key_prefix: key_prefix.into(),
        }
    }

    /// New subscriber. Sees events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// State bus key of a channel.
    pub fn state_key(&self, channel: &str) -> String {
        format!("{}{}", self.key_prefix, channel)
    }

    /// External state bus.
    pub fn state(&self) -> &Arc<dyn StateBus> {
        &self.state
    }

    /// Compare a fresh input reading with the cache and publish it if it changed.
    ///
    /// Analog readings count as changed only when they move by more than
    /// `threshold` (any first reading counts). Serial data is published
    /// whenever it is non-empty. Returns whether an event was raised.
    pub fn observe(
        &self,
        entry: &mut ChannelEntry,
        value: ChannelValue,
        threshold: f64,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let changed = match (&value, entry.last_value()) {
            (ChannelValue::Analog(new), previous) => analog::exceeds_threshold(
                previous.and_then(ChannelValue::as_f64),
                *new,
                threshold,
            ),
            (ChannelValue::Bytes(bytes), _) => !bytes.is_empty(),
            (_, previous) => previous != Some(&value),
        };
        if !changed {
            trace!(channel = %entry.name, "Input unchanged");
            return false;
        }

        entry.set_last_value(value.clone());
        self.state.set(&self.state_key(&entry.name), Value::from(&value));
        self.state.publish(&entry.name, &value);
        debug!(channel = %entry.name, value = %value, "Input changed");

        // No subscribers is not an error.
        let _ = self.sender.send(ChangeEvent {
            channel: entry.name.clone(),
            value,
            timestamp,
        });
        true
    }

    /// Cache an output write and mirror it to the state bus, without an event.
    pub fn record_output(&self, entry: &mut ChannelEntry, value: ChannelValue) {
        self.state.set(&self.state_key(&entry.name), Value::from(&value));
        entry.set_last_value(value);
    }
}
