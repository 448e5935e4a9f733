//! Channel backends.
//!
//! A channel is a named process variable on some control system: a demand
//! set-point, a readback, a status word. Backends expose three operations
//! on channels by name:
//!
//! - `get`: read the current value
//! - `put`: write a new value and wait until the backend accepted it
//! - `monitor`: stream value and connection changes
//!
//! The wire protocol behind a backend is not part of this crate;
//! [`crate::drivers::mock::MockChannelBackend`] keeps every channel in memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use daq_core::error::AppResult;

/// A channel's value together with whether its source is reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelValue {
    /// Last value read.
    pub value: Value,
    /// False once the source went away; `value` is then stale.
    pub connected: bool,
}

impl ChannelValue {
    /// Connected value.
    pub fn connected(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            connected: true,
        }
    }
}

/// Live view of one channel.
pub struct ChannelMonitor {
    channel: String,
    rx: watch::Receiver<ChannelValue>,
}

impl ChannelMonitor {
    /// Monitor of `channel` fed by `rx`.
    pub fn new(channel: impl Into<String>, rx: watch::Receiver<ChannelValue>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Latest value without waiting.
    pub fn current(&self) -> ChannelValue {
        self.rx.borrow().clone()
    }

    /// Wait for the next change. `None` when the backend dropped the channel.
    pub async fn changed(&mut self) -> Option<ChannelValue> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

/// Access to named channels.
#[async_trait]
pub trait ChannelBackend: Send + Sync {
    /// Read the current value of `channel`.
    ///
    /// # Errors
    ///
    /// `Channel` if the channel is unknown or disconnected.
    async fn get(&self, channel: &str) -> AppResult<Value>;

    /// Write `value` to `channel`.
    ///
    /// Returns once the backend has accepted the write. Readbacks linked to
    /// the channel may settle later.
    async fn put(&self, channel: &str, value: Value) -> AppResult<()>;

    /// Start monitoring `channel`.
    async fn monitor(&self, channel: &str) -> AppResult<ChannelMonitor>;
}
