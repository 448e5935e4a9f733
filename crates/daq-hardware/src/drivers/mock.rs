//! Mock channel backend
//!
//! Keeps every channel in a `tokio::sync::watch` so monitors see changes
//! immediately. A demand channel can be linked to a readback, which then
//! follows every put after a settle delay, the way a motor readback trails
//! its set-point.
//!
//! # Performance Characteristics
//!
//! - get/monitor: no delay
//! - put: completes immediately; linked readback updates after `settle`
//!   (0ms unless configured)

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

use daq_core::error::{AppResult, DaqError};

use crate::backend::{ChannelBackend, ChannelMonitor, ChannelValue};

/// In-memory channels.
///
/// # Example
///
/// ```rust,ignore
/// let backend = MockChannelBackend::new();
/// backend.add_channel("M1:DEMAND", 0.0);
/// backend.add_channel("M1:RBV", 0.0);
/// backend.link("M1:DEMAND", "M1:RBV");
/// backend.put("M1:DEMAND", 5.0.into()).await?;
/// assert_eq!(backend.get("M1:RBV").await?, 5.0);
/// ```
#[derive(Default)]
pub struct MockChannelBackend {
    channels: DashMap<String, watch::Sender<ChannelValue>>,
    links: DashMap<String, String>,
    settle: Duration,
}

impl MockChannelBackend {
    /// Backend with no channels and instant settling.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before a linked readback follows a put.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Create (or replace) a connected channel.
    pub fn add_channel(&self, name: impl Into<String>, initial: impl Into<Value>) {
        let value = ChannelValue::connected(initial);
        match self.channels.entry(name.into()) {
            Entry::Occupied(existing) => {
                existing.get().send_replace(value);
            }
            Entry::Vacant(slot) => {
                slot.insert(watch::channel(value).0);
            }
        }
    }

    /// Make `readback` follow every put to `demand`.
    pub fn link(&self, demand: impl Into<String>, readback: impl Into<String>) {
        self.links.insert(demand.into(), readback.into());
    }

    /// Change a channel's value from the "hardware" side.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> AppResult<()> {
        self.with_sender(name, |tx| {
            tx.send_replace(ChannelValue::connected(value));
        })
    }

    /// Mark a channel's source as gone, keeping its last value.
    pub fn disconnect(&self, name: &str) -> AppResult<()> {
        self.with_sender(name, |tx| tx.send_modify(|v| v.connected = false))?;
        debug!(channel = name, "Mock channel disconnected");
        Ok(())
    }

    /// Bring a disconnected channel back.
    pub fn reconnect(&self, name: &str) -> AppResult<()> {
        self.with_sender(name, |tx| tx.send_modify(|v| v.connected = true))
    }

    /// Number of live monitors on a channel.
    pub fn monitor_count(&self, name: &str) -> usize {
        self.channels.get(name).map_or(0, |tx| tx.receiver_count())
    }

    fn with_sender<R>(&self, name: &str, f: impl FnOnce(&watch::Sender<ChannelValue>) -> R) -> AppResult<R> {
        self.channels
            .get(name)
            .map(|tx| f(&tx))
            .ok_or_else(|| DaqError::Channel(format!("no channel named '{name}'")))
    }

    fn connected_value(&self, name: &str) -> AppResult<ChannelValue> {
        let current = self.with_sender(name, |tx| tx.borrow().clone())?;
        if !current.connected {
            return Err(DaqError::Channel(format!("'{name}' is disconnected")));
        }
        Ok(current)
    }
}

#[async_trait]
impl ChannelBackend for MockChannelBackend {
    async fn get(&self, channel: &str) -> AppResult<Value> {
        Ok(self.connected_value(channel)?.value)
    }

    async fn put(&self, channel: &str, value: Value) -> AppResult<()> {
        self.connected_value(channel)?;
        self.with_sender(channel, |tx| {
            tx.send_replace(ChannelValue::connected(value.clone()));
        })?;
        let readback = self.links.get(channel).map(|r| r.clone());
        if let Some(readback) = readback {
            if !self.settle.is_zero() {
                sleep(self.settle).await;
            }
            self.set(&readback, value)?;
        }
        Ok(())
    }

    async fn monitor(&self, channel: &str) -> AppResult<ChannelMonitor> {
        let rx = self.with_sender(channel, watch::Sender::subscribe)?;
        Ok(ChannelMonitor::new(channel, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn linked_readback_follows_put() {
        let backend = MockChannelBackend::new();
        backend.add_channel("M1:DEMAND", 0.0);
        backend.add_channel("M1:RBV", 0.0);
        backend.link("M1:DEMAND", "M1:RBV");
        backend.put("M1:DEMAND", json!(4.5)).await.unwrap();
        assert_eq!(backend.get("M1:RBV").await.unwrap(), json!(4.5));
    }

    #[tokio::test]
    async fn disconnected_channel_refuses_access() {
        let backend = MockChannelBackend::new();
        backend.add_channel("X", 1);
        backend.disconnect("X").unwrap();
        assert!(matches!(backend.get("X").await, Err(DaqError::Channel(_))));
        assert!(backend.put("X", json!(2)).await.is_err());
        backend.reconnect("X").unwrap();
        assert_eq!(backend.get("X").await.unwrap(), json!(1));
        assert!(backend.get("missing").await.is_err());
    }

    #[tokio::test]
    async fn monitor_sees_changes_and_disconnects() {
        let backend = MockChannelBackend::new();
        backend.add_channel("X", 1);
        let mut monitor = backend.monitor("X").await.unwrap();
        assert_eq!(monitor.current(), ChannelValue::connected(1));
        backend.set("X", 2).unwrap();
        assert_eq!(monitor.changed().await.unwrap(), ChannelValue::connected(2));
        backend.disconnect("X").unwrap();
        assert!(!monitor.changed().await.unwrap().connected);
        assert_eq!(backend.monitor_count("X"), 1);
    }
}
