//! Attribute mirroring a hardware channel.
//!
//! ```text
//!   put(attr) ─► backend.put(demand) ─► backend.get(readback) ─► attr.value
//!   monitor(readback) ─► attr.value            (connected)
//!                     ─► attr.alarm = INVALID  (disconnected)
//! ```
//!
//! The part connects on Reset: it reads the readback, makes the attribute
//! writeable when there is a demand channel and starts the monitor. Halt
//! and Disable stop the monitor again.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use daq_core::error::{AppResult, DaqError};
use daq_core::model::{Alarm, AttributeModel, BlockModel, Field, VMeta};
use daq_core::{Controller, Part, PartContext};

use crate::backend::{ChannelBackend, ChannelMonitor};

/// Attribute `name` backed by a demand and/or readback channel.
pub struct ChannelAttributePart {
    name: String,
    meta: VMeta,
    backend: Arc<dyn ChannelBackend>,
    demand: Option<String>,
    readback: Option<String>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelAttributePart {
    /// Part publishing attribute `name` described by `meta`.
    ///
    /// # Errors
    ///
    /// `Configuration` if neither a demand nor a readback channel is given.
    pub fn new(
        name: impl Into<String>,
        meta: VMeta,
        backend: Arc<dyn ChannelBackend>,
        demand: Option<String>,
        readback: Option<String>,
    ) -> AppResult<Self> {
        let name = name.into();
        if demand.is_none() && readback.is_none() {
            return Err(DaqError::Configuration(format!(
                "'{name}' needs a demand or a readback channel"
            )));
        }
        Ok(Self {
            name,
            meta: meta.writeable(false),
            backend,
            demand,
            readback,
            monitor: Mutex::new(None),
        })
    }

    /// Channel the attribute value is read from.
    fn readback(&self) -> &str {
        self.readback
            .as_deref()
            .or(self.demand.as_deref())
            .unwrap_or_default()
    }

    fn stop_monitor(&self) {
        if let Some(task) = self.monitor.lock().take() {
            task.abort();
            debug!(attribute = %self.name, "Channel monitor stopped");
        }
    }
}

async fn mirror(attribute: String, controller: Weak<Controller>, mut monitor: ChannelMonitor) {
    while let Some(update) = monitor.changed().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        let result = controller.transaction(|tx| {
            if update.connected {
                tx.set_value(&attribute, update.value.clone())?;
                tx.set_alarm(&attribute, Alarm::ok())
            } else {
                tx.set_alarm(
                    &attribute,
                    Alarm::disconnected(format!("{} disconnected", monitor.channel())),
                )
            }
        });
        if let Err(err) = result {
            warn!(%attribute, error = %err, "Failed to mirror channel update");
        }
    }
}

#[async_trait]
impl Part for ChannelAttributePart {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&self, block: &mut BlockModel) -> AppResult<()> {
        block.add_field(&self.name, Field::Attribute(AttributeModel::new(self.meta.clone())))
    }

    async fn init(&self, ctx: &PartContext) -> AppResult<()> {
        let Some(demand) = self.demand.clone() else {
            return Ok(());
        };
        let backend = self.backend.clone();
        let readback = self.readback().to_string();
        let attribute = self.name.clone();
        let controller = Arc::downgrade(ctx.controller());
        ctx.controller().register_writer(
            self.name.clone(),
            Arc::new(move |value: Value| {
                let backend = backend.clone();
                let demand = demand.clone();
                let readback = readback.clone();
                let attribute = attribute.clone();
                let controller = controller.clone();
                async move {
                    backend.put(&demand, value).await?;
                    let actual = backend.get(&readback).await?;
                    let controller = controller
                        .upgrade()
                        .ok_or_else(|| DaqError::Internal(format!("{attribute} outlived its block")))?;
                    controller.set_value(&attribute, actual)
                }
                .boxed()
            }),
        );
        Ok(())
    }

    async fn reset(&self, ctx: &PartContext) -> AppResult<()> {
        self.stop_monitor();
        let readback = self.readback();
        let value = self.backend.get(readback).await?;
        ctx.controller().transaction(|tx| {
            tx.set_value(&self.name, value)?;
            tx.set_alarm(&self.name, Alarm::ok())?;
            tx.set_writeable(&self.name, self.demand.is_some())
        })?;
        let monitor = self.backend.monitor(readback).await?;
        let task = tokio::spawn(mirror(self.name.clone(), Arc::downgrade(ctx.controller()), monitor));
        *self.monitor.lock() = Some(task);
        info!(attribute = %self.name, channel = readback, "Channel connected");
        Ok(())
    }

    async fn halt(&self, ctx: &PartContext) -> AppResult<()> {
        self.stop_monitor();
        ctx.controller().transaction(|tx| tx.set_writeable(&self.name, false))
    }

    async fn disable(&self, ctx: &PartContext) -> AppResult<()> {
        self.halt(ctx).await
    }
}

impl Drop for ChannelAttributePart {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}
