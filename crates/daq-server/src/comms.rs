//! Block server: what a boundary adapter talks to.
//!
//! The adapter asks [`BlockServer::test_channel`] whether a name is servable,
//! gets a [`SharedChannel`] from [`BlockServer::make_channel`] and connects
//! its clients to it. Channel names are `mri` or `mri.field`; only published
//! blocks are served.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, instrument, warn};

use daq_core::config::ServerConfig;
use daq_core::error::{AppResult, DaqError};
use daq_core::{Controller, Process, ProcessLifecycle};

use crate::channel::SharedChannel;

/// Serves published blocks over shared channels.
pub struct BlockServer {
    process: Arc<Process>,
    config: ServerConfig,
    channels: DashMap<String, Arc<SharedChannel>>,
}

/// Split `name` into MRI and field. A published MRI may itself contain
/// dots, so the whole name is tried first and then split at the last dot.
fn split_channel_name<'a>(name: &'a str, published: &[String]) -> (&'a str, Option<&'a str>) {
    if published.iter().any(|m| m == name) {
        return (name, None);
    }
    match name.rsplit_once('.') {
        Some((mri, field)) => (mri, Some(field)),
        None => (name, None),
    }
}

impl BlockServer {
    /// Server over `process`, not yet registered with it.
    pub fn new(process: &Arc<Process>, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            process: Arc::clone(process),
            config,
            channels: DashMap::new(),
        })
    }

    /// Server registered as a lifecycle participant of `process`, so it is
    /// stopped (and its clients disconnected) before the blocks.
    pub fn attach(process: &Arc<Process>, config: ServerConfig) -> Arc<Self> {
        let server = Self::new(process, config);
        process.add_participant(server.clone());
        server
    }

    /// MRI and field `name` refers to, if it is servable.
    fn resolve<'a>(&self, name: &'a str) -> AppResult<(&'a str, Option<&'a str>)> {
        let published = self.process.published();
        let (mri, field) = split_channel_name(name, &published);
        if !published.iter().any(|m| m == mri) {
            return Err(DaqError::UnknownUnit(mri.to_string()));
        }
        let controller: Arc<Controller> = self.process.lookup(mri)?;
        if let Some(field) = field {
            if !controller.with_block(|b| b.field(field).is_some()) {
                return Err(DaqError::NoSuchPath(name.to_string()));
            }
        }
        Ok((mri, field))
    }

    /// Whether `name` currently resolves to something servable.
    pub fn test_channel(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// Channel for `name`, created on first use.
    pub fn make_channel(&self, name: &str) -> AppResult<Arc<SharedChannel>> {
        let (mri, field) = self.resolve(name)?;
        let channel = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| {
                SharedChannel::new(
                    Arc::clone(&self.process),
                    mri,
                    field.map(str::to_string),
                    self.config.channel_capacity,
                    self.config.lifecycle_timeout(),
                )
            })
            .value()
            .clone();
        Ok(channel)
    }

    /// Channels created so far and not yet closed.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Replace the published list. Clients of blocks that are no longer
    /// published are disconnected.
    #[instrument(skip(self), err)]
    pub async fn publish(&self, mris: Vec<String>) -> AppResult<()> {
        let previous: HashSet<String> = self.process.published().into_iter().collect();
        let dropped: Vec<String> = previous.into_iter().filter(|m| !mris.contains(m)).collect();
        self.process.publish(mris);
        if dropped.is_empty() {
            return Ok(());
        }
        self.disconnect_clients(&dropped).await
    }

    /// Force-close every channel of the given blocks, each bounded by the
    /// disconnect timeout. Closing what is already closed is a no-op.
    #[instrument(skip(self), err)]
    pub async fn disconnect_clients(&self, mris: &[String]) -> AppResult<()> {
        let targets: Vec<String> = self
            .channels
            .iter()
            .filter(|e| mris.iter().any(|m| m == e.value().mri()))
            .map(|e| e.key().clone())
            .collect();
        let mut errors = Vec::new();
        for name in targets {
            let Some((_, channel)) = self.channels.remove(&name) else {
                continue;
            };
            if let Err(err) = channel.force_close(self.config.disconnect_timeout()).await {
                warn!(channel = %name, error = %err, "Failed to disconnect clients");
                errors.push(err);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DaqError::ShutdownFailed(errors)),
        }
    }
}

#[async_trait]
impl ProcessLifecycle for BlockServer {
    fn name(&self) -> &str {
        "BlockServer"
    }

    async fn on_start(&self) -> AppResult<()> {
        info!(published = ?self.process.published(), "Block server started");
        Ok(())
    }

    async fn on_stop(&self) -> AppResult<()> {
        let mris: Vec<String> = self.channels.iter().map(|e| e.value().mri().to_string()).collect();
        self.disconnect_clients(&mris).await?;
        info!("Block server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::model::{AttributeModel, BlockModel, Field, NumberType, VMeta};
    use tracing_test::traced_test;

    fn served() -> (Arc<Process>, Arc<BlockServer>) {
        let process = Process::new("server-test");
        let mut block = BlockModel::new("Unit");
        block
            .add_field(
                "value",
                Field::Attribute(AttributeModel::new(VMeta::number(NumberType::Int32, "value"))),
            )
            .unwrap();
        process.add_controller(Controller::new("UNIT", block)).unwrap();
        let server = BlockServer::new(&process, ServerConfig::default());
        (process, server)
    }

    #[tokio::test]
    async fn only_published_names_are_servable() {
        let (process, server) = served();
        process.publish(Vec::new());
        assert!(!server.test_channel("UNIT"));
        process.publish(vec!["UNIT".into()]);
        assert!(server.test_channel("UNIT"));
        assert!(server.test_channel("UNIT.value"));
        assert!(!server.test_channel("UNIT.nope"));
        assert!(!server.test_channel("OTHER"));
        assert!(matches!(server.make_channel("UNIT.nope"), Err(DaqError::NoSuchPath(_))));
    }

    #[tokio::test]
    async fn make_channel_reuses_the_same_channel() {
        let (process, server) = served();
        process.publish(vec!["UNIT".into()]);
        let a = server.make_channel("UNIT").unwrap();
        let b = server.make_channel("UNIT").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(server.channel_names(), vec!["UNIT"]);
    }

    #[test]
    fn whole_published_name_wins_over_a_split() {
        let published = vec!["BL45.SCAN".to_string()];
        assert_eq!(split_channel_name("BL45.SCAN", &published), ("BL45.SCAN", None));
        assert_eq!(
            split_channel_name("BL45.SCAN.value", &published),
            ("BL45.SCAN", Some("value"))
        );
        assert_eq!(split_channel_name("UNIT", &published), ("UNIT", None));
        assert_eq!(split_channel_name("UNIT.value", &[]), ("UNIT", Some("value")));
    }

    #[tokio::test]
    async fn dotted_mri_is_served_whole_and_by_field() {
        let (process, server) = served();
        let mut block = BlockModel::new("Scan");
        block
            .add_field(
                "value",
                Field::Attribute(AttributeModel::new(VMeta::number(NumberType::Int32, "value"))),
            )
            .unwrap();
        process.add_controller(Controller::new("BL45.SCAN", block)).unwrap();
        process.publish(vec!["BL45.SCAN".into()]);
        process.start().await.unwrap();

        assert!(server.test_channel("BL45.SCAN"));
        assert!(server.test_channel("BL45.SCAN.value"));
        assert!(!server.test_channel("BL45"));
        assert!(!server.test_channel("BL45.SCAN.nope"));

        let whole = server.make_channel("BL45.SCAN").unwrap();
        assert_eq!(whole.mri(), "BL45.SCAN");
        let field = server.make_channel("BL45.SCAN.value").unwrap();
        assert_eq!(field.mri(), "BL45.SCAN");

        let client = whole.connect().await.unwrap();
        assert!(whole.snapshot().await.unwrap().get("value").is_some());
        client.disconnect().await.unwrap();
        let client = field.connect().await.unwrap();
        assert!(field.session().await.unwrap().put_paths().contains("value"));
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn client_comings_and_goings_are_logged() {
        let (process, server) = served();
        process.publish(vec!["UNIT".into()]);
        process.start().await.unwrap();
        let client = server.make_channel("UNIT").unwrap().connect().await.unwrap();
        client.disconnect().await.unwrap();
        assert!(logs_contain("Client connected"));
        assert!(logs_contain("Client disconnected"));
    }
}
