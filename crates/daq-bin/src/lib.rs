//! Process assembly for the `daq-blocks` binary.
//!
//! Turns a [`ProcessConfig`] into a set of blocks ready to start:
//!
//! | kind       | parts                                                  |
//! |------------|--------------------------------------------------------|
//! | `detector` | `SimulatedStepsPart`                                   |
//! | `motor`    | `ChannelAttributePart` on `<MRI>:DEMAND` / `<MRI>:RBV` |
//! | `scan`     | `RunnableChildPart` driving `child`                    |
//!
//! Every block is a runnable controller. Scans are built after the blocks
//! they drive so that children are started first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use daq_core::config::{BlockDefinition, BlockKind, ProcessConfig};
use daq_core::error::{AppResult, DaqError};
use daq_core::model::{NumberType, VMeta};
use daq_core::Process;
use daq_experiment::parts::{RunnableChildPart, SimulatedStepsPart};
use daq_experiment::{RunnableController, RunnableControllerBuilder};
use daq_hardware::{ChannelAttributePart, MockChannelBackend};
use daq_server::BlockServer;

/// Everything [`assemble`] built.
pub struct Assembly {
    /// The process; start and stop it.
    pub process: Arc<Process>,
    /// Block server, registered as the last lifecycle participant.
    pub server: Arc<BlockServer>,
    /// Runnable controllers by MRI.
    pub blocks: HashMap<String, Arc<RunnableController>>,
    /// Channels behind every motor.
    pub channels: Arc<MockChannelBackend>,
}

impl Assembly {
    /// Runnable controller by MRI.
    pub fn block(&self, mri: &str) -> AppResult<&Arc<RunnableController>> {
        self.blocks
            .get(mri)
            .ok_or_else(|| DaqError::UnknownUnit(mri.to_string()))
    }
}

/// Build every configured block and the block server. Nothing is started.
pub fn assemble(config: &ProcessConfig) -> AppResult<Assembly> {
    config.validate()?;
    let process = Process::new(config.application.name.clone());
    let channels = Arc::new(MockChannelBackend::new());
    let mut blocks = HashMap::new();

    let (scans, others): (Vec<&BlockDefinition>, Vec<&BlockDefinition>) =
        config.blocks.iter().partition(|b| b.kind == BlockKind::Scan);
    for definition in others.into_iter().chain(scans) {
        let builder = RunnableControllerBuilder::new(definition.mri.clone())
            .with_hook_timeout(config.scan.hook_timeout());
        let builder = match definition.kind {
            BlockKind::Detector => builder
                .with_description("Simulated detector")
                .with_part(Arc::new(
                    SimulatedStepsPart::new("sim", Duration::from_millis(definition.steps_interval_ms))
                        .with_min_exposure(config.scan.min_exposure)
                        .with_fault_at_step(definition.fault_at_step),
                )),
            BlockKind::Motor => {
                let demand = format!("{}:DEMAND", definition.mri);
                let readback = format!("{}:RBV", definition.mri);
                channels.add_channel(demand.clone(), 0.0);
                channels.add_channel(readback.clone(), 0.0);
                channels.link(demand.clone(), readback.clone());
                builder.with_description("Simulated motor").with_part(Arc::new(
                    ChannelAttributePart::new(
                        "position",
                        VMeta::number(NumberType::Float64, "Motor position"),
                        channels.clone(),
                        Some(demand),
                        Some(readback),
                    )?,
                ))
            }
            BlockKind::Scan => {
                let child = definition.child.clone().ok_or_else(|| {
                    DaqError::Configuration(format!("Scan {} has no child", definition.mri))
                })?;
                builder
                    .with_description(format!("Scan driving {child}"))
                    .with_part(Arc::new(RunnableChildPart::new("child", child)))
            }
        };
        let block = builder.build(&process)?;
        blocks.insert(definition.mri.clone(), block);
    }

    let server = BlockServer::attach(&process, config.server.clone());
    process.publish(config.published_mris());
    info!(
        process = %config.application.name,
        blocks = blocks.len(),
        "Process assembled"
    );
    Ok(Assembly {
        process,
        server,
        blocks,
        channels,
    })
}
