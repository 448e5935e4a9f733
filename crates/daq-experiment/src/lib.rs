//! `daq-experiment`
//!
//! Scan life-cycle state machine for daq-blocks.
//!
//! A [`RunnableController`] is a block whose `validate`, `configure`, `run`,
//! `pause`, `resume`, `abort`, `reset` and `disable` methods drive the states
//! in [`RunState`]. The actual work is done by [`Part`](daq_core::Part)s,
//! whose hooks run in registration order:
//!
//! - [`parts::SimulatedStepsPart`]: a stepping detector used for demos and tests
//! - [`parts::RunnableChildPart`]: delegates every transition to a child block
//!   that is itself runnable, re-raising the child's fault cause
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use daq_core::Process;
//! use daq_experiment::parts::{RunnableChildPart, SimulatedStepsPart};
//! use daq_experiment::RunnableControllerBuilder;
//! # async fn example() -> daq_core::error::AppResult<()> {
//! let process = Process::new("demo");
//! RunnableControllerBuilder::new("DET")
//!     .with_part(Arc::new(SimulatedStepsPart::new("sim", Duration::from_millis(10))))
//!     .build(&process)?;
//! let scan = RunnableControllerBuilder::new("SCAN")
//!     .with_part(Arc::new(RunnableChildPart::new("det", "DET")))
//!     .build(&process)?;
//! process.start().await?;
//!
//! let mut params = serde_json::Map::new();
//! params.insert("steps".into(), 10.into());
//! scan.configure(params).await?;
//! scan.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod parts;
pub mod runnable;
pub mod states;

pub use runnable::{RunnableController, RunnableControllerBuilder};
pub use states::RunState;
