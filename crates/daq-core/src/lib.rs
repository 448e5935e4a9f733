//! `daq-core`
//!
//! Value tree, dispatch core and process registry for daq-blocks.
//!
//! A *block* is a named tree of attributes, methods and nested blocks. Each
//! block is owned by exactly one [`Controller`], which serializes every
//! mutation and streams change sets to subscribers. Controllers live in a
//! [`Process`] and are looked up by MRI. Behaviour is attached to a
//! controller through [`Part`]s whose life-cycle hooks are run in
//! registration order by [`hooks::run_hook`].
//!
//! ## Modules
//!
//! - [`model`]: blocks, attributes, methods and their metas
//! - [`changes`]: change sets and path helpers over serialized trees
//! - [`controller`]: the request pipeline (get, put, post, subscribe, unsubscribe)
//! - [`process`]: registry, lifecycle participants, published list
//! - [`part`] / [`hooks`]: pluggable behaviour and ordered hook execution
//! - [`view`]: access to other blocks from inside a part
//! - [`tags`]: tag vocabulary for field metadata
//! - [`config`] / [`logging`]: process configuration and tracing setup
//!
//! ## Example
//!
//! ```rust,no_run
//! use daq_core::{Controller, Process};
//! use daq_core::model::{AttributeModel, BlockModel, Field, NumberType, VMeta};
//! # async fn example() -> daq_core::error::AppResult<()> {
//! let mut block = BlockModel::new("Motor");
//! block.add_field(
//!     "position",
//!     Field::Attribute(AttributeModel::new(
//!         VMeta::number(NumberType::Float64, "Position").writeable(true),
//!     )),
//! )?;
//! let process = Process::new("example");
//! process.add_controller(Controller::new("MOTOR", block))?;
//!
//! let motor = process.lookup("MOTOR")?;
//! motor.put(&["position".into()], 12.5.into()).await?;
//! # Ok(())
//! # }
//! ```

pub mod changes;
pub mod config;
pub mod controller;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod model;
pub mod part;
pub mod process;
pub mod request;
pub mod tags;
pub mod view;

pub use controller::{Controller, Subscription, SubscriptionHandle, Transaction};
pub use error::{AppResult, DaqError};
pub use part::{Part, PartContext};
pub use process::{Process, ProcessLifecycle};
pub use view::{BlockView, Context};
