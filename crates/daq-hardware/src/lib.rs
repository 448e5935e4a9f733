//! `daq-hardware`
//!
//! Hardware access for daq-blocks.
//!
//! - [`backend`]: the [`ChannelBackend`] trait over named control-system channels
//! - [`drivers`]: backend implementations ([`MockChannelBackend`] in memory)
//! - [`parts`]: [`ChannelAttributePart`], which mirrors a demand/readback
//!   channel pair into a block attribute

pub mod backend;
pub mod drivers;
pub mod parts;

pub use backend::{ChannelBackend, ChannelMonitor, ChannelValue};
pub use drivers::MockChannelBackend;
pub use parts::ChannelAttributePart;
