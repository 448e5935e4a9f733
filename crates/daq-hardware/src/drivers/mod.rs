//! Channel backend drivers.

pub mod mock;

pub use mock::MockChannelBackend;
