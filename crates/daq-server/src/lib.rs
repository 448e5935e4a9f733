//! `daq-server`
//!
//! Delta-synchronised access to blocks for remote clients.
//!
//! ```text
//!   boundary adapter ─► BlockServer::make_channel("DET" | "DET.exposure")
//!                       └─► SharedChannel ─► ChannelClient (per client)
//!                            └─► SyncSession ─► Controller (delta subscription)
//! ```
//!
//! - [`session`]: the per-channel mirror, put resolution and RPC
//! - [`channel`]: client fan-out and connect/disconnect bookkeeping
//! - [`comms`]: the server, published list and administrative disconnect
//! - [`error_mapping`]: how errors look past the boundary

pub mod channel;
pub mod comms;
pub mod error_mapping;
pub mod session;

pub use channel::{ChannelClient, SharedChannel};
pub use comms::BlockServer;
pub use error_mapping::{map_daq_error_to_fault, BoundaryFault, FaultCode};
pub use session::{ChannelSink, Invocation, SessionEvent, SessionPhase, SyncSession};
