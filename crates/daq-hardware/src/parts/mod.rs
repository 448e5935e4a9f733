//! Parts that attach hardware channels to a block.

pub mod channel;

pub use channel::ChannelAttributePart;
