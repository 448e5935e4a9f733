//! Parts shipped with the scan state machine.

pub mod child;
pub mod simulated;

pub use child::{ConfigureArgsQueue, RunnableChildPart};
pub use simulated::SimulatedStepsPart;
