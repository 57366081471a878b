//! Cyclic trace and event stores shared between the acquisition,
//! filter, procedure and persistence threads.

pub mod cyclic;
pub mod events;
pub mod trace;

pub use cyclic::CyclicBuffer;
pub use events::{Event, EventStream};
pub use trace::InputTrace;
