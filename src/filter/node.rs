//! Filter/detector node contract.
//!
//! A node transforms analog traces and/or event streams into derived
//! traces and event streams. Its kind is an explicit tag read at graph
//! build time; inputs and outputs are declared by name and bound once
//! at `init`. On every invocation the driver hands the node the
//! contiguous slice of new data per input; nodes keep whatever lookback
//! they need in private state and never retain borrows across calls.

use std::sync::Arc;

use crate::error::Result;
use crate::options::Options;
use crate::store::{Event, EventStream, InputTrace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Analog in, analog out.
    AnalogFilter,
    /// Events in, events out.
    EventFilter,
    /// Analog in, events out.
    AnalogDetector,
    /// Events in, events out with detection semantics.
    EventDetector,
}

impl NodeKind {
    pub fn consumes_events(&self) -> bool {
        matches!(self, NodeKind::EventFilter | NodeKind::EventDetector)
    }

    pub fn produces_events(&self) -> bool {
        matches!(
            self,
            NodeKind::AnalogDetector | NodeKind::EventDetector | NodeKind::EventFilter
        )
    }
}

/// Resolved inputs and outputs of a node.
#[derive(Default)]
pub struct NodeIo {
    pub in_traces: Vec<Arc<InputTrace>>,
    pub in_events: Vec<Arc<EventStream>>,
    pub out_traces: Vec<Arc<InputTrace>>,
    pub out_events: Vec<Arc<EventStream>>,
}

/// New analog samples of one input trace: `samples[0]` is sample
/// index `start` of `trace`.
pub struct AnalogChunk<'a> {
    pub trace: &'a Arc<InputTrace>,
    pub start: usize,
    pub samples: &'a [f64],
}

/// New events of one input stream.
pub struct EventChunk<'a> {
    pub stream: &'a Arc<EventStream>,
    pub start: usize,
    pub events: &'a [Event],
}

pub trait FilterNode: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> NodeKind;

    /// The node's tunable parameters, configured from macro commands.
    fn options(&self) -> &Options;
    fn options_mut(&mut self) -> &mut Options;

    /// Called once with inputs and outputs bound, before any data flows.
    fn init(&mut self, io: &NodeIo) -> Result<()>;

    /// Consumes the new input chunks and appends to the node's outputs.
    fn process(&mut self, analog: &[AnalogChunk], events: &[EventChunk], io: &NodeIo)
    -> Result<()>;

    /// Re-derives internal settings from the data in `[t0, t1]`. The
    /// driver guarantees sole access to the referenced buffers for the
    /// duration of the call.
    fn auto_configure(&mut self, _io: &NodeIo, _t0: f64, _t1: f64) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// A node plus its declared connectivity, before resolution.
pub struct NodeSpec {
    pub node: Box<dyn FilterNode>,
    pub in_traces: Vec<String>,
    pub in_events: Vec<String>,
    /// (name, unit) of each derived trace this node produces.
    pub out_traces: Vec<(String, String)>,
    pub out_events: Vec<String>,
}
