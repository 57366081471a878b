//! Building and running the filter/detector graph.
//!
//! Nodes are topologically ordered by producer/consumer dependency at
//! build time; a cycle or an unresolvable input is fatal. Execution
//! walks the order once per wake-up and hands every node the contiguous
//! slice `[consumed, produced)` of each of its inputs.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::error::{Error, Result};
use crate::filter::node::{AnalogChunk, EventChunk, FilterNode, NodeIo, NodeSpec};
use crate::store::{Event, EventStream, InputTrace};

struct RunningNode {
    node: Box<dyn FilterNode>,
    io: NodeIo,
    consumed_traces: Vec<usize>,
    consumed_events: Vec<usize>,
}

pub struct FilterGraph {
    nodes: Vec<RunningNode>,
    derived_traces: Vec<Arc<InputTrace>>,
    derived_events: Vec<Arc<EventStream>>,
}

/// Capacity of derived event streams.
const EVENT_CAPACITY: usize = 1 << 16;

impl FilterGraph {
    /// Resolves names, orders the nodes, creates the derived buffers
    /// and initializes every node. Raw traces come from the DAQ engine.
    pub fn build(specs: Vec<NodeSpec>, raw_traces: &[Arc<InputTrace>]) -> Result<FilterGraph> {
        // producer index per output name
        let mut trace_producer: HashMap<String, usize> = HashMap::new();
        let mut event_producer: HashMap<String, usize> = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            for (name, _) in &spec.out_traces {
                if raw_traces.iter().any(|t| t.name() == *name)
                    || trace_producer.insert(name.clone(), i).is_some()
                {
                    return Err(Error::syntax(
                        "filter graph",
                        0,
                        format!("duplicate trace name {name}"),
                    ));
                }
            }
            for name in &spec.out_events {
                if event_producer.insert(name.clone(), i).is_some() {
                    return Err(Error::syntax(
                        "filter graph",
                        0,
                        format!("duplicate event stream name {name}"),
                    ));
                }
            }
        }

        // dependency edges: consumer depends on producer
        let n = specs.len();
        let mut depends: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, spec) in specs.iter().enumerate() {
            for name in &spec.in_traces {
                if let Some(&p) = trace_producer.get(name) {
                    depends[i].push(p);
                } else if !raw_traces.iter().any(|t| t.name() == *name) {
                    return Err(Error::InvalidReference(format!(
                        "filter {} reads unknown trace {name}",
                        spec.node.name()
                    )));
                }
            }
            for name in &spec.in_events {
                match event_producer.get(name) {
                    Some(&p) => depends[i].push(p),
                    None => {
                        return Err(Error::InvalidReference(format!(
                            "filter {} reads unknown event stream {name}",
                            spec.node.name()
                        )));
                    }
                }
            }
        }

        // Kahn's algorithm
        let mut indegree: Vec<usize> = depends.iter().map(|d| d.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in depends.iter().enumerate() {
            for &p in deps {
                dependents[p].push(i);
            }
        }
        let mut order: Vec<usize> = Vec::with_capacity(n);
        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        while let Some(i) = ready.pop() {
            order.push(i);
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.push(d);
                }
            }
        }
        if order.len() != n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| indegree[i] > 0)
                .map(|i| specs[i].node.name())
                .collect();
            return Err(Error::syntax(
                "filter graph",
                0,
                format!("dependency cycle involving {}", stuck.join(", ")),
            ));
        }

        // create derived buffers
        let mut all_traces: HashMap<String, Arc<InputTrace>> = raw_traces
            .iter()
            .map(|t| (t.name().to_string(), t.clone()))
            .collect();
        let mut all_events: HashMap<String, Arc<EventStream>> = HashMap::new();
        let mut derived_traces = Vec::new();
        let mut derived_events = Vec::new();
        for spec in &specs {
            let delta = spec
                .in_traces
                .first()
                .and_then(|n| all_traces.get(n))
                .map(|t| t.sample_interval())
                .unwrap_or(1e-3);
            let capacity = spec
                .in_traces
                .first()
                .and_then(|n| all_traces.get(n))
                .map(|t| t.buffer().capacity())
                .unwrap_or(1 << 16);
            for (name, unit) in &spec.out_traces {
                let t = Arc::new(InputTrace::new(name, unit, delta, usize::MAX, capacity));
                all_traces.insert(name.clone(), t.clone());
                derived_traces.push(t);
            }
            for name in &spec.out_events {
                let e = Arc::new(EventStream::new(name, EVENT_CAPACITY));
                all_events.insert(name.clone(), e.clone());
                derived_events.push(e);
            }
        }

        // bind and init in topological order
        let mut ios: Vec<Option<NodeIo>> = specs
            .iter()
            .map(|spec| {
                Some(NodeIo {
                    in_traces: spec
                        .in_traces
                        .iter()
                        .map(|n| all_traces[n].clone())
                        .collect(),
                    in_events: spec
                        .in_events
                        .iter()
                        .map(|n| all_events[n].clone())
                        .collect(),
                    out_traces: spec
                        .out_traces
                        .iter()
                        .map(|(n, _)| all_traces[n].clone())
                        .collect(),
                    out_events: spec
                        .out_events
                        .iter()
                        .map(|n| all_events[n].clone())
                        .collect(),
                })
            })
            .collect();
        let mut boxed: Vec<Option<Box<dyn FilterNode>>> =
            specs.into_iter().map(|s| Some(s.node)).collect();
        let mut nodes: Vec<RunningNode> = Vec::with_capacity(n);
        for &i in &order {
            let io = ios[i].take().expect("each io bound once");
            let mut node = boxed[i].take().expect("each node moved once");
            node.init(&io)?;
            let consumed_traces = io.in_traces.iter().map(|t| t.produced()).collect();
            let consumed_events = io.in_events.iter().map(|e| e.produced()).collect();
            nodes.push(RunningNode {
                node,
                io,
                consumed_traces,
                consumed_events,
            });
        }

        Ok(FilterGraph {
            nodes,
            derived_traces,
            derived_events,
        })
    }

    pub fn derived_traces(&self) -> &[Arc<InputTrace>] {
        &self.derived_traces
    }

    pub fn derived_events(&self) -> &[Arc<EventStream>] {
        &self.derived_events
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.node.name().to_string()).collect()
    }

    /// One incremental pass over all nodes in dependency order.
    pub fn process(&mut self) -> Result<()> {
        let mut analog_scratch: Vec<Vec<f64>> = Vec::new();
        let mut event_scratch: Vec<Vec<Event>> = Vec::new();
        for rn in &mut self.nodes {
            analog_scratch.clear();
            event_scratch.clear();
            let mut starts = Vec::with_capacity(rn.io.in_traces.len());
            for (slot, t) in rn.io.in_traces.iter().enumerate() {
                let mut from = rn.consumed_traces[slot];
                let min = t.min_index();
                if from < min {
                    // the writer lapped this node: data was lost
                    t.set_error(Error::BufferOverflow {
                        trace: t.name().to_string(),
                    });
                    warn!("filter {} lost {} samples on {}", rn.node.name(), min - from, t.name());
                    from = min;
                }
                let mut buf = Vec::new();
                let produced = t.produced();
                if produced > from {
                    t.read_into(from, produced - from, &mut buf)?;
                }
                starts.push(from);
                rn.consumed_traces[slot] = from + buf.len();
                analog_scratch.push(buf);
            }
            let mut event_starts = Vec::with_capacity(rn.io.in_events.len());
            for (slot, e) in rn.io.in_events.iter().enumerate() {
                let mut from = rn.consumed_events[slot];
                let min = e.min_index();
                if from < min {
                    warn!("filter {} lost {} events on {}", rn.node.name(), min - from, e.name());
                    from = min;
                }
                let mut buf = Vec::new();
                e.read_into(from, &mut buf)?;
                event_starts.push(from);
                rn.consumed_events[slot] = from + buf.len();
                event_scratch.push(buf);
            }

            let analog: Vec<AnalogChunk> = rn
                .io
                .in_traces
                .iter()
                .zip(starts.iter())
                .zip(analog_scratch.iter())
                .map(|((trace, &start), samples)| AnalogChunk {
                    trace,
                    start,
                    samples,
                })
                .collect();
            let events: Vec<EventChunk> = rn
                .io
                .in_events
                .iter()
                .zip(event_starts.iter())
                .zip(event_scratch.iter())
                .map(|((stream, &start), events)| EventChunk {
                    stream,
                    start,
                    events,
                })
                .collect();
            rn.node.process(&analog, &events, &rn.io)?;
        }
        Ok(())
    }

    /// Forwards a parameter assignment to a node by name.
    pub fn configure(&mut self, name: &str, params: &str) -> Result<()> {
        let rn = self
            .nodes
            .iter_mut()
            .find(|n| n.node.name() == name)
            .ok_or_else(|| Error::InvalidReference(name.to_string()))?;
        let unknown = rn.node.options_mut().assign_from(params);
        for u in unknown {
            warn!("filter {name}: unknown parameter {u}");
        }
        Ok(())
    }

    /// Runs a node's auto-configuration over `[t0, t1]`.
    pub fn auto_configure(&mut self, name: &str, t0: f64, t1: f64) -> Result<()> {
        let rn = self
            .nodes
            .iter_mut()
            .find(|n| n.node.name() == name)
            .ok_or_else(|| Error::InvalidReference(name.to_string()))?;
        rn.node.auto_configure(&rn.io, t0, t1)
    }

    /// Serialized settings of a node, for the macro save command.
    pub fn save_settings(&self, name: &str) -> Result<String> {
        let rn = self
            .nodes
            .iter()
            .find(|n| n.node.name() == name)
            .ok_or_else(|| Error::InvalidReference(name.to_string()))?;
        Ok(rn.node.options().save_string())
    }

    pub fn close(&mut self) {
        for rn in &mut self.nodes {
            rn.node.close();
        }
    }
}
