//! Incremental filter/detector graph: nodes, topological build,
//! driver thread, and the standard node implementations.

pub mod builtin;
pub mod driver;
pub mod graph;
pub mod node;

pub use builtin::{MovingAverage, ThresholdDetector};
pub use graph::FilterGraph;
pub use node::{AnalogChunk, EventChunk, FilterNode, NodeIo, NodeKind, NodeSpec};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::InputTrace;
    use std::sync::Arc;

    /// A does-nothing node used for wiring tests.
    struct Passthrough {
        name: String,
        options: crate::options::Options,
    }

    impl Passthrough {
        fn new(name: &str) -> Passthrough {
            Passthrough {
                name: name.to_string(),
                options: crate::options::Options::new(name),
            }
        }
    }

    impl FilterNode for Passthrough {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> NodeKind {
            NodeKind::AnalogFilter
        }
        fn options(&self) -> &crate::options::Options {
            &self.options
        }
        fn options_mut(&mut self) -> &mut crate::options::Options {
            &mut self.options
        }
        fn init(&mut self, _io: &NodeIo) -> crate::error::Result<()> {
            Ok(())
        }
        fn process(
            &mut self,
            analog: &[AnalogChunk],
            _events: &[EventChunk],
            io: &NodeIo,
        ) -> crate::error::Result<()> {
            if let (Some(chunk), Some(out)) = (analog.first(), io.out_traces.first()) {
                out.buffer().push_slice(chunk.samples);
            }
            Ok(())
        }
    }

    fn spec(name: &str, input: &str, output: &str) -> NodeSpec {
        NodeSpec {
            node: Box::new(Passthrough::new(name)),
            in_traces: vec![input.to_string()],
            in_events: vec![],
            out_traces: vec![(output.to_string(), "mV".to_string())],
            out_events: vec![],
        }
    }

    #[test]
    fn cycle_is_a_config_error_at_build() {
        let raw = Arc::new(InputTrace::new("V-1", "mV", 1e-3, 0, 64));
        // A consumes B's output and vice versa
        let specs = vec![spec("a", "t-b", "t-a"), spec("b", "t-a", "t-b")];
        match FilterGraph::build(specs, &[raw]) {
            Err(Error::ConfigSyntax { message, .. }) => {
                assert!(message.contains("cycle"), "got: {message}")
            }
            other => panic!("expected ConfigSyntax, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn chain_is_ordered_by_dependency_not_declaration() {
        let raw = Arc::new(InputTrace::new("V-1", "mV", 1e-3, 0, 64));
        // declared consumer-first; build must still order b before a
        let specs = vec![spec("a", "t-b", "t-a"), spec("b", "V-1", "t-b")];
        let mut graph = FilterGraph::build(specs, &[raw.clone()]).unwrap();
        raw.buffer().push_slice(&[1.0, 2.0, 3.0]);
        graph.process().unwrap();
        let out = graph
            .derived_traces()
            .iter()
            .find(|t| t.name() == "t-a")
            .unwrap()
            .clone();
        // one pass propagates through both stages
        assert_eq!(out.produced(), 3);
        assert_eq!(out.get(2).unwrap(), 3.0);
    }

    #[test]
    fn unknown_input_is_rejected() {
        let raw = Arc::new(InputTrace::new("V-1", "mV", 1e-3, 0, 64));
        let specs = vec![spec("a", "nonexistent", "t-a")];
        assert!(matches!(
            FilterGraph::build(specs, &[raw]),
            Err(Error::InvalidReference(_))
        ));
    }

    #[test]
    fn duplicate_output_name_is_rejected() {
        let raw = Arc::new(InputTrace::new("V-1", "mV", 1e-3, 0, 64));
        let specs = vec![spec("a", "V-1", "t-x"), spec("b", "V-1", "t-x")];
        assert!(matches!(
            FilterGraph::build(specs, &[raw]),
            Err(Error::ConfigSyntax { .. })
        ));
    }
}
