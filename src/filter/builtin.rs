//! Standard nodes: a moving-average analog filter and a threshold
//! spike detector.

use std::collections::VecDeque;

use crate::error::Result;
use crate::filter::node::{AnalogChunk, EventChunk, FilterNode, NodeIo, NodeKind};
use crate::options::Options;
use crate::store::Event;

/// Smooths one analog trace with a sliding window mean.
pub struct MovingAverage {
    name: String,
    options: Options,
    window: VecDeque<f64>,
    size: usize,
    sum: f64,
}

impl MovingAverage {
    pub fn new(name: &str, window_size: usize) -> MovingAverage {
        let mut options = Options::new(name);
        options.add_integer("window", "Window size", window_size as i64);
        MovingAverage {
            name: name.to_string(),
            options,
            window: VecDeque::new(),
            size: window_size,
            sum: 0.0,
        }
    }
}

impl FilterNode for MovingAverage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::AnalogFilter
    }

    fn options(&self) -> &Options {
        &self.options
    }

    fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    fn init(&mut self, _io: &NodeIo) -> Result<()> {
        self.size = (self.options.integer("window") as usize).max(1);
        self.window.clear();
        self.sum = 0.0;
        Ok(())
    }

    fn process(
        &mut self,
        analog: &[AnalogChunk],
        _events: &[EventChunk],
        io: &NodeIo,
    ) -> Result<()> {
        // window size may have been reconfigured between calls
        self.size = (self.options.integer("window") as usize).max(1);
        let Some(chunk) = analog.first() else {
            return Ok(());
        };
        let Some(out) = io.out_traces.first() else {
            return Ok(());
        };
        for &v in chunk.samples {
            self.window.push_back(v);
            self.sum += v;
            if self.window.len() > self.size {
                self.sum -= self.window.pop_front().unwrap_or(0.0);
            }
            out.buffer().push(self.sum / self.window.len() as f64);
        }
        Ok(())
    }
}

/// Detects threshold crossings in one analog trace and emits an event
/// per excursion, carrying the peak amplitude as size and the time
/// above threshold as width.
pub struct ThresholdDetector {
    name: String,
    options: Options,
    above: bool,
    crossing: usize,
    peak: f64,
}

impl ThresholdDetector {
    pub fn new(name: &str, threshold: f64, unit: &str) -> ThresholdDetector {
        let mut options = Options::new(name);
        options.add_number("threshold", "Detection threshold", threshold, unit);
        options.add_number("hysteresis", "Release hysteresis", 0.0, unit);
        ThresholdDetector {
            name: name.to_string(),
            options,
            above: false,
            crossing: 0,
            peak: 0.0,
        }
    }
}

impl FilterNode for ThresholdDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::AnalogDetector
    }

    fn options(&self) -> &Options {
        &self.options
    }

    fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    fn init(&mut self, _io: &NodeIo) -> Result<()> {
        self.above = false;
        Ok(())
    }

    fn process(
        &mut self,
        analog: &[AnalogChunk],
        _events: &[EventChunk],
        io: &NodeIo,
    ) -> Result<()> {
        let Some(chunk) = analog.first() else {
            return Ok(());
        };
        let Some(out) = io.out_events.first() else {
            return Ok(());
        };
        let threshold = self.options.number("threshold", "");
        let hysteresis = self.options.number("hysteresis", "").max(0.0);
        let delta = chunk.trace.sample_interval();
        for (k, &v) in chunk.samples.iter().enumerate() {
            let index = chunk.start + k;
            if !self.above {
                if v >= threshold {
                    self.above = true;
                    self.crossing = index;
                    self.peak = v;
                }
            } else {
                if v > self.peak {
                    self.peak = v;
                }
                if v < threshold - hysteresis {
                    self.above = false;
                    let e = Event {
                        time: self.crossing as f64 * delta,
                        size: self.peak,
                        width: (index - self.crossing) as f64 * delta,
                    };
                    if let Err(err) = out.push(e) {
                        log::debug!("{}: {err}", self.name);
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-derives the threshold from the observed amplitude range:
    /// mean plus a fixed fraction of the span above the mean.
    fn auto_configure(&mut self, io: &NodeIo, t0: f64, t1: f64) -> Result<()> {
        let Some(trace) = io.in_traces.first() else {
            return Ok(());
        };
        let from = trace.index(t0).max(trace.min_index());
        let to = trace.index(t1).min(trace.produced());
        if to <= from {
            return Ok(());
        }
        let mut samples = Vec::with_capacity(to - from);
        trace.read_into(from, to - from, &mut samples)?;
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max > mean {
            let threshold = mean + 0.7 * (max - mean);
            self.options.set_number("threshold", threshold);
        }
        Ok(())
    }
}
