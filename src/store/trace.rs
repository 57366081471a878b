//! An analog input trace: a named, unit-carrying cyclic sample buffer
//! with a sample interval, a sticky signal time, and an error slot for
//! the acquisition engine.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::store::cyclic::CyclicBuffer;

pub struct InputTrace {
    name: String,
    unit: String,
    /// Sample interval in seconds.
    delta: f64,
    channel: usize,
    buffer: CyclicBuffer,
    /// Sample index of the most recent stimulus onset; -1 before the
    /// first stimulus. Never decreases during a session.
    signal_index: AtomicI64,
    error: Mutex<Option<Error>>,
}

impl InputTrace {
    pub fn new(name: &str, unit: &str, delta: f64, channel: usize, capacity: usize) -> InputTrace {
        InputTrace {
            name: name.to_string(),
            unit: unit.to_string(),
            delta,
            channel,
            buffer: CyclicBuffer::new(capacity),
            signal_index: AtomicI64::new(-1),
            error: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Sample interval in seconds.
    pub fn sample_interval(&self) -> f64 {
        self.delta
    }

    pub fn sample_rate(&self) -> f64 {
        1.0 / self.delta
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn buffer(&self) -> &CyclicBuffer {
        &self.buffer
    }

    pub fn produced(&self) -> usize {
        self.buffer.produced()
    }

    pub fn min_index(&self) -> usize {
        self.buffer.min_index()
    }

    pub fn get(&self, i: usize) -> Result<f64> {
        self.buffer.get(i)
    }

    pub fn read_into(&self, from: usize, n: usize, out: &mut Vec<f64>) -> Result<usize> {
        self.buffer.read_into(from, n, out)
    }

    /// Sample index corresponding to time `t` (seconds since clear).
    pub fn index(&self, t: f64) -> usize {
        if t <= 0.0 {
            0
        } else {
            (t / self.delta).round() as usize
        }
    }

    /// Time of sample index `i` in seconds.
    pub fn pos(&self, i: usize) -> f64 {
        i as f64 * self.delta
    }

    /// Time of the most recent sample.
    pub fn current_time(&self) -> f64 {
        self.pos(self.produced())
    }

    /// Index of the most recent stimulus onset, if any stimulus fired.
    pub fn signal_index(&self) -> Option<usize> {
        let i = self.signal_index.load(Ordering::Acquire);
        (i >= 0).then_some(i as usize)
    }

    /// Time of the most recent stimulus onset.
    pub fn signal_time(&self) -> Option<f64> {
        self.signal_index().map(|i| self.pos(i))
    }

    /// Marks a stimulus onset. The marker is sticky: attempts to move
    /// it backwards are ignored.
    pub fn set_signal_index(&self, index: usize) {
        self.signal_index
            .fetch_max(index as i64, Ordering::AcqRel);
    }

    /// Clears samples and the signal marker (DAQ restart).
    pub fn reset(&self) {
        self.buffer.clear();
        self.signal_index.store(-1, Ordering::Release);
    }

    pub fn set_error(&self, e: Error) {
        *self.error.lock() = Some(e);
    }

    pub fn take_error(&self) -> Option<Error> {
        self.error.lock().take()
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_time_round_trip() {
        let t = InputTrace::new("V-1", "mV", 5e-5, 0, 1024);
        assert_eq!(t.index(0.1), 2000);
        assert!((t.pos(2000) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn signal_index_is_sticky_and_monotone() {
        let t = InputTrace::new("V-1", "mV", 1e-4, 0, 64);
        assert_eq!(t.signal_index(), None);
        t.set_signal_index(100);
        t.set_signal_index(40);
        assert_eq!(t.signal_index(), Some(100));
        t.set_signal_index(200);
        assert_eq!(t.signal_index(), Some(200));
    }

    #[test]
    fn reset_clears_marker_and_samples() {
        let t = InputTrace::new("V-1", "mV", 1e-4, 0, 64);
        t.buffer().push_slice(&[0.0; 10]);
        t.set_signal_index(5);
        t.reset();
        assert_eq!(t.produced(), 0);
        assert_eq!(t.signal_index(), None);
    }
}
