//! Event streams: time-ordered records produced by detectors.
//!
//! An event carries a time plus optional size and width (e.g. spike
//! amplitude and duration). Like the analog traces, a stream keeps a
//! monotonically growing produced count so event indices stay valid
//! after old records are evicted. Writers are the filter thread (or
//! the detector's init), readers the running procedure and the
//! persistence thread; rates are low enough for a read/write lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    /// Event time in seconds since acquisition start.
    pub time: f64,
    pub size: f64,
    pub width: f64,
}

impl Event {
    pub fn at(time: f64) -> Event {
        Event {
            time,
            size: 0.0,
            width: 0.0,
        }
    }
}

pub struct EventStream {
    name: String,
    size_unit: Option<String>,
    width_unit: Option<String>,
    capacity: usize,
    events: RwLock<VecDeque<Event>>,
    produced: AtomicUsize,
    /// Time of the most recent stimulus onset, as f64 bits; NAN before
    /// the first stimulus. Sticky.
    signal_time: AtomicU64,
}

impl EventStream {
    pub fn new(name: &str, capacity: usize) -> EventStream {
        EventStream {
            name: name.to_string(),
            size_unit: None,
            width_unit: None,
            capacity,
            events: RwLock::new(VecDeque::new()),
            produced: AtomicUsize::new(0),
            signal_time: AtomicU64::new(f64::NAN.to_bits()),
        }
    }

    pub fn with_units(mut self, size_unit: Option<&str>, width_unit: Option<&str>) -> EventStream {
        self.size_unit = size_unit.map(str::to_string);
        self.width_unit = width_unit.map(str::to_string);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size_unit(&self) -> Option<&str> {
        self.size_unit.as_deref()
    }

    pub fn width_unit(&self) -> Option<&str> {
        self.width_unit.as_deref()
    }

    /// Total number of events ever pushed.
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::Acquire)
    }

    /// Index of the oldest retained event.
    pub fn min_index(&self) -> usize {
        self.produced() - self.events.read().len()
    }

    /// Appends an event. Event times must be strictly increasing; a
    /// non-monotonic push is rejected.
    pub fn push(&self, e: Event) -> Result<()> {
        let mut q = self.events.write();
        if let Some(last) = q.back() {
            if e.time <= last.time {
                return Err(Error::Unknown(format!(
                    "non-monotonic event time {} after {} on {}",
                    e.time, last.time, self.name
                )));
            }
        }
        if q.len() == self.capacity {
            q.pop_front();
        }
        q.push_back(e);
        self.produced.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Event at absolute index `i`.
    pub fn get(&self, i: usize) -> Result<Event> {
        let q = self.events.read();
        let produced = self.produced();
        let min = produced - q.len();
        if i < min || i >= produced {
            return Err(Error::OutOfRange { index: i, min });
        }
        Ok(q[i - min])
    }

    /// Copies all events with index ≥ `from` into `out`; returns the
    /// number copied.
    pub fn read_into(&self, from: usize, out: &mut Vec<Event>) -> Result<usize> {
        let q = self.events.read();
        let produced = self.produced();
        let min = produced - q.len();
        if from < min {
            return Err(Error::OutOfRange { index: from, min });
        }
        let skip = from - min;
        let n = q.len() - skip.min(q.len());
        out.extend(q.iter().skip(skip).copied());
        Ok(n)
    }

    /// Time of the most recent event, if any is retained.
    pub fn back_time(&self) -> Option<f64> {
        self.events.read().back().map(|e| e.time)
    }

    /// Number of retained events with time in `[t0, t1)`.
    pub fn count_between(&self, t0: f64, t1: f64) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.time >= t0 && e.time < t1)
            .count()
    }

    /// Mean event rate over `[t0, t1)` in Hz.
    pub fn mean_rate(&self, t0: f64, t1: f64) -> f64 {
        if t1 <= t0 {
            return 0.0;
        }
        self.count_between(t0, t1) as f64 / (t1 - t0)
    }

    /// Index of the first event at or after time `t`.
    pub fn index_after(&self, t: f64) -> usize {
        let q = self.events.read();
        let min = self.produced() - q.len();
        match q.iter().position(|e| e.time >= t) {
            Some(p) => min + p,
            None => self.produced(),
        }
    }

    pub fn signal_time(&self) -> Option<f64> {
        let t = f64::from_bits(self.signal_time.load(Ordering::Acquire));
        t.is_finite().then_some(t)
    }

    /// Sticky stimulus-onset marker; never decreases.
    pub fn set_signal_time(&self, t: f64) {
        let mut current = self.signal_time.load(Ordering::Acquire);
        loop {
            let cur = f64::from_bits(current);
            if cur.is_finite() && cur >= t {
                return;
            }
            match self.signal_time.compare_exchange_weak(
                current,
                t.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }

    pub fn reset(&self) {
        self.events.write().clear();
        self.produced.store(0, Ordering::Release);
        self.signal_time
            .store(f64::NAN.to_bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing_times_enforced() {
        let s = EventStream::new("spikes", 8);
        s.push(Event::at(0.1)).unwrap();
        s.push(Event::at(0.2)).unwrap();
        assert!(s.push(Event::at(0.2)).is_err());
        assert!(s.push(Event::at(0.15)).is_err());
        assert_eq!(s.produced(), 2);
    }

    #[test]
    fn indices_survive_eviction() {
        let s = EventStream::new("spikes", 4);
        for i in 1..=10 {
            s.push(Event::at(i as f64 * 0.01)).unwrap();
        }
        assert_eq!(s.produced(), 10);
        assert_eq!(s.min_index(), 6);
        assert!((s.get(6).unwrap().time - 0.07).abs() < 1e-12);
        assert!(matches!(s.get(5), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn counting_and_rate() {
        let s = EventStream::new("spikes", 64);
        for i in 0..20 {
            s.push(Event::at(0.05 + i as f64 * 0.05)).unwrap();
        }
        assert_eq!(s.count_between(0.0, 0.5), 9);
        assert!((s.mean_rate(0.0, 1.0) - 19.0).abs() < 1e-12);
    }

    #[test]
    fn index_after_finds_first_event() {
        let s = EventStream::new("spikes", 64);
        s.push(Event::at(0.1)).unwrap();
        s.push(Event::at(0.3)).unwrap();
        assert_eq!(s.index_after(0.0), 0);
        assert_eq!(s.index_after(0.2), 1);
        assert_eq!(s.index_after(0.4), 2);
    }

    #[test]
    fn signal_time_sticky() {
        let s = EventStream::new("spikes", 8);
        assert_eq!(s.signal_time(), None);
        s.set_signal_time(1.0);
        s.set_signal_time(0.5);
        assert_eq!(s.signal_time(), Some(1.0));
        s.set_signal_time(2.0);
        assert_eq!(s.signal_time(), Some(2.0));
    }
}
