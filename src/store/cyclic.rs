//! Fixed-capacity cyclic sample buffer with monotonic indices.
//!
//! The total number of samples ever written (the produced count) only
//! grows, so sample indices stay stable across wrap-around: index `i`
//! always denotes the i-th sample acquired since the buffer was
//! cleared, and the accessible window is `[min_index, produced)`.
//!
//! Concurrency: single producer (the DAQ service thread), any number
//! of readers. Samples are stored as `f64` bit patterns in atomics and
//! the produced count is published with release ordering, so readers
//! that snapshot the count with acquire ordering see every sample below
//! it without taking a lock. A reader that lags more than one capacity
//! behind detects the overwrite and gets `OutOfRange`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::{Error, Result};

pub struct CyclicBuffer {
    data: Box<[AtomicU64]>,
    produced: AtomicUsize,
}

impl CyclicBuffer {
    pub fn new(capacity: usize) -> CyclicBuffer {
        assert!(capacity > 0, "cyclic buffer needs a nonzero capacity");
        let data = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        CyclicBuffer {
            data,
            produced: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Total number of samples ever written. Monotonic until `clear`.
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::Acquire)
    }

    /// Number of samples currently accessible (≤ capacity).
    pub fn accessible_size(&self) -> usize {
        self.produced().min(self.capacity())
    }

    /// Index of the oldest accessible sample.
    pub fn min_index(&self) -> usize {
        let produced = self.produced();
        produced - produced.min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.produced() == 0
    }

    /// Appends one sample, overwriting the oldest when full.
    /// Producer side only.
    pub fn push(&self, v: f64) {
        let produced = self.produced.load(Ordering::Relaxed);
        self.data[produced % self.capacity()].store(v.to_bits(), Ordering::Relaxed);
        self.produced.store(produced + 1, Ordering::Release);
    }

    /// Appends a slice of samples. Producer side only.
    pub fn push_slice(&self, vs: &[f64]) {
        let mut produced = self.produced.load(Ordering::Relaxed);
        let cap = self.capacity();
        for &v in vs {
            self.data[produced % cap].store(v.to_bits(), Ordering::Relaxed);
            produced += 1;
        }
        self.produced.store(produced, Ordering::Release);
    }

    /// Sample at absolute index `i`.
    pub fn get(&self, i: usize) -> Result<f64> {
        let produced = self.produced();
        let min = produced - produced.min(self.capacity());
        if i < min || i >= produced {
            return Err(Error::OutOfRange { index: i, min });
        }
        let v = f64::from_bits(self.data[i % self.capacity()].load(Ordering::Relaxed));
        // the producer may have lapped us between the bounds check and the load
        let min_after = {
            let p = self.produced();
            p - p.min(self.capacity())
        };
        if i < min_after {
            return Err(Error::OutOfRange {
                index: i,
                min: min_after,
            });
        }
        Ok(v)
    }

    /// Length of the contiguous run starting at `from`, bounded by the
    /// write head and the physical end of the buffer. Mirrors the
    /// zero-copy read contract: `from + run` never crosses a wrap.
    pub fn contiguous(&self, from: usize) -> Result<usize> {
        let produced = self.produced();
        let min = produced - produced.min(self.capacity());
        if from < min {
            return Err(Error::OutOfRange { index: from, min });
        }
        if from >= produced {
            return Ok(0);
        }
        let cap = self.capacity();
        let to_head = produced - from;
        let to_wrap = cap - from % cap;
        Ok(to_head.min(to_wrap))
    }

    /// Copies samples `[from, from+n)` into `out`, appending. Returns
    /// the number copied (may be less than `n` at the write head).
    /// Fails with `OutOfRange` when the producer has already lapped
    /// `from`.
    pub fn read_into(&self, from: usize, n: usize, out: &mut Vec<f64>) -> Result<usize> {
        let produced = self.produced();
        let min = produced - produced.min(self.capacity());
        if from < min {
            return Err(Error::OutOfRange { index: from, min });
        }
        let n = n.min(produced - from.min(produced));
        let cap = self.capacity();
        let start = out.len();
        for i in from..from + n {
            out.push(f64::from_bits(self.data[i % cap].load(Ordering::Relaxed)));
        }
        // detect overwrite during the copy
        let p = self.produced();
        let min_after = p - p.min(cap);
        if from < min_after {
            out.truncate(start);
            return Err(Error::OutOfRange {
                index: from,
                min: min_after,
            });
        }
        Ok(n)
    }

    /// Resets the buffer; the only operation that lowers the produced
    /// count. Producer side only, with all readers quiesced.
    pub fn clear(&self) {
        self.produced.store(0, Ordering::Release);
    }
}
