//! The execution context handed to a running procedure: buffer access,
//! stimulus output, and the hardware-referenced wait primitives.
//!
//! All sleeps are interruptible. `request_stop` sets the interrupt flag
//! and broadcasts the condition, so every blocking primitive returns
//! with the flag visible within one timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::daq::{DaqEngine, OutData, OutList};
use crate::error::Result;
use crate::store::{EventStream, InputTrace};
use crate::ui::UiChannel;

/// Shared interrupt/wake state between the scheduler and the running
/// procedure.
pub struct InterruptFlag {
    flag: AtomicBool,
    soft: AtomicBool,
    wake_gen: AtomicU64,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl InterruptFlag {
    pub fn new() -> Arc<InterruptFlag> {
        Arc::new(InterruptFlag {
            flag: AtomicBool::new(false),
            soft: AtomicBool::new(false),
            wake_gen: AtomicU64::new(0),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        })
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Requests cooperative termination and releases every sleep.
    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
        let _guard = self.mutex.lock();
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
        self.soft.store(false, Ordering::Release);
    }

    /// Requests a stop at the procedure's next natural boundary.
    pub fn set_soft(&self) {
        self.soft.store(true, Ordering::Release);
    }

    pub fn soft_requested(&self) -> bool {
        self.soft.load(Ordering::Acquire)
    }

    /// Releases `sleep_wait` callers.
    pub fn wake(&self) {
        self.wake_gen.fetch_add(1, Ordering::AcqRel);
        let _guard = self.mutex.lock();
        self.cond.notify_all();
    }

    /// Sleeps up to `duration`; returns true when interrupted.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.mutex.lock();
        while !self.is_set() {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_set()
    }

    /// Waits for `wake` or interrupt; `duration` of `None` waits
    /// forever. Returns true when released early.
    fn wait(&self, duration: Option<Duration>) -> bool {
        let generation = self.wake_gen.load(Ordering::Acquire);
        let deadline = duration.map(|d| Instant::now() + d);
        let mut guard = self.mutex.lock();
        loop {
            if self.is_set() || self.wake_gen.load(Ordering::Acquire) != generation {
                return true;
            }
            match deadline {
                Some(d) => {
                    if self.cond.wait_until(&mut guard, d).timed_out() {
                        return self.is_set()
                            || self.wake_gen.load(Ordering::Acquire) != generation;
                    }
                }
                None => self.cond.wait(&mut guard),
            }
        }
    }
}

/// Everything a procedure's `main` can reach.
pub struct ReProContext {
    engine: Arc<DaqEngine>,
    events: Vec<Arc<EventStream>>,
    interrupt: Arc<InterruptFlag>,
    ui: UiChannel,
    stamp: Instant,
}

impl ReProContext {
    pub fn new(
        engine: Arc<DaqEngine>,
        events: Vec<Arc<EventStream>>,
        interrupt: Arc<InterruptFlag>,
        ui: UiChannel,
    ) -> ReProContext {
        ReProContext {
            engine,
            events,
            interrupt,
            ui,
            stamp: Instant::now(),
        }
    }

    // --- data access ---

    pub fn traces(&self) -> Vec<Arc<InputTrace>> {
        self.engine.traces()
    }

    pub fn trace(&self, name: &str) -> Option<Arc<InputTrace>> {
        self.engine.trace(name)
    }

    pub fn events(&self) -> &[Arc<EventStream>] {
        &self.events
    }

    pub fn event_stream(&self, name: &str) -> Option<Arc<EventStream>> {
        self.events.iter().find(|e| e.name() == name).cloned()
    }

    /// Acquisition time in seconds.
    pub fn current_time(&self) -> f64 {
        self.engine.current_time()
    }

    // --- output ---

    pub fn write(&self, out: OutData) -> Result<Option<f64>> {
        self.engine.write(out)
    }

    pub fn write_multi(&self, list: OutList) -> Result<Vec<Option<f64>>> {
        self.engine.write_multi(list)
    }

    pub fn write_zero(&self, trace: &str) -> Result<()> {
        self.engine.write_zero(trace)
    }

    /// Excludes this run from persistence; must be called before the
    /// first write.
    pub fn no_saving(&self) {
        self.engine.set_saving(false);
    }

    pub fn ui(&self) -> &UiChannel {
        &self.ui
    }

    // --- waits ---

    /// Suspends for `t` seconds of real time. Returns true when the
    /// interrupt flag was set; the procedure must then return promptly.
    pub fn sleep(&self, t: f64) -> bool {
        if t <= 0.0 {
            return self.interrupted();
        }
        self.interrupt.sleep(Duration::from_secs_f64(t))
    }

    /// Records the reference point for `sleep_on`.
    pub fn time_stamp(&mut self) {
        self.stamp = Instant::now();
    }

    /// Sleeps until `t` seconds after the most recent `time_stamp`.
    pub fn sleep_on(&self, t: f64) -> bool {
        let elapsed = self.stamp.elapsed().as_secs_f64();
        self.sleep(t - elapsed)
    }

    /// Waits on the procedure's condition; `wake` releases it. A
    /// negative `t` waits indefinitely. Returns true when released
    /// before the timeout elapsed.
    pub fn sleep_wait(&self, t: f64) -> bool {
        let duration = (t >= 0.0).then(|| Duration::from_secs_f64(t));
        self.interrupt.wait(duration)
    }

    /// Releases all `sleep_wait` callers.
    pub fn wake(&self) {
        self.interrupt.wake();
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    pub fn soft_stop_requested(&self) -> bool {
        self.interrupt.soft_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sleep_returns_false_without_interrupt() {
        let flag = InterruptFlag::new();
        assert!(!flag.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn set_releases_a_sleeping_thread_quickly() {
        let flag = InterruptFlag::new();
        let f2 = flag.clone();
        let start = Instant::now();
        let h = thread::spawn(move || f2.sleep(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        flag.set();
        assert!(h.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wake_releases_wait_but_not_plain_sleep_flag() {
        let flag = InterruptFlag::new();
        let f2 = flag.clone();
        let h = thread::spawn(move || f2.wait(Some(Duration::from_secs(10))));
        thread::sleep(Duration::from_millis(20));
        flag.wake();
        assert!(h.join().unwrap());
        assert!(!flag.is_set());
    }

    #[test]
    fn wait_times_out_false() {
        let flag = InterruptFlag::new();
        assert!(!flag.wait(Some(Duration::from_millis(5))));
    }
}
