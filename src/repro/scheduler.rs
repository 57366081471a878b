//! The procedure scheduler: a catalog of research programs of which
//! exactly one runs at a time.
//!
//! `main` executes on the caller's thread (the procedure/macro thread);
//! other threads request cooperative termination through the interrupt
//! flag. Run outcomes drive per-procedure counters which are reset on
//! session boundaries.

use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::daq::DaqEngine;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::repro::context::{InterruptFlag, ReProContext};
use crate::store::EventStream;
use crate::ui::{UiChannel, UiEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReProState {
    Idle,
    Running,
    Stopping,
}

/// A user-supplied experimental paradigm.
pub trait RePro: Send {
    fn name(&self) -> &str;
    fn options(&self) -> &Options;
    fn options_mut(&mut self) -> &mut Options;
    /// The procedure body. Must return promptly once
    /// `cx.interrupted()` turns true.
    fn main(&mut self, cx: &mut ReProContext) -> Outcome;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    /// Runs that returned `Completed`.
    pub complete: u64,
    /// Runs that returned `Completed` or `Aborted`.
    pub total: u64,
    /// Every run regardless of outcome.
    pub all: u64,
    /// Runs that returned `Failed`.
    pub failed: u64,
}

struct Slot {
    repro: Box<dyn RePro>,
    counters: RunCounters,
    last_outcome: Option<Outcome>,
    fallback: bool,
}

pub struct Scheduler {
    slots: Mutex<Vec<Slot>>,
    state: Mutex<ReProState>,
    current: Mutex<Option<String>>,
    interrupt: Arc<InterruptFlag>,
    engine: Arc<DaqEngine>,
    events: Mutex<Vec<Arc<EventStream>>>,
    ui: UiChannel,
}

impl Scheduler {
    pub fn new(engine: Arc<DaqEngine>, ui: UiChannel) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            slots: Mutex::new(Vec::new()),
            state: Mutex::new(ReProState::Idle),
            current: Mutex::new(None),
            interrupt: InterruptFlag::new(),
            engine,
            events: Mutex::new(Vec::new()),
            ui,
        })
    }

    pub fn add(&self, repro: Box<dyn RePro>, fallback: bool) {
        info!(
            "registered procedure {}{}",
            repro.name(),
            if fallback { " (fallback)" } else { "" }
        );
        self.slots.lock().push(Slot {
            repro,
            counters: RunCounters::default(),
            last_outcome: None,
            fallback,
        });
    }

    /// Registers the event streams procedures may read.
    pub fn set_event_streams(&self, events: Vec<Arc<EventStream>>) {
        *self.events.lock() = events;
    }

    pub fn names(&self) -> Vec<String> {
        self.slots
            .lock()
            .iter()
            .map(|s| s.repro.name().to_string())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots
            .lock()
            .iter()
            .any(|s| s.repro.name().eq_ignore_ascii_case(name))
    }

    pub fn has_fallback(&self) -> bool {
        self.slots.lock().iter().any(|s| s.fallback)
    }

    pub fn fallback_name(&self) -> Result<String> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.fallback)
            .map(|s| s.repro.name().to_string())
            .ok_or(Error::MissingFallback)
    }

    pub fn state(&self) -> ReProState {
        *self.state.lock()
    }

    pub fn current(&self) -> Option<String> {
        self.current.lock().clone()
    }

    pub fn counters(&self, name: &str) -> Option<RunCounters> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.repro.name().eq_ignore_ascii_case(name))
            .map(|s| s.counters)
    }

    pub fn last_outcome(&self, name: &str) -> Option<Outcome> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.repro.name().eq_ignore_ascii_case(name))
            .and_then(|s| s.last_outcome)
    }

    /// Resets every run counter (session start and stop).
    pub fn reset_counters(&self) {
        for slot in self.slots.lock().iter_mut() {
            slot.counters = RunCounters::default();
        }
    }

    /// Sets the interrupt flag of the running procedure and releases
    /// its sleeps. Callable from any thread.
    pub fn request_stop(&self) {
        let mut state = self.state.lock();
        if *state == ReProState::Running {
            *state = ReProState::Stopping;
            self.interrupt.set();
        }
    }

    /// Requests a stop at the procedure's next natural boundary.
    pub fn soft_stop(&self) {
        self.interrupt.set_soft();
    }

    /// Wakes a procedure blocked in `sleep_wait`.
    pub fn wake(&self) {
        self.interrupt.wake();
    }

    pub fn interrupt_flag(&self) -> Arc<InterruptFlag> {
        self.interrupt.clone()
    }

    /// Runs a procedure to completion on the calling thread.
    /// `params` are bound into the procedure's options first; values
    /// revert to their defaults afterwards.
    pub fn run(&self, name: &str, params: &str) -> Result<Outcome> {
        {
            let mut state = self.state.lock();
            if *state != ReProState::Idle {
                return Err(Error::Busy(format!(
                    "cannot start {name}: a procedure is already running"
                )));
            }
            *state = ReProState::Running;
        }

        // take the procedure out of its slot for the duration of the run
        let (mut repro, pos) = {
            let mut slots = self.slots.lock();
            let Some(pos) = slots
                .iter()
                .position(|s| s.repro.name().eq_ignore_ascii_case(name))
            else {
                *self.state.lock() = ReProState::Idle;
                return Err(Error::UnknownPlugin(name.to_string()));
            };
            let placeholder: Box<dyn RePro> = Box::new(IdleRePro::default());
            (std::mem::replace(&mut slots[pos].repro, placeholder), pos)
        };

        if !params.is_empty() {
            for unknown in repro.options_mut().assign_from(params) {
                warn!("{name}: unknown parameter {unknown}");
            }
        }

        self.interrupt.clear();
        self.engine.set_saving(true);
        self.engine.set_current_repro(repro.name());
        *self.current.lock() = Some(repro.name().to_string());
        self.ui.post(UiEvent::ReProStarted {
            name: repro.name().to_string(),
        });
        info!("starting procedure {}", repro.name());

        let mut cx = ReProContext::new(
            self.engine.clone(),
            self.events.lock().clone(),
            self.interrupt.clone(),
            self.ui.clone(),
        );
        let outcome = repro.main(&mut cx);

        repro.options_mut().set_to_defaults();
        {
            let mut slots = self.slots.lock();
            let slot = &mut slots[pos];
            slot.counters.all += 1;
            match outcome {
                Outcome::Completed => {
                    slot.counters.complete += 1;
                    slot.counters.total += 1;
                }
                Outcome::Aborted => slot.counters.total += 1,
                Outcome::Failed => slot.counters.failed += 1,
            }
            slot.last_outcome = Some(outcome);
            slot.repro = repro;
        }
        *self.current.lock() = None;
        *self.state.lock() = ReProState::Idle;
        self.ui.post(UiEvent::ReProFinished {
            name: name.to_string(),
            outcome,
        });
        info!("procedure {name} finished: {outcome:?}");
        Ok(outcome)
    }

    /// Runs the fallback procedure once.
    pub fn run_fallback(&self) -> Result<Outcome> {
        let name = self.fallback_name()?;
        self.run(&name, "")
    }
}

/// Occupies a slot while its procedure is running.
#[derive(Default)]
struct IdleRePro {
    options: Options,
}

impl RePro for IdleRePro {
    fn name(&self) -> &str {
        "idle-placeholder"
    }
    fn options(&self) -> &Options {
        &self.options
    }
    fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }
    fn main(&mut self, _cx: &mut ReProContext) -> Outcome {
        Outcome::Completed
    }
}
