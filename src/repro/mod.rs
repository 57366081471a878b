//! Research programs (RePros): the procedure contract, the
//! one-at-a-time scheduler with cooperative preemption, the wait
//! primitives, and the built-in procedures.

pub mod builtin;
pub mod context;
pub mod scheduler;

pub use builtin::{Pause, SinePulse};
pub use context::{InterruptFlag, ReProContext};
pub use scheduler::{Outcome, RePro, ReProState, RunCounters, Scheduler};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::{DaqEngine, OutPortSpec, TraceSpec, sim_devices};
    use crate::error::Error;
    use crate::ui::UiChannel;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn sim_scheduler() -> (Arc<Scheduler>, Arc<DaqEngine>) {
        let (ai, ao, _sim) = sim_devices(1000.0, 1, 0.0, false);
        let engine = DaqEngine::new(UiChannel::new());
        engine
            .open_input(
                Box::new(ai),
                1000.0,
                &[TraceSpec {
                    name: "V-1".to_string(),
                    unit: "mV".to_string(),
                    channel: 0,
                    capacity_secs: 10.0,
                }],
            )
            .unwrap();
        engine
            .open_output(
                Box::new(ao),
                vec![OutPortSpec {
                    name: "Out-1".to_string(),
                    channel: 0,
                    attenuator: None,
                }],
            )
            .unwrap();
        let scheduler = Scheduler::new(engine.clone(), UiChannel::new());
        (scheduler, engine)
    }

    #[test]
    fn completed_run_updates_counters() {
        let (scheduler, _engine) = sim_scheduler();
        scheduler.add(Box::new(Pause::new()), true);
        let outcome = scheduler.run("Pause", "duration=0.01s").unwrap();
        assert_eq!(outcome, Outcome::Completed);
        let c = scheduler.counters("Pause").unwrap();
        assert_eq!(
            c,
            RunCounters {
                complete: 1,
                total: 1,
                all: 1,
                failed: 0
            }
        );
        assert_eq!(scheduler.state(), ReProState::Idle);
    }

    #[test]
    fn parameters_revert_to_defaults_after_the_run() {
        let (scheduler, _engine) = sim_scheduler();
        scheduler.add(Box::new(Pause::new()), true);
        scheduler.run("Pause", "duration=0.01s").unwrap();
        // a second run without parameters uses the default again
        let start = Instant::now();
        let h = {
            let s = scheduler.clone();
            thread::spawn(move || s.run("Pause", "").unwrap())
        };
        thread::sleep(Duration::from_millis(30));
        scheduler.request_stop();
        assert_eq!(h.join().unwrap(), Outcome::Aborted);
        // default duration is 1 s; the abort came well before that
        assert!(start.elapsed() < Duration::from_millis(800));
    }

    #[test]
    fn request_stop_honored_within_one_suspension() {
        let (scheduler, _engine) = sim_scheduler();
        scheduler.add(Box::new(Pause::new()), true);
        let s = scheduler.clone();
        let started = Instant::now();
        let h = thread::spawn(move || s.run("Pause", "duration=30s"));
        thread::sleep(Duration::from_millis(30));
        scheduler.request_stop();
        let outcome = h.join().unwrap().unwrap();
        assert_eq!(outcome, Outcome::Aborted);
        assert!(started.elapsed() < Duration::from_secs(2));
        let c = scheduler.counters("Pause").unwrap();
        assert_eq!(c.total, 1);
        assert_eq!(c.complete, 0);
    }

    #[test]
    fn only_one_procedure_runs_at_a_time() {
        let (scheduler, _engine) = sim_scheduler();
        scheduler.add(Box::new(Pause::new()), true);
        let s = scheduler.clone();
        let h = thread::spawn(move || s.run("Pause", "duration=0.5s"));
        thread::sleep(Duration::from_millis(50));
        assert!(matches!(scheduler.run("Pause", ""), Err(Error::Busy(_))));
        scheduler.request_stop();
        h.join().unwrap().unwrap();
    }

    #[test]
    fn missing_fallback_is_an_error() {
        let (scheduler, _engine) = sim_scheduler();
        scheduler.add(Box::new(SinePulse::new()), false);
        assert!(matches!(scheduler.run_fallback(), Err(Error::MissingFallback)));
    }

    #[test]
    fn unknown_procedure_is_reported() {
        let (scheduler, _engine) = sim_scheduler();
        assert!(matches!(
            scheduler.run("NoSuch", ""),
            Err(Error::UnknownPlugin(_))
        ));
        assert_eq!(scheduler.state(), ReProState::Idle);
    }

    #[test]
    fn sine_pulse_emits_stimuli_and_completes() {
        let (scheduler, engine) = sim_scheduler();
        scheduler.add(Box::new(SinePulse::new()), false);
        let service = {
            let engine = engine.clone();
            let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let flag = stop.clone();
            let h = thread::spawn(move || {
                while !flag.load(std::sync::atomic::Ordering::Acquire) {
                    engine.service_step();
                    thread::sleep(Duration::from_millis(1));
                }
            });
            (h, stop)
        };
        let outcome = scheduler
            .run(
                "SinePulse",
                "freq=100Hz; duration=0.02s; pause=0.01s; repeats=2",
            )
            .unwrap();
        assert_eq!(outcome, Outcome::Completed);
        service.1.store(true, std::sync::atomic::Ordering::Release);
        service.0.join().unwrap();
        let queue = engine.stimulus_queue();
        let mut n = 0;
        while queue.pop().is_some() {
            n += 1;
        }
        assert_eq!(n, 2);
    }
}
