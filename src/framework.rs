//! The framework aggregate: one struct owning the engine, the filter
//! graph, the scheduler, the session controller, the persistence
//! thread and the macro interpreter. There are no process-wide
//! registries; everything reachable hangs off this value.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded};
use log::{info, warn};
use parking_lot::Mutex;

use crate::daq::{DaqEngine, LinearAttenuate, OutPortSpec, TraceSpec, sim_devices};
use crate::error::{Error, Result};
use crate::filter::{FilterGraph, MovingAverage, NodeSpec, ThresholdDetector};
use crate::macros::MacroInterpreter;
use crate::repro::{Pause, Scheduler, SinePulse};
use crate::session::SessionController;
use crate::storage::{PathTemplate, StorageCommand, StorageThread};
use crate::ui::UiChannel;

#[derive(Debug, Clone)]
pub struct FrameworkConfig {
    /// Directory holding macros.cfg and friends.
    pub config_dir: PathBuf,
    /// Base directory for session data.
    pub data_dir: PathBuf,
    pub simulate: bool,
    pub no_save: bool,
    pub start_macro: Option<String>,
    pub sample_rate: f64,
    /// Service period of the DAQ thread.
    pub daq_period: Duration,
    /// Optional core to pin the DAQ thread to.
    pub core: Option<usize>,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        FrameworkConfig {
            config_dir: PathBuf::from("."),
            data_dir: PathBuf::from("data"),
            simulate: true,
            no_save: false,
            start_macro: None,
            sample_rate: 20_000.0,
            daq_period: Duration::from_millis(1),
            core: None,
        }
    }
}

/// Requests handled by the procedure/macro thread.
pub enum ProcCommand {
    RunMacro(String),
    Resume,
    ResumeNext,
    Shutdown,
}

pub struct Framework {
    pub config: FrameworkConfig,
    pub ui: UiChannel,
    pub engine: Arc<DaqEngine>,
    pub graph: Arc<Mutex<FilterGraph>>,
    pub scheduler: Arc<Scheduler>,
    pub session: Arc<SessionController>,
    running: Arc<AtomicBool>,
    storage_tx: Sender<StorageCommand>,
    proc_tx: Sender<ProcCommand>,
    proc_rx: Option<Receiver<ProcCommand>>,
    interpreter: Option<MacroInterpreter>,
    handles: Vec<JoinHandle<()>>,
}

impl Framework {
    /// Builds the whole stack. Only the simulation backend is wired in
    /// here; board drivers are external and their absence is a
    /// hardware-open failure.
    pub fn build(config: FrameworkConfig) -> Result<Framework> {
        if !config.simulate {
            return Err(Error::InvalidDevice(
                "no hardware drivers are linked into this build; use --simulate".to_string(),
            ));
        }
        let ui = UiChannel::new();
        let engine = DaqEngine::new(ui.clone());
        let (ai, ao, _sim) = sim_devices(config.sample_rate, 1, 0.002, false);
        engine.open_input(
            Box::new(ai),
            config.sample_rate,
            &[TraceSpec {
                name: "V-1".to_string(),
                unit: "mV".to_string(),
                channel: 0,
                capacity_secs: 60.0,
            }],
        )?;
        engine.open_output(
            Box::new(ao),
            vec![OutPortSpec {
                name: "Out-1".to_string(),
                channel: 0,
                attenuator: Some(Box::new(LinearAttenuate::new(-25.0, 80.0, 0.5))),
            }],
        )?;
        engine.start_input()?;
        if config.no_save {
            engine.set_save_master(false);
        }

        let specs = vec![
            NodeSpec {
                node: Box::new(MovingAverage::new("lowpass", 8)),
                in_traces: vec!["V-1".to_string()],
                in_events: vec![],
                out_traces: vec![("V-lp".to_string(), "mV".to_string())],
                out_events: vec![],
            },
            NodeSpec {
                node: Box::new(ThresholdDetector::new("spikes", 0.5, "mV")),
                in_traces: vec!["V-lp".to_string()],
                in_events: vec![],
                out_traces: vec![],
                out_events: vec!["Spikes-1".to_string()],
            },
        ];
        let graph = FilterGraph::build(specs, &engine.traces())?;
        let events: Vec<_> = graph.derived_events().to_vec();
        engine.set_event_streams(events.clone());
        let graph = Arc::new(Mutex::new(graph));

        let scheduler = Scheduler::new(engine.clone(), ui.clone());
        scheduler.set_event_streams(events.clone());
        scheduler.add(Box::new(Pause::new()), true);
        scheduler.add(Box::new(SinePulse::new()), false);

        let (storage_tx, storage_rx) = bounded(16);
        let storage_handle =
            StorageThread::spawn(storage_rx, engine.stimulus_queue(), ui.clone());

        let session = SessionController::new(
            config.data_dir.clone(),
            PathTemplate::default(),
            storage_tx.clone(),
            scheduler.clone(),
            engine.clone(),
            ui.clone(),
        );
        session.set_event_streams(events);

        let interpreter = MacroInterpreter::new(
            config.config_dir.clone(),
            config.data_dir.clone(),
            scheduler.clone(),
            graph.clone(),
            session.clone(),
            ui.clone(),
        );

        let (proc_tx, proc_rx) = bounded(16);
        Ok(Framework {
            config,
            ui,
            engine,
            graph,
            scheduler,
            session,
            running: Arc::new(AtomicBool::new(false)),
            storage_tx,
            proc_tx,
            proc_rx: Some(proc_rx),
            interpreter: Some(interpreter),
            handles: vec![storage_handle],
        })
    }

    /// Loads macros.cfg from the config directory. Refuses to start
    /// without a resolvable fallback.
    pub fn load_macros(&mut self) -> Result<()> {
        let interpreter = self
            .interpreter
            .as_mut()
            .expect("load_macros before start");
        let path = self.config.config_dir.join("macros.cfg");
        if path.exists() {
            interpreter.load_file(&path)
        } else if self.scheduler.has_fallback() {
            info!("no macros.cfg under {}", self.config.config_dir.display());
            Ok(())
        } else {
            Err(Error::MissingFallback)
        }
    }

    pub fn proc_commands(&self) -> Sender<ProcCommand> {
        self.proc_tx.clone()
    }

    /// Starts the real-time threads and the procedure/macro thread.
    pub fn start(&mut self) {
        self.running.store(true, Ordering::Release);
        let daq_handle = self.engine.start(self.config.daq_period, self.config.core);
        self.handles.push(daq_handle);
        let filter_handle = crate::filter::driver::start(
            self.graph.clone(),
            self.engine.subscribe_advance(),
            self.running.clone(),
        );
        self.handles.push(filter_handle);

        let mut interpreter = self.interpreter.take().expect("started once");
        let rx = self.proc_rx.take().expect("started once");
        let running = self.running.clone();
        let scheduler = self.scheduler.clone();
        let start_macro = self.config.start_macro.clone();
        let proc_handle = thread::Builder::new()
            .name("procedure".to_string())
            .spawn(move || {
                if let Err(e) = interpreter.run_startup() {
                    warn!("startup macro failed: {e}");
                }
                if let Some(name) = start_macro {
                    if let Err(e) = interpreter.run_macro(&name) {
                        warn!("start macro {name} failed: {e}");
                    }
                }
                procedure_loop(&mut interpreter, &scheduler, &rx, &running);
                if let Err(e) = interpreter.run_shutdown() {
                    warn!("shutdown macro failed: {e}");
                }
            })
            .expect("spawning the procedure thread");
        self.handles.push(proc_handle);
    }

    /// Stops every thread and joins them.
    pub fn shutdown(&mut self) {
        info!("shutting down");
        let _ = self.proc_tx.send(ProcCommand::Shutdown);
        self.scheduler.request_stop();
        if self.session.active() {
            let _ = self.session.stop(!self.config.no_save);
        }
        self.running.store(false, Ordering::Release);
        self.engine.stop();
        let _ = self.storage_tx.send(StorageCommand::Shutdown);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.engine.close();
    }
}

/// The idle loop of the procedure/macro thread: serve requests, and
/// keep the fallback procedure running in between.
fn procedure_loop(
    interpreter: &mut MacroInterpreter,
    scheduler: &Arc<Scheduler>,
    rx: &Receiver<ProcCommand>,
    running: &Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        match rx.try_recv() {
            Ok(ProcCommand::RunMacro(name)) => {
                if let Err(e) = interpreter.run_macro(&name) {
                    warn!("macro {name} failed: {e}");
                }
                continue;
            }
            Ok(ProcCommand::Resume) => {
                if let Err(e) = interpreter.resume() {
                    warn!("resume failed: {e}");
                }
                continue;
            }
            Ok(ProcCommand::ResumeNext) => {
                if let Err(e) = interpreter.resume_next() {
                    warn!("resume failed: {e}");
                }
                continue;
            }
            Ok(ProcCommand::Shutdown) => return,
            Err(_) => {}
        }
        // nothing queued: the fallback procedure fills the gap
        match scheduler.run_fallback() {
            Ok(_) => {}
            Err(Error::MissingFallback) => {
                warn!("no fallback procedure; procedure thread idles");
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                warn!("fallback run failed: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_mode_without_drivers_fails_loudly() {
        let config = FrameworkConfig {
            simulate: false,
            ..FrameworkConfig::default()
        };
        assert!(matches!(
            Framework::build(config),
            Err(Error::InvalidDevice(_))
        ));
    }

    #[test]
    fn simulated_stack_starts_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let config = FrameworkConfig {
            config_dir: dir.path().to_path_buf(),
            data_dir: dir.path().join("data"),
            daq_period: Duration::from_millis(2),
            ..FrameworkConfig::default()
        };
        let mut fw = Framework::build(config).unwrap();
        fw.load_macros().unwrap();
        fw.start();
        thread::sleep(Duration::from_millis(120));
        // the DAQ thread has produced samples and the filter graph
        // derived a low-passed trace from them
        let raw = fw.engine.trace("V-1").unwrap();
        assert!(raw.produced() > 0);
        let lp = fw
            .graph
            .lock()
            .derived_traces()
            .iter()
            .find(|t| t.name() == "V-lp")
            .cloned()
            .unwrap();
        fw.shutdown();
        assert!(lp.produced() > 0);
        assert!(lp.produced() <= raw.produced());
    }
}
