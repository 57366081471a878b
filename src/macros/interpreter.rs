//! The macro interpreter: a stack machine over parsed macro files.
//!
//! One frame per active macro holds its command position and bound
//! variables. The interpreter owns the procedure/macro thread: repro
//! commands run the procedure synchronously through the scheduler and
//! advance when it terminates. A soft break stores the exact resume
//! position; `resume` continues there and `resume_next` skips one
//! command forward.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info, warn};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::error::{Error, Result};
use crate::filter::FilterGraph;
use crate::macros::expand::{expand_ranges, expand_variables};
use crate::macros::parser::{self, CommandKind, FilterAction, MacroFile};
use crate::options::Options;
use crate::repro::Scheduler;
use crate::session::SessionController;
use crate::ui::UiChannel;

/// Environment exported to shell commands.
const DATA_PATH_ENV: &str = "RELACSDATAPATH";
const DEFAULT_PATH_ENV: &str = "RELACSDEFAULTPATH";

#[derive(Debug, Clone)]
struct Frame {
    macro_index: usize,
    command_index: usize,
    vars: Options,
}

/// What the step loop should do next.
enum Flow {
    Continue,
    /// A switch command replaced the macro file.
    Switched,
}

pub struct MacroInterpreter {
    file: MacroFile,
    config_dir: PathBuf,
    default_path: PathBuf,
    scheduler: Arc<Scheduler>,
    graph: Arc<Mutex<FilterGraph>>,
    session: Arc<SessionController>,
    ui: UiChannel,
    rng: StdRng,
    stack: Vec<Frame>,
    resume: Option<Vec<Frame>>,
    break_requested: Arc<AtomicBool>,
    /// Executed repro calls with their fully expanded parameters.
    history: Vec<(String, String)>,
}

impl MacroInterpreter {
    pub fn new(
        config_dir: PathBuf,
        default_path: PathBuf,
        scheduler: Arc<Scheduler>,
        graph: Arc<Mutex<FilterGraph>>,
        session: Arc<SessionController>,
        ui: UiChannel,
    ) -> MacroInterpreter {
        MacroInterpreter {
            file: MacroFile::default(),
            config_dir,
            default_path,
            scheduler,
            graph,
            session,
            ui,
            rng: StdRng::from_os_rng(),
            stack: Vec::new(),
            resume: None,
            break_requested: Arc::new(AtomicBool::new(false)),
            history: Vec::new(),
        }
    }

    /// Flag handle for the UI thread to request a soft break.
    pub fn break_flag(&self) -> Arc<AtomicBool> {
        self.break_requested.clone()
    }

    pub fn history(&self) -> &[(String, String)] {
        &self.history
    }

    pub fn macro_names(&self) -> Vec<String> {
        self.file.macros.iter().map(|m| m.name.clone()).collect()
    }

    /// Loads and validates a macro file. All problems are reported at
    /// once; the file is rejected if any are fatal.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::ConfigSyntax {
            file: path.display().to_string(),
            line: 0,
            message: e.to_string(),
        })?;
        self.load_str(&path.display().to_string(), &text)
    }

    /// Parses macro definitions from a string and swaps them in.
    pub fn load_str(&mut self, label: &str, text: &str) -> Result<()> {
        let (file, mut errors) = parser::parse(label, text);
        errors.extend(self.validate(&file));
        if !errors.is_empty() {
            for e in &errors {
                error!("{e}");
                self.ui.warning(format!("{e}"));
            }
            return Err(errors.swap_remove(0));
        }
        info!("loaded {} macros from {label}", file.macros.len());
        self.file = file;
        self.stack.clear();
        self.resume = None;
        self.history.clear();
        Ok(())
    }

    /// Checks every reference a macro file makes: repro names, macro
    /// calls, filter nodes, and the fallback requirement.
    fn validate(&self, file: &MacroFile) -> Vec<Error> {
        let mut errors = Vec::new();
        let node_names = self.graph.lock().node_names();
        for m in &file.macros {
            for c in &m.commands {
                match &c.kind {
                    CommandKind::Repro { name, .. } => {
                        if !self.scheduler.contains(name) {
                            errors.push(Error::UnknownPlugin(format!(
                                "{}:{}: procedure {name}",
                                file.label, c.line
                            )));
                        }
                    }
                    CommandKind::MacroCall { name, .. } => {
                        if file.find(name).is_none() {
                            errors.push(Error::InvalidReference(format!(
                                "{}:{}: macro {name}",
                                file.label, c.line
                            )));
                        }
                    }
                    CommandKind::Filter { name, .. } | CommandKind::Detector { name, .. } => {
                        if !node_names.iter().any(|n| n == name) {
                            errors.push(Error::InvalidReference(format!(
                                "{}:{}: filter {name}",
                                file.label, c.line
                            )));
                        }
                    }
                    CommandKind::Switch { file: f } => {
                        if !self.config_dir.join(f).exists() {
                            warn!("switch target {f} does not exist yet");
                        }
                    }
                    _ => {}
                }
            }
        }
        if !self.scheduler.has_fallback() && file.fallback().is_none() {
            errors.push(Error::MissingFallback);
        }
        errors
    }

    /// Runs the startup macro if the file declares one.
    pub fn run_startup(&mut self) -> Result<()> {
        match self.file.startup() {
            Some(index) => self.run_index(index, ""),
            None => Ok(()),
        }
    }

    /// Runs the shutdown macro if the file declares one.
    pub fn run_shutdown(&mut self) -> Result<()> {
        match self.file.shutdown() {
            Some(index) => self.run_index(index, ""),
            None => Ok(()),
        }
    }

    /// Runs a macro by name to completion (or until a soft break).
    pub fn run_macro(&mut self, name: &str) -> Result<()> {
        let index = self
            .file
            .find(name)
            .ok_or_else(|| Error::InvalidReference(name.to_string()))?;
        self.run_index(index, "")
    }

    fn run_index(&mut self, index: usize, params: &str) -> Result<()> {
        self.push_frame(index, params);
        self.step_loop()
    }

    /// Continues at the stored break position.
    pub fn resume(&mut self) -> Result<()> {
        if let Some(stack) = self.resume.take() {
            self.stack = stack;
            self.step_loop()
        } else {
            Ok(())
        }
    }

    /// Continues one command past the stored break position.
    pub fn resume_next(&mut self) -> Result<()> {
        if let Some(mut stack) = self.resume.take() {
            if let Some(top) = stack.last_mut() {
                top.command_index += 1;
            }
            self.stack = stack;
            self.step_loop()
        } else {
            Ok(())
        }
    }

    fn push_frame(&mut self, index: usize, call_params: &str) {
        let def = &self.file.macros[index];
        let mut vars = def.variables.clone();
        if !call_params.is_empty() {
            vars.load(call_params);
        }
        self.stack.push(Frame {
            macro_index: index,
            command_index: 0,
            vars,
        });
    }

    fn step_loop(&mut self) -> Result<()> {
        while let Some(top) = self.stack.last().cloned() {
            if self.break_requested.swap(false, Ordering::AcqRel) {
                info!("macro interpreter break at command {}", top.command_index);
                self.resume = Some(self.stack.clone());
                self.stack.clear();
                return Ok(());
            }
            let def = &self.file.macros[top.macro_index];
            if top.command_index >= def.commands.len() {
                self.stack.pop();
                continue;
            }
            let command = def.commands[top.command_index].clone();
            // advance before dispatch so a macro call resumes correctly
            if let Some(frame) = self.stack.last_mut() {
                frame.command_index += 1;
            }
            if !command.enabled {
                continue;
            }
            match self.dispatch(&command.kind, &top.vars)? {
                Flow::Continue => {}
                Flow::Switched => return Ok(()),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, kind: &CommandKind, vars: &Options) -> Result<Flow> {
        match kind {
            CommandKind::Repro { name, params } => {
                let (expanded, unknown) = expand_variables(params, vars, &mut self.rng);
                for u in unknown {
                    warn!("macro variable {u} is not defined");
                }
                for run_params in expand_ranges(&expanded) {
                    self.history.push((name.clone(), run_params.clone()));
                    match self.scheduler.run(name, &run_params) {
                        Ok(_) => self.session.record_run(name),
                        Err(e) => {
                            warn!("procedure {name} could not run: {e}");
                            self.ui.warning(format!("procedure {name}: {e}"));
                        }
                    }
                    if self.break_requested.load(Ordering::Acquire) {
                        break;
                    }
                }
                Ok(Flow::Continue)
            }
            CommandKind::MacroCall { name, params } => {
                let (expanded, _) = expand_variables(params, vars, &mut self.rng);
                let index = self
                    .file
                    .find(name)
                    .ok_or_else(|| Error::InvalidReference(name.clone()))?;
                self.push_frame(index, &expanded);
                Ok(Flow::Continue)
            }
            CommandKind::Filter { name, action } | CommandKind::Detector { name, action } => {
                self.filter_command(name, action);
                Ok(Flow::Continue)
            }
            CommandKind::Switch { file } => {
                let path = self.config_dir.join(file);
                info!("switching to macro file {}", path.display());
                self.load_file(&path)?;
                Ok(Flow::Switched)
            }
            CommandKind::StartSession => {
                if let Err(e) = self.session.start() {
                    warn!("start-session command: {e}");
                }
                Ok(Flow::Continue)
            }
            CommandKind::Shell { command } => {
                self.shell(command);
                Ok(Flow::Continue)
            }
            CommandKind::Message { timeout, text } => {
                let (expanded, _) = expand_variables(text, vars, &mut self.rng);
                let timeout = (*timeout > 0.0).then_some(*timeout);
                self.ui.info(expanded, timeout);
                Ok(Flow::Continue)
            }
            CommandKind::Browse { file } => {
                self.ui.info(format!("browse: {file}"), None);
                Ok(Flow::Continue)
            }
        }
    }

    fn filter_command(&mut self, name: &str, action: &FilterAction) {
        let result = match action {
            FilterAction::Configure(params) => {
                if params.is_empty() {
                    Ok(())
                } else {
                    self.graph.lock().configure(name, params)
                }
            }
            FilterAction::AutoConfigure { t0, t1 } => {
                self.graph.lock().auto_configure(name, *t0, *t1)
            }
            FilterAction::Save => self.graph.lock().save_settings(name).and_then(|settings| {
                let dir = self
                    .session
                    .path()
                    .unwrap_or_else(|| self.default_path.clone());
                std::fs::create_dir_all(&dir)?;
                std::fs::write(dir.join(format!("{name}.cfg")), settings + "\n")?;
                Ok(())
            }),
        };
        if let Err(e) = result {
            warn!("filter command {name} failed: {e}");
            self.ui.warning(format!("filter {name}: {e}"));
        }
    }

    /// Runs a shell command synchronously with the data paths exported.
    /// A non-zero exit is logged but does not abort the macro.
    fn shell(&self, command: &str) {
        let data_path = self
            .session
            .path()
            .unwrap_or_else(|| self.default_path.clone());
        info!("shell: {command}");
        match Command::new("sh")
            .arg("-c")
            .arg(command)
            .env(DATA_PATH_ENV, &data_path)
            .env(DEFAULT_PATH_ENV, &self.default_path)
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("shell command exited with {status}: {command}"),
            Err(e) => {
                warn!("shell command failed to start: {e}");
                self.ui.warning(format!("shell command failed: {e}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::{DaqEngine, OutPortSpec, TraceSpec, sim_devices};
    use crate::repro::{Outcome, Pause, RePro, ReProContext, SinePulse};
    use crate::storage::PathTemplate;
    use std::sync::Mutex as StdMutex;

    /// Records the parameters of every run for assertions.
    struct Probe {
        options: Options,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl Probe {
        fn new(log: Arc<StdMutex<Vec<String>>>) -> Probe {
            let mut options = Options::new("Probe");
            options.add_number("freq", "Frequency", 0.0, "Hz");
            options.add_number("amp", "Amplitude", 0.0, "mV");
            Probe { options, log }
        }
    }

    impl RePro for Probe {
        fn name(&self) -> &str {
            "Probe"
        }
        fn options(&self) -> &Options {
            &self.options
        }
        fn options_mut(&mut self) -> &mut Options {
            &mut self.options
        }
        fn main(&mut self, _cx: &mut ReProContext) -> Outcome {
            self.log.lock().unwrap().push(format!(
                "freq={} amp={}",
                self.options.number("freq", "Hz"),
                self.options.number("amp", "mV"),
            ));
            Outcome::Completed
        }
    }

    fn harness() -> (MacroInterpreter, Arc<StdMutex<Vec<String>>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (ai, ao, _sim) = sim_devices(1000.0, 1, 0.0, false);
        let ui = UiChannel::new();
        let engine = DaqEngine::new(ui.clone());
        engine
            .open_input(
                Box::new(ai),
                1000.0,
                &[TraceSpec {
                    name: "V-1".to_string(),
                    unit: "mV".to_string(),
                    channel: 0,
                    capacity_secs: 5.0,
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
        let scheduler = crate::repro::Scheduler::new(engine.clone(), ui.clone());
        scheduler.add(Box::new(Pause::new()), true);
        scheduler.add(Box::new(SinePulse::new()), false);
        let log = Arc::new(StdMutex::new(Vec::new()));
        scheduler.add(Box::new(Probe::new(log.clone())), false);
        let graph = Arc::new(Mutex::new(
            FilterGraph::build(Vec::new(), &engine.traces()).unwrap(),
        ));
        let (storage_tx, _storage_rx) = crossbeam::channel::bounded(8);
        let session = SessionController::new(
            dir.path().to_path_buf(),
            PathTemplate::default(),
            storage_tx,
            scheduler.clone(),
            engine.clone(),
            ui.clone(),
        );
        let interp = MacroInterpreter::new(
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            scheduler,
            graph,
            session,
            ui,
        );
        (interp, log, dir)
    }

    #[test]
    fn range_expansion_runs_the_procedure_per_value() {
        let (mut interp, log, _dir) = harness();
        interp
            .load_str("m.cfg", "$ Sweep\n  repro Probe: freq=(100..400..100)Hz\n")
            .unwrap();
        interp.run_macro("Sweep").unwrap();
        let runs = log.lock().unwrap().clone();
        assert_eq!(
            runs,
            vec![
                "freq=100 amp=0",
                "freq=200 amp=0",
                "freq=300 amp=0",
                "freq=400 amp=0",
            ]
        );
    }

    #[test]
    fn variables_bind_into_procedure_options() {
        let (mut interp, log, _dir) = harness();
        interp
            .load_str(
                "m.cfg",
                "$ Probe1 : a=2mV\n  repro Probe: amp=$a; freq=50Hz\n",
            )
            .unwrap();
        interp.run_macro("Probe1").unwrap();
        assert_eq!(log.lock().unwrap().clone(), vec!["freq=50 amp=2"]);
    }

    #[test]
    fn macro_calls_bind_arguments() {
        let (mut interp, log, _dir) = harness();
        interp
            .load_str(
                "m.cfg",
                concat!(
                    "$ Outer\n",
                    "  macro Inner: a=3mV\n",
                    "$ Inner : a=1mV\n",
                    "  repro Probe: amp=$a\n",
                ),
            )
            .unwrap();
        interp.run_macro("Outer").unwrap();
        assert_eq!(log.lock().unwrap().clone(), vec!["freq=0 amp=3"]);
    }

    #[test]
    fn reload_with_identical_content_replays_identically() {
        let (mut interp, _log, _dir) = harness();
        let text = "$ Sweep\n  repro Probe: freq=(1..3)Hz; amp=1mV\n";
        interp.load_str("m.cfg", text).unwrap();
        interp.run_macro("Sweep").unwrap();
        let first = interp.history().to_vec();
        interp.load_str("m.cfg", text).unwrap();
        interp.run_macro("Sweep").unwrap();
        assert_eq!(interp.history(), first.as_slice());
    }

    #[test]
    fn unknown_repro_reference_is_fatal_at_load() {
        let (mut interp, _log, _dir) = harness();
        let result = interp.load_str("m.cfg", "$ M\n  repro NoSuch\n");
        assert!(matches!(result, Err(Error::UnknownPlugin(_))));
    }

    #[test]
    fn unknown_macro_reference_is_fatal_at_load() {
        let (mut interp, _log, _dir) = harness();
        let result = interp.load_str("m.cfg", "$ M\n  macro Ghost\n");
        assert!(matches!(result, Err(Error::InvalidReference(_))));
    }

    #[test]
    fn disabled_commands_are_skipped() {
        let (mut interp, log, _dir) = harness();
        interp
            .load_str(
                "m.cfg",
                "$ M\n  ! repro Probe: freq=1Hz\n  repro Probe: freq=2Hz\n",
            )
            .unwrap();
        interp.run_macro("M").unwrap();
        assert_eq!(log.lock().unwrap().clone(), vec!["freq=2 amp=0"]);
    }

    #[test]
    fn soft_break_stores_resume_position() {
        let (mut interp, log, _dir) = harness();
        interp
            .load_str(
                "m.cfg",
                "$ M\n  repro Probe: freq=1Hz\n  repro Probe: freq=2Hz\n",
            )
            .unwrap();
        // request the break before stepping: the loop stops before the
        // first command and stores the position
        interp.break_flag().store(true, Ordering::Release);
        interp.run_macro("M").unwrap();
        assert!(log.lock().unwrap().is_empty());
        interp.resume().unwrap();
        assert_eq!(
            log.lock().unwrap().clone(),
            vec!["freq=1 amp=0", "freq=2 amp=0"]
        );
    }

    #[test]
    fn resume_next_skips_one_command() {
        let (mut interp, log, _dir) = harness();
        interp
            .load_str(
                "m.cfg",
                "$ M\n  repro Probe: freq=1Hz\n  repro Probe: freq=2Hz\n",
            )
            .unwrap();
        interp.break_flag().store(true, Ordering::Release);
        interp.run_macro("M").unwrap();
        interp.resume_next().unwrap();
        assert_eq!(log.lock().unwrap().clone(), vec!["freq=2 amp=0"]);
    }

    #[test]
    fn shell_command_runs_and_does_not_abort() {
        let (mut interp, log, _dir) = harness();
        interp
            .load_str(
                "m.cfg",
                "$ M\n  shell false\n  repro Probe: freq=9Hz\n",
            )
            .unwrap();
        interp.run_macro("M").unwrap();
        assert_eq!(log.lock().unwrap().clone(), vec!["freq=9 amp=0"]);
    }
}
