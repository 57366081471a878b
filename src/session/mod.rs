//! The session controller: groups acquisition into sessions that end
//! either saved or discarded.
//!
//! Starting a session picks a fresh directory from the path template
//! and tells the persistence thread to open the data files there;
//! stopping either finalizes them in place or removes the whole
//! directory. Run counters reset on both edges of `Active`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, bounded};
use log::{info, warn};
use parking_lot::Mutex;

use crate::daq::DaqEngine;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::repro::Scheduler;
use crate::storage::{PathTemplate, StorageCommand};
use crate::store::EventStream;
use crate::ui::{UiChannel, UiEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Saving,
    Discarding,
}

pub struct SessionController {
    state: Mutex<SessionState>,
    base_dir: PathBuf,
    template: PathTemplate,
    path: Mutex<Option<PathBuf>>,
    started: Mutex<Option<Instant>>,
    metadata: Mutex<Options>,
    runs: Mutex<Vec<String>>,
    storage: Sender<StorageCommand>,
    scheduler: Arc<Scheduler>,
    engine: Arc<DaqEngine>,
    events: Mutex<Vec<Arc<EventStream>>>,
    ui: UiChannel,
}

impl SessionController {
    pub fn new(
        base_dir: PathBuf,
        template: PathTemplate,
        storage: Sender<StorageCommand>,
        scheduler: Arc<Scheduler>,
        engine: Arc<DaqEngine>,
        ui: UiChannel,
    ) -> Arc<SessionController> {
        Arc::new(SessionController {
            state: Mutex::new(SessionState::Idle),
            base_dir,
            template,
            path: Mutex::new(None),
            started: Mutex::new(None),
            metadata: Mutex::new(Options::new("session")),
            runs: Mutex::new(Vec::new()),
            storage,
            scheduler,
            engine,
            events: Mutex::new(Vec::new()),
            ui,
        })
    }

    pub fn set_event_streams(&self, events: Vec<Arc<EventStream>>) {
        *self.events.lock() = events;
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Base path of the running session, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().clone()
    }

    pub fn metadata(&self) -> Options {
        self.metadata.lock().clone()
    }

    pub fn set_metadata(&self, metadata: Options) {
        *self.metadata.lock() = metadata;
    }

    pub fn record_run(&self, repro: &str) {
        if self.active() {
            self.runs.lock().push(repro.to_string());
        }
    }

    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().clone()
    }

    /// Seconds since session start.
    pub fn elapsed(&self) -> f64 {
        self.started
            .lock()
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Idle {
                return Err(Error::Busy("a session is already active".to_string()));
            }
            *state = SessionState::Active;
        }
        let path = self.template.next_free(&self.base_dir);
        info!("starting session under {}", path.display());
        *self.path.lock() = Some(path.clone());
        *self.started.lock() = Some(Instant::now());
        self.runs.lock().clear();
        self.scheduler.reset_counters();
        self.storage
            .send(StorageCommand::StartSession {
                path,
                metadata: self.metadata.lock().clone(),
                traces: self.engine.traces(),
                events: self.events.lock().clone(),
            })
            .map_err(|_| Error::Unknown("storage thread gone".to_string()))?;
        self.ui.post(UiEvent::SessionStarted);
        Ok(())
    }

    /// Ends the session; `save` decides between keeping the files and
    /// removing the whole session directory. The state stays `Saving`
    /// or `Discarding` until the persistence thread has finalized or
    /// deleted the files; only then does it return to `Idle`, so a new
    /// session can never start over a directory still being written.
    pub fn stop(&self, save: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Active {
                return Err(Error::Busy("no session is active".to_string()));
            }
            *state = if save {
                SessionState::Saving
            } else {
                SessionState::Discarding
            };
        }
        let (done_tx, done_rx) = bounded(1);
        if self
            .storage
            .send(StorageCommand::StopSession {
                save,
                done: done_tx,
            })
            .is_ok()
        {
            if done_rx.recv_timeout(Duration::from_secs(60)).is_err() {
                warn!("persistence did not acknowledge the session stop");
            }
        } else {
            warn!("storage thread gone while stopping the session");
        }
        let path = self.path.lock().take();
        *self.started.lock() = None;
        self.scheduler.reset_counters();
        *self.state.lock() = SessionState::Idle;
        self.ui.post(UiEvent::SessionStopped { saved: save });
        if let Some(p) = path {
            info!(
                "session under {} {}",
                p.display(),
                if save { "saved" } else { "discarded" }
            );
        }
        Ok(())
    }

    /// Toggle used by the start-session macro command and the UI.
    pub fn toggle(&self, save_on_stop: bool) -> Result<()> {
        match self.state() {
            SessionState::Idle => self.start(),
            SessionState::Active => self.stop(save_on_stop),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::DaqEngine;
    use crate::repro::Scheduler;
    use crate::storage::StorageThread;
    use crate::ui::UiChannel;
    use std::thread::JoinHandle;

    fn controller(
        dir: &std::path::Path,
    ) -> (
        Arc<SessionController>,
        JoinHandle<()>,
        Sender<StorageCommand>,
    ) {
        let ui = UiChannel::new();
        let engine = DaqEngine::new(ui.clone());
        let scheduler = Scheduler::new(engine.clone(), ui.clone());
        let (tx, rx) = bounded(8);
        let handle = StorageThread::spawn(rx, engine.stimulus_queue(), ui.clone());
        let session = SessionController::new(
            dir.to_path_buf(),
            PathTemplate::default(),
            tx.clone(),
            scheduler,
            engine,
            ui,
        );
        (session, handle, tx)
    }

    #[test]
    fn discard_completes_before_stop_returns() {
        let dir = tempfile::tempdir().unwrap();
        let (session, handle, tx) = controller(dir.path());
        session.start().unwrap();
        let path = session.path().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(path.exists());
        assert_eq!(session.state(), SessionState::Active);

        session.stop(false).unwrap();
        // no settling sleep: the delete already happened when stop
        // returned, and only then did the state drop back to Idle
        assert!(!path.exists());
        assert_eq!(session.state(), SessionState::Idle);

        tx.send(StorageCommand::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn save_finalizes_before_stop_returns() {
        let dir = tempfile::tempdir().unwrap();
        let (session, handle, tx) = controller(dir.path());
        session.start().unwrap();
        let path = session.path().unwrap();
        std::thread::sleep(Duration::from_millis(60));

        session.stop(true).unwrap();
        assert!(path.join("metadata.cfg").exists());
        assert_eq!(session.state(), SessionState::Idle);

        tx.send(StorageCommand::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn back_to_back_sessions_never_share_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (session, handle, tx) = controller(dir.path());
        session.start().unwrap();
        let first = session.path().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        session.stop(true).unwrap();

        // the previous directory is fully finalized, so an immediate
        // restart bumps the path counter instead of reusing it
        session.start().unwrap();
        let second = session.path().unwrap();
        assert_ne!(first, second);
        session.stop(false).unwrap();

        tx.send(StorageCommand::Shutdown).unwrap();
        handle.join().unwrap();
    }
}
