//! The persistence thread: tails every trace and event buffer in whole
//! contiguous chunks and appends them to the session's data files,
//! together with the stimulus index.
//!
//! Outside a session the thread keeps draining so buffers never back
//! up; the drained data is discarded. File writes are batched per poll
//! and flushed periodically to keep syscall jitter away from the
//! real-time threads.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use crossbeam_queue::ArrayQueue;
use log::{debug, error, info, warn};

use crate::daq::StimulusDescriptor;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::storage::index::StimulusIndexWriter;
use crate::storage::tablekey::TableKey;
use crate::store::{EventStream, InputTrace};
use crate::ui::UiChannel;

/// Poll interval of the persistence loop.
const POLL: Duration = Duration::from_millis(20);
/// Flush the writers every this many polls.
const FLUSH_POLLS: usize = 8;

pub enum StorageCommand {
    StartSession {
        path: PathBuf,
        metadata: Options,
        traces: Vec<Arc<InputTrace>>,
        events: Vec<Arc<EventStream>>,
    },
    StopSession {
        save: bool,
        /// Signalled once the files are finalized (or the session
        /// directory is removed); the session controller blocks on it.
        done: Sender<()>,
    },
    Shutdown,
}

struct TraceFile {
    trace: Arc<InputTrace>,
    writer: BufWriter<File>,
    key: TableKey,
    next: usize,
}

struct EventFile {
    stream: Arc<EventStream>,
    writer: BufWriter<File>,
    key: TableKey,
    next: usize,
}

struct OpenSession {
    path: PathBuf,
    t0: f64,
    traces: Vec<TraceFile>,
    events: Vec<EventFile>,
    index: StimulusIndexWriter,
}

pub struct StorageThread {
    commands: Receiver<StorageCommand>,
    stimuli: Arc<ArrayQueue<StimulusDescriptor>>,
    ui: UiChannel,
    session: Option<OpenSession>,
    /// Buffers drained outside a session, to keep consumed indices moving.
    idle_traces: Vec<(Arc<InputTrace>, usize)>,
    scratch: Vec<f64>,
}

impl StorageThread {
    pub fn spawn(
        commands: Receiver<StorageCommand>,
        stimuli: Arc<ArrayQueue<StimulusDescriptor>>,
        ui: UiChannel,
    ) -> JoinHandle<()> {
        thread::Builder::new()
            .name("storage".to_string())
            .spawn(move || {
                let mut st = StorageThread {
                    commands,
                    stimuli,
                    ui,
                    session: None,
                    idle_traces: Vec::new(),
                    scratch: Vec::new(),
                };
                st.run();
            })
            .expect("spawning the storage thread")
    }

    fn run(&mut self) {
        let mut polls = 0usize;
        loop {
            match self.commands.recv_timeout(POLL) {
                Ok(StorageCommand::StartSession {
                    path,
                    metadata,
                    traces,
                    events,
                }) => {
                    if let Err(e) = self.open_session(path, &metadata, traces, events) {
                        error!("could not open session files: {e}");
                        self.ui.fatal(format!("could not open session files: {e}"));
                    }
                }
                Ok(StorageCommand::StopSession { save, done }) => {
                    self.close_session(save);
                    let _ = done.send(());
                }
                Ok(StorageCommand::Shutdown) => {
                    self.close_session(true);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.close_session(true);
                    break;
                }
            }
            if let Err(e) = self.poll_data() {
                warn!("persistence pass failed: {e}");
            }
            polls += 1;
            if polls % FLUSH_POLLS == 0 {
                self.flush();
            }
        }
        debug!("storage thread stopped");
    }

    fn open_session(
        &mut self,
        path: PathBuf,
        metadata: &Options,
        traces: Vec<Arc<InputTrace>>,
        events: Vec<Arc<EventStream>>,
    ) -> Result<()> {
        fs::create_dir_all(&path)?;
        let t0 = traces.first().map(|t| t.current_time()).unwrap_or(0.0);

        let mut meta_file = BufWriter::new(File::create(path.join("metadata.cfg"))?);
        for line in metadata.save_lines(0) {
            writeln!(meta_file, "# {line}")?;
        }
        meta_file.flush()?;

        let mut trace_files = Vec::with_capacity(traces.len());
        for t in traces {
            let file = File::create(path.join(format!("trace-{}.dat", t.name())))?;
            let mut writer = BufWriter::new(file);
            for line in metadata.save_lines(0) {
                writeln!(writer, "# {line}")?;
            }
            writeln!(writer, "# trace: {}", t.name())?;
            writeln!(writer, "# sample interval: {}s", t.sample_interval())?;
            let mut key = TableKey::new();
            key.add_number("t", "s", "%10.5f");
            key.add_number(t.name(), t.unit(), "%9.4f");
            key.write_key(&mut writer)?;
            let next = t.produced();
            trace_files.push(TraceFile {
                trace: t,
                writer,
                key,
                next,
            });
        }

        let mut event_files = Vec::with_capacity(events.len());
        for e in events {
            let file = File::create(path.join(format!("events-{}.dat", e.name())))?;
            let mut writer = BufWriter::new(file);
            writeln!(writer, "# events: {}", e.name())?;
            let mut key = TableKey::new();
            key.add_number("t", "s", "%10.5f");
            key.add_number("size", e.size_unit().unwrap_or("-"), "%9.4f");
            key.add_number("width", e.width_unit().unwrap_or("s"), "%9.5f");
            key.write_key(&mut writer)?;
            let next = e.produced();
            event_files.push(EventFile {
                stream: e,
                writer,
                key,
                next,
            });
        }

        let trace_names: Vec<String> = trace_files
            .iter()
            .map(|t| t.trace.name().to_string())
            .collect();
        let event_names: Vec<String> = event_files
            .iter()
            .map(|e| e.stream.name().to_string())
            .collect();
        let index = StimulusIndexWriter::create(&path.join("stimuli.dat"), &trace_names, &event_names)?;

        info!("session files open under {}", path.display());
        self.idle_traces.clear();
        self.session = Some(OpenSession {
            path,
            t0,
            traces: trace_files,
            events: event_files,
            index,
        });
        Ok(())
    }

    fn close_session(&mut self, save: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        // final drain so the files carry everything up to the stop
        if save {
            if let Err(e) = Self::drain_session(&mut session, &self.stimuli, &mut self.scratch, &self.ui)
            {
                warn!("final persistence pass failed: {e}");
            }
        }
        for t in &mut session.traces {
            let _ = t.writer.flush();
        }
        for e in &mut session.events {
            let _ = e.writer.flush();
        }
        let _ = session.index.flush();
        // keep draining idly from where the session left off
        self.idle_traces = session
            .traces
            .iter()
            .map(|t| (t.trace.clone(), t.next))
            .collect();
        drop(session.traces);
        drop(session.events);
        drop(session.index);
        if save {
            info!("session saved under {}", session.path.display());
        } else {
            match fs::remove_dir_all(&session.path) {
                Ok(()) => info!("session discarded, {} removed", session.path.display()),
                Err(e) => error!("could not remove {}: {e}", session.path.display()),
            }
        }
    }

    fn poll_data(&mut self) -> Result<()> {
        match &mut self.session {
            Some(session) => {
                Self::drain_session(session, &self.stimuli, &mut self.scratch, &self.ui)
            }
            None => {
                // outside a session everything is drained and dropped
                for (trace, next) in &mut self.idle_traces {
                    *next = trace.produced();
                }
                while self.stimuli.pop().is_some() {}
                Ok(())
            }
        }
    }

    fn drain_session(
        session: &mut OpenSession,
        stimuli: &ArrayQueue<StimulusDescriptor>,
        scratch: &mut Vec<f64>,
        ui: &UiChannel,
    ) -> Result<()> {
        for tf in &mut session.traces {
            let produced = tf.trace.produced();
            let min = tf.trace.min_index();
            if tf.next < min {
                // the writer lapped persistence: sample loss is loud
                tf.trace.set_error(Error::BufferOverflow {
                    trace: tf.trace.name().to_string(),
                });
                ui.warning(format!(
                    "persistence lost {} samples on {}",
                    min - tf.next,
                    tf.trace.name()
                ));
                tf.next = min;
            }
            while tf.next < produced {
                scratch.clear();
                let n = tf
                    .trace
                    .read_into(tf.next, produced - tf.next, scratch)?;
                if n == 0 {
                    break;
                }
                let delta = tf.trace.sample_interval();
                for (k, &v) in scratch.iter().enumerate() {
                    let t = (tf.next + k) as f64 * delta - session.t0;
                    let row = tf.key.render_data(&[Some(t), Some(v)]);
                    writeln!(tf.writer, "{row}")?;
                }
                tf.next += n;
            }
        }

        for ef in &mut session.events {
            let mut events = Vec::new();
            let min = ef.stream.min_index();
            if ef.next < min {
                ef.next = min;
            }
            ef.stream.read_into(ef.next, &mut events)?;
            for e in &events {
                let row = ef
                    .key
                    .render_data(&[Some(e.time - session.t0), Some(e.size), Some(e.width)]);
                writeln!(ef.writer, "{row}")?;
            }
            ef.next += events.len();
        }

        while let Some(desc) = stimuli.pop() {
            if desc.save {
                session.index.write(&desc, session.t0)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) {
        if let Some(session) = &mut self.session {
            for t in &mut session.traces {
                let _ = t.writer.flush();
            }
            for e in &mut session.events {
                let _ = e.writer.flush();
            }
            let _ = session.index.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Event;
    use crossbeam::channel::bounded;

    fn trace() -> Arc<InputTrace> {
        Arc::new(InputTrace::new("V-1", "mV", 1e-3, 0, 1 << 16))
    }

    #[test]
    fn session_files_written_and_kept_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let session_path = dir.path().join("2026-08-01-a");
        let (tx, rx) = bounded(8);
        let stimuli = Arc::new(ArrayQueue::new(16));
        let handle = StorageThread::spawn(rx, stimuli.clone(), UiChannel::new());

        let t = trace();
        let e = Arc::new(EventStream::new("Spikes-1", 1024));
        t.buffer().push_slice(&[1.0, 2.0, 3.0]);
        let mut metadata = Options::new("session");
        metadata.add_text("experiment", "Experiment", "loopback test");
        tx.send(StorageCommand::StartSession {
            path: session_path.clone(),
            metadata,
            traces: vec![t.clone()],
            events: vec![e.clone()],
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(60));
        t.buffer().push_slice(&[4.0, 5.0]);
        e.push(Event::at(0.004)).unwrap();
        std::thread::sleep(Duration::from_millis(60));

        let (done_tx, done_rx) = bounded(1);
        tx.send(StorageCommand::StopSession {
            save: true,
            done: done_tx,
        })
        .unwrap();
        done_rx.recv().unwrap();
        tx.send(StorageCommand::Shutdown).unwrap();
        handle.join().unwrap();

        let trace_text =
            std::fs::read_to_string(session_path.join("trace-V-1.dat")).unwrap();
        assert!(trace_text.contains("# Key"));
        // samples from before the session start are not persisted
        let data_lines = trace_text.lines().filter(|l| !l.starts_with('#')).count();
        assert_eq!(data_lines, 2);
        let events_text =
            std::fs::read_to_string(session_path.join("events-Spikes-1.dat")).unwrap();
        assert!(events_text.lines().filter(|l| !l.starts_with('#')).count() == 1);
        assert!(session_path.join("stimuli.dat").exists());
        assert!(session_path.join("metadata.cfg").exists());
    }

    #[test]
    fn discarded_session_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let session_path = dir.path().join("2026-08-01-a");
        let (tx, rx) = bounded(8);
        let stimuli = Arc::new(ArrayQueue::new(16));
        let handle = StorageThread::spawn(rx, stimuli.clone(), UiChannel::new());

        let t = trace();
        tx.send(StorageCommand::StartSession {
            path: session_path.clone(),
            metadata: Options::new("session"),
            traces: vec![t.clone()],
            events: vec![],
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(40));
        t.buffer().push_slice(&[1.0; 100]);
        stimuli
            .push(StimulusDescriptor {
                out_trace: "Out-1".to_string(),
                ident: "pulse".to_string(),
                repro: "SinePulse".to_string(),
                time: 0.05,
                trace_indices: vec![("V-1".to_string(), 50)],
                event_indices: vec![],
                duration: 0.01,
                sample_interval: 1e-3,
                intensity: None,
                delay: 0.0,
                description: Options::new("stimulus"),
                save: true,
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(session_path.exists());

        let (done_tx, done_rx) = bounded(1);
        tx.send(StorageCommand::StopSession {
            save: false,
            done: done_tx,
        })
        .unwrap();
        // the acknowledgement arrives only after the delete completed
        done_rx.recv().unwrap();
        assert!(!session_path.exists(), "discard removes the whole directory");

        tx.send(StorageCommand::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn no_save_descriptors_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let session_path = dir.path().join("s");
        let (tx, rx) = bounded(8);
        let stimuli = Arc::new(ArrayQueue::new(16));
        let handle = StorageThread::spawn(rx, stimuli.clone(), UiChannel::new());
        let t = trace();
        tx.send(StorageCommand::StartSession {
            path: session_path.clone(),
            metadata: Options::new("session"),
            traces: vec![t.clone()],
            events: vec![],
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(40));
        stimuli
            .push(StimulusDescriptor {
                out_trace: "Out-1".to_string(),
                ident: "pulse".to_string(),
                repro: "SinePulse".to_string(),
                time: 0.05,
                trace_indices: vec![],
                event_indices: vec![],
                duration: 0.01,
                sample_interval: 1e-3,
                intensity: None,
                delay: 0.0,
                description: Options::new("stimulus"),
                save: false,
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        let (done_tx, done_rx) = bounded(1);
        tx.send(StorageCommand::StopSession {
            save: true,
            done: done_tx,
        })
        .unwrap();
        done_rx.recv().unwrap();
        tx.send(StorageCommand::Shutdown).unwrap();
        handle.join().unwrap();
        let text = std::fs::read_to_string(session_path.join("stimuli.dat")).unwrap();
        assert_eq!(text.lines().count(), 1, "only the header remains");
    }
}
