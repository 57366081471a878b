//! The acquisition engine: drives the input and output devices from a
//! single real-time service thread, fills the input traces, applies
//! attenuation, and timestamps every stimulus with its
//! acquisition-exact onset index.
//!
//! The service thread is paced by a `SpinSleeper` at a fixed period and
//! runs at elevated priority. Every other thread talks to the engine
//! through `&self` methods; writes are validated and enqueued entirely
//! before any sample reaches the device, so a failing signal emits
//! nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, bounded};
use crossbeam_queue::ArrayQueue;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use spin_sleep::{SpinSleeper, SpinStrategy};

use crate::daq::attenuate::Attenuate;
use crate::daq::device::{AnalogInput, AnalogOutput, RawSignal};
use crate::daq::outdata::{OutData, OutList, StimulusDescriptor};
use crate::error::{Error, Result};
use crate::store::{EventStream, InputTrace};
use crate::ui::UiChannel;

/// Declares one input trace backed by a device channel.
pub struct TraceSpec {
    pub name: String,
    pub unit: String,
    pub channel: usize,
    /// Buffer capacity in seconds of data.
    pub capacity_secs: f64,
}

/// Declares one output port, optionally behind an attenuator.
pub struct OutPortSpec {
    pub name: String,
    pub channel: usize,
    pub attenuator: Option<Box<dyn Attenuate>>,
}

struct OutPort {
    name: String,
    channel: usize,
    attenuator: Option<Box<dyn Attenuate>>,
}

/// A written group waiting for its hardware start confirmation.
struct PendingGroup {
    token: u64,
    descriptors: Vec<StimulusDescriptor>,
    set_signal_time: bool,
}

/// High-water mark of the stimulus descriptor queue.
const STIMULUS_QUEUE_CAPACITY: usize = 256;

/// Hardware-specific safety envelope, checked from the service thread.
/// Implementations watch the traces (amplifier saturation, actuator
/// limits) and veto further output by returning an error.
pub trait SafetyMonitor: Send {
    fn name(&self) -> &str;
    fn check(&mut self, traces: &[Arc<InputTrace>]) -> Result<()>;
}

pub struct DaqEngine {
    input: Mutex<Option<Box<dyn AnalogInput>>>,
    output: Mutex<Option<Box<dyn AnalogOutput>>>,
    input_rate: RwLock<f64>,
    traces: RwLock<Vec<Arc<InputTrace>>>,
    events: RwLock<Vec<Arc<EventStream>>>,
    ports: Mutex<Vec<OutPort>>,
    pending: Mutex<Vec<PendingGroup>>,
    stimuli: Arc<ArrayQueue<StimulusDescriptor>>,
    dropped_stimuli: AtomicU64,
    /// Cleared by `no_saving`; stamped into each descriptor.
    saving: AtomicBool,
    /// Master switch, cleared by the `--no-save` command line flag.
    save_master: AtomicBool,
    running: Arc<AtomicBool>,
    overruns: AtomicU64,
    advance_subscribers: Mutex<Vec<Sender<()>>>,
    monitors: Mutex<Vec<Box<dyn SafetyMonitor>>>,
    ui: UiChannel,
    current_repro: Mutex<String>,
}

impl DaqEngine {
    pub fn new(ui: UiChannel) -> Arc<DaqEngine> {
        Arc::new(DaqEngine {
            input: Mutex::new(None),
            output: Mutex::new(None),
            input_rate: RwLock::new(0.0),
            traces: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            ports: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            stimuli: Arc::new(ArrayQueue::new(STIMULUS_QUEUE_CAPACITY)),
            dropped_stimuli: AtomicU64::new(0),
            saving: AtomicBool::new(true),
            save_master: AtomicBool::new(true),
            running: Arc::new(AtomicBool::new(false)),
            overruns: AtomicU64::new(0),
            advance_subscribers: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            ui,
            current_repro: Mutex::new(String::new()),
        })
    }

    // --- setup ---

    /// Opens the input device and creates one trace per spec.
    pub fn open_input(
        &self,
        mut device: Box<dyn AnalogInput>,
        rate: f64,
        specs: &[TraceSpec],
    ) -> Result<()> {
        let channels: Vec<usize> = specs.iter().map(|s| s.channel).collect();
        device.open(&channels, rate)?;
        let delta = 1.0 / rate;
        let traces: Vec<Arc<InputTrace>> = specs
            .iter()
            .map(|s| {
                let capacity = ((s.capacity_secs / delta) as usize).max(1);
                Arc::new(InputTrace::new(&s.name, &s.unit, delta, s.channel, capacity))
            })
            .collect();
        info!(
            "input device {} open: {} traces at {} Hz",
            device.id(),
            traces.len(),
            rate
        );
        *self.input_rate.write() = rate;
        *self.traces.write() = traces;
        *self.input.lock() = Some(device);
        Ok(())
    }

    /// Opens the output device and registers its ports.
    pub fn open_output(&self, mut device: Box<dyn AnalogOutput>, specs: Vec<OutPortSpec>) -> Result<()> {
        let channels: Vec<usize> = specs.iter().map(|s| s.channel).collect();
        device.open(&channels)?;
        info!("output device {} open: {} ports", device.id(), specs.len());
        *self.ports.lock() = specs
            .into_iter()
            .map(|s| OutPort {
                name: s.name,
                channel: s.channel,
                attenuator: s.attenuator,
            })
            .collect();
        *self.output.lock() = Some(device);
        Ok(())
    }

    pub fn start_input(&self) -> Result<()> {
        match self.input.lock().as_mut() {
            Some(device) => device.start(),
            None => Err(Error::NotOpen("analog input".to_string())),
        }
    }

    /// Registers the event streams whose indices go into stimulus
    /// descriptors. Called once the detector graph is built.
    pub fn set_event_streams(&self, events: Vec<Arc<EventStream>>) {
        *self.events.write() = events;
    }

    pub fn traces(&self) -> Vec<Arc<InputTrace>> {
        self.traces.read().clone()
    }

    pub fn trace(&self, name: &str) -> Option<Arc<InputTrace>> {
        self.traces.read().iter().find(|t| t.name() == name).cloned()
    }

    pub fn stimulus_queue(&self) -> Arc<ArrayQueue<StimulusDescriptor>> {
        self.stimuli.clone()
    }

    /// Wakes the returned receiver whenever new input samples arrived.
    pub fn subscribe_advance(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        self.advance_subscribers.lock().push(tx);
        rx
    }

    /// Disables the save flag on subsequent stimulus descriptors until
    /// the next `set_saving(true)` (one procedure run).
    pub fn set_saving(&self, on: bool) {
        self.saving.store(on, Ordering::Release);
    }

    pub fn saving(&self) -> bool {
        self.saving.load(Ordering::Acquire) && self.save_master.load(Ordering::Acquire)
    }

    /// Disables saving globally, regardless of per-run flags.
    pub fn set_save_master(&self, on: bool) {
        self.save_master.store(on, Ordering::Release);
    }

    pub fn set_current_repro(&self, name: &str) {
        *self.current_repro.lock() = name.to_string();
    }

    /// Acquisition time of the input clock, in seconds.
    pub fn current_time(&self) -> f64 {
        let traces = self.traces.read();
        traces
            .first()
            .map(|t| t.current_time())
            .unwrap_or(0.0)
    }

    // --- output path ---

    /// Writes one output signal; returns the realized intensity when an
    /// attenuator is involved.
    pub fn write(&self, out: OutData) -> Result<Option<f64>> {
        let mut realized = self.write_multi(vec![out])?;
        Ok(realized.pop().flatten())
    }

    /// Writes several signals started on the same hardware tick.
    /// Everything is validated before anything is emitted.
    pub fn write_multi(&self, list: OutList) -> Result<Vec<Option<f64>>> {
        if list.is_empty() {
            return Ok(Vec::new());
        }
        let mut output = self.output.lock();
        let device = output
            .as_mut()
            .ok_or_else(|| Error::NotOpen("analog output".to_string()))?;

        let ports = self.ports.lock();
        let mut raws = Vec::with_capacity(list.len());
        let mut intensities = Vec::with_capacity(list.len());
        let mut descriptors = Vec::with_capacity(list.len());
        let mut set_signal_time = false;

        for out in &list {
            if out.samples.is_empty() || out.duration() <= 0.0 {
                return Err(Error::WriteError {
                    trace: out.trace.clone(),
                    message: "signal has zero duration".to_string(),
                });
            }
            let rate = 1.0 / out.sample_interval;
            if rate > device.max_rate() {
                return Err(Error::InvalidSampleRate {
                    requested: rate,
                    max: device.max_rate(),
                });
            }
            let port = ports
                .iter()
                .find(|p| p.name == out.trace)
                .ok_or_else(|| Error::InvalidReference(out.trace.clone()))?;
            let converter = device
                .converter(port.channel)
                .ok_or_else(|| Error::InvalidChannel {
                    device: device.id().to_string(),
                    channel: port.channel,
                })?
                .clone();

            // attenuation first: a failing intensity emits nothing
            let realized = match (&port.attenuator, out.intensity) {
                (Some(att), Some(intensity)) => Some(att.write(intensity, out.carrier_freq)?),
                (None, Some(_)) => {
                    return Err(Error::IntensityError(format!(
                        "output {} has no attenuator",
                        out.trace
                    )));
                }
                _ => None,
            };

            // quantize; clipping is loud, not silent
            let mut raw = Vec::with_capacity(out.samples.len());
            for &v in &out.samples {
                let (r, clipped) = converter.to_raw(v);
                if clipped {
                    return if v > 0.0 {
                        Err(Error::Overflow {
                            achievable: converter.max_value(),
                        })
                    } else {
                        Err(Error::Underflow {
                            achievable: converter.min_value(),
                        })
                    };
                }
                raw.push(r);
            }

            set_signal_time |= out.set_signal_time;
            raws.push(RawSignal {
                channel: port.channel,
                raw,
                sample_interval: out.sample_interval,
                delay: out.delay,
                trigger: out.trigger,
            });
            intensities.push(realized);
            descriptors.push(StimulusDescriptor {
                out_trace: out.trace.clone(),
                ident: out.ident.clone(),
                repro: self.current_repro.lock().clone(),
                time: 0.0,
                trace_indices: Vec::new(),
                event_indices: Vec::new(),
                duration: out.duration(),
                sample_interval: out.sample_interval,
                intensity: realized,
                delay: out.delay,
                description: out.description.clone(),
                save: self.saving(),
            });
        }
        drop(ports);

        let token = device.write(raws)?;
        self.pending.lock().push(PendingGroup {
            token,
            descriptors,
            set_signal_time,
        });
        debug!("queued output group {token} ({} signals)", list.len());
        Ok(intensities)
    }

    /// Immediately emits a single zero sample on the port, cancelling
    /// any in-flight output on its channel.
    pub fn write_zero(&self, trace: &str) -> Result<()> {
        let channel = {
            let ports = self.ports.lock();
            ports
                .iter()
                .find(|p| p.name == trace)
                .map(|p| p.channel)
                .ok_or_else(|| Error::InvalidReference(trace.to_string()))?
        };
        {
            let mut output = self.output.lock();
            let device = output
                .as_mut()
                .ok_or_else(|| Error::NotOpen("analog output".to_string()))?;
            device.cancel(channel)?;
        }
        // drop pending descriptors for that channel's port
        self.pending.lock().retain(|g| {
            !g.descriptors.iter().any(|d| d.out_trace == trace)
        });
        let rate = *self.input_rate.read();
        let interval = if rate > 0.0 { 1.0 / rate } else { 1e-3 };
        self.write(OutData::zero(trace, interval))?;
        Ok(())
    }

    pub fn stop_output(&self) -> Result<()> {
        if let Some(device) = self.output.lock().as_mut() {
            device.stop()?;
        }
        self.pending.lock().clear();
        Ok(())
    }

    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(device) = self.input.lock().as_mut() {
            device.close();
        }
        if let Some(device) = self.output.lock().as_mut() {
            device.close();
        }
    }

    // --- real-time service ---

    /// One cooperative service step: confirm started stimuli, then pull
    /// new input samples into the traces. Start confirmations run first
    /// so every `signal_time` is set before samples at or beyond the
    /// onset become visible.
    pub fn service_step(&self) -> usize {
        self.confirm_started();
        let appended = self.read_input();
        if appended > 0 {
            let subscribers = self.advance_subscribers.lock();
            for tx in subscribers.iter() {
                let _ = tx.try_send(());
            }
        }
        self.run_monitors();
        appended
    }

    /// Registers a safety monitor to run every service step.
    pub fn add_monitor(&self, monitor: Box<dyn SafetyMonitor>) {
        self.monitors.lock().push(monitor);
    }

    fn run_monitors(&self) {
        let traces = self.traces.read();
        let mut monitors = self.monitors.lock();
        for m in monitors.iter_mut() {
            if let Err(e) = m.check(&traces) {
                warn!("safety monitor {} tripped: {e}", m.name());
                self.ui.warning(format!("safety monitor {}: {e}", m.name()));
                if let Err(stop) = self.stop_output() {
                    error!("could not stop outputs after safety trip: {stop}");
                }
            }
        }
    }

    fn confirm_started(&self) {
        let started = {
            let mut output = self.output.lock();
            match output.as_mut() {
                Some(device) => device.started(),
                None => return,
            }
        };
        if started.is_empty() {
            return;
        }
        let traces = self.traces.read();
        let events = self.events.read();
        let rate = *self.input_rate.read();
        let mut pending = self.pending.lock();
        for group in started {
            let Some(pos) = pending.iter().position(|g| g.token == group.token) else {
                continue;
            };
            let mut g = pending.swap_remove(pos);
            let time = if rate > 0.0 {
                group.onset_index as f64 / rate
            } else {
                0.0
            };
            if g.set_signal_time {
                for t in traces.iter() {
                    t.set_signal_index(t.index(time));
                }
                for e in events.iter() {
                    e.set_signal_time(time);
                }
            }
            for mut d in g.descriptors.drain(..) {
                d.time = time;
                d.trace_indices = traces
                    .iter()
                    .map(|t| (t.name().to_string(), t.index(time)))
                    .collect();
                d.event_indices = events
                    .iter()
                    .map(|e| (e.name().to_string(), e.produced()))
                    .collect();
                if self.stimuli.push(d).is_err() {
                    // newest descriptor is dropped; sample data is not
                    self.dropped_stimuli.fetch_add(1, Ordering::Relaxed);
                    let repro = self.current_repro.lock().clone();
                    self.ui.post(crate::ui::UiEvent::IncompleteSave {
                        repro: repro.clone(),
                    });
                    self.ui
                        .warning(format!("stimulus queue full, run {repro} saved incomplete"));
                }
            }
        }
    }

    fn read_input(&self) -> usize {
        let traces = self.traces.read();
        if traces.is_empty() {
            return 0;
        }
        let mut chunks: Vec<Vec<f64>> = traces.iter().map(|_| Vec::new()).collect();
        let result = {
            let mut input = self.input.lock();
            match input.as_mut() {
                Some(device) => device.read(&mut chunks),
                None => return 0,
            }
        };
        match result {
            Ok(n) => {
                for (t, chunk) in traces.iter().zip(chunks.iter()) {
                    t.buffer().push_slice(chunk);
                }
                n
            }
            Err(e) => {
                // mark every trace, then try to resynchronize channels
                warn!("input read failed: {e}");
                for t in traces.iter() {
                    t.set_error(Error::ReadError {
                        trace: t.name().to_string(),
                        message: e.to_string(),
                    });
                }
                let mut input = self.input.lock();
                if let Some(device) = input.as_mut() {
                    for t in traces.iter() {
                        if let Err(re) = device.reset_channel(t.channel()) {
                            error!("channel {} resync failed: {re}", t.channel());
                        }
                    }
                }
                0
            }
        }
    }

    /// Spawns the real-time service thread. `period` is the service
    /// interval; `core` optionally pins the thread.
    pub fn start(self: &Arc<Self>, period: Duration, core: Option<usize>) -> JoinHandle<()> {
        self.running.store(true, Ordering::Release);
        let engine = self.clone();
        thread::Builder::new()
            .name("daq".to_string())
            .spawn(move || {
                if let Some(core) = core {
                    let ids = core_affinity::get_core_ids().unwrap_or_default();
                    match ids.get(core) {
                        Some(id) if core_affinity::set_for_current(*id) => {
                            info!("daq thread pinned to core {core}");
                        }
                        _ => warn!("could not pin daq thread to core {core}"),
                    }
                }
                if thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
                    .is_err()
                {
                    warn!("could not raise daq thread priority");
                }

                let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
                let mut next = Instant::now() + period;
                while engine.running.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now < next {
                        sleeper.sleep(next - now);
                    } else {
                        engine.overruns.fetch_add(1, Ordering::Relaxed);
                    }
                    engine.service_step();
                    next += period;
                }
                debug!("daq service thread stopped");
            })
            .expect("spawning the daq thread")
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn dropped_stimuli(&self) -> u64 {
        self.dropped_stimuli.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::attenuate::LinearAttenuate;
    use crate::daq::device::sim_devices;

    fn engine_with_sim(
        rate: f64,
        attenuator: Option<Box<dyn Attenuate>>,
    ) -> (Arc<DaqEngine>, crate::daq::device::SimHandle) {
        let (ai, ao, sim) = sim_devices(rate, 1, 0.0, true);
        let engine = DaqEngine::new(UiChannel::new());
        engine
            .open_input(
                Box::new(ai),
                rate,
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
                    attenuator,
                }],
            )
            .unwrap();
        engine.start_input().unwrap();
        (engine, sim)
    }

    #[test]
    fn delayed_output_sets_signal_time_to_first_sample() {
        let rate = 20_000.0;
        let (engine, sim) = engine_with_sim(rate, None);

        // 100 ms, 1 kHz sine with 50 ms delay on channel 0
        let out = OutData::sine("Out-1", 1.0 / rate, 1000.0, 0.1, 1.0).with_delay(0.05);
        engine.write(out).unwrap();

        // not yet started: delay is 1000 samples
        sim.advance(500);
        engine.service_step();
        let trace = engine.trace("V-1").unwrap();
        assert_eq!(trace.signal_index(), None);

        sim.advance(3000);
        engine.service_step();
        let onset = trace.signal_index().expect("signal time set");
        assert_eq!(onset, 1000);
        // the sample at the onset is the first sine sample, exactly 0
        assert_eq!(trace.get(onset).unwrap(), 0.0);

        let desc = engine.stimulus_queue().pop().expect("descriptor enqueued");
        assert_eq!(desc.trace_indices, vec![("V-1".to_string(), 1000)]);
        assert!((desc.time - 0.05).abs() < 1e-9);
        assert!(desc.trace_indices[0].1 <= trace.produced());
    }

    #[test]
    fn intensity_clipping_is_loud_and_emits_nothing() {
        let rate = 20_000.0;
        let (engine, sim) = engine_with_sim(
            rate,
            Some(Box::new(LinearAttenuate::new(-25.0, 80.0, 0.0)) as Box<dyn Attenuate>),
        );

        let out = OutData::sine("Out-1", 1.0 / rate, 1000.0, 0.1, 1.0).with_intensity(200.0);
        match engine.write(out) {
            Err(Error::Overflow { achievable }) => assert_eq!(achievable, 80.0),
            other => panic!("expected Overflow, got {other:?}"),
        }

        sim.advance(4000);
        engine.service_step();
        assert!(engine.stimulus_queue().pop().is_none());
        let trace = engine.trace("V-1").unwrap();
        assert_eq!(trace.signal_index(), None);
    }

    #[test]
    fn sample_clipping_reports_achievable_range() {
        let rate = 1000.0;
        let (engine, _sim) = engine_with_sim(rate, None);
        let out = OutData::pulse("Out-1", 1.0 / rate, 0.01, 1000.0);
        match engine.write(out) {
            Err(Error::Overflow { achievable }) => assert!(achievable < 1000.0),
            other => panic!("expected Overflow, got {other:?}"),
        }
    }

    #[test]
    fn unknown_port_is_invalid_reference() {
        let (engine, _sim) = engine_with_sim(1000.0, None);
        let out = OutData::pulse("NoSuch", 1e-3, 0.01, 1.0);
        assert!(matches!(
            engine.write(out),
            Err(Error::InvalidReference(name)) if name == "NoSuch"
        ));
    }

    #[test]
    fn descriptor_start_indices_bounded_by_produced() {
        let rate = 1000.0;
        let (engine, sim) = engine_with_sim(rate, None);
        engine
            .write(OutData::pulse("Out-1", 1.0 / rate, 0.02, 1.0))
            .unwrap();
        sim.advance(100);
        engine.service_step();
        let trace = engine.trace("V-1").unwrap();
        let desc = engine.stimulus_queue().pop().unwrap();
        for (_, idx) in &desc.trace_indices {
            assert!(*idx <= trace.produced());
        }
    }

    #[test]
    fn write_zero_cancels_inflight_output() {
        let rate = 1000.0;
        let (engine, sim) = engine_with_sim(rate, None);
        engine
            .write(OutData::pulse("Out-1", 1.0 / rate, 1.0, 2.0))
            .unwrap();
        sim.advance(10);
        engine.service_step();
        engine.write_zero("Out-1").unwrap();
        sim.advance(10);
        engine.service_step();
        let trace = engine.trace("V-1").unwrap();
        // after cancellation the loopback returns to the model, not 2.0
        let produced = trace.produced();
        let last = trace.get(produced - 1).unwrap();
        assert!(last.abs() < 1.0);
    }
}
