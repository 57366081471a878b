//! Analog device contracts and the loopback simulation backend.
//!
//! Board-specific drivers live outside this crate; the engine talks to
//! devices through the two traits below. The simulation backend
//! implements both ends against a shared virtual clock: whatever is
//! written to an output channel reappears sample-exact on the matching
//! input channel, and otherwise a membrane-like model signal is
//! generated, so the whole stack runs headless.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::daq::outdata::StartTrigger;
use crate::error::{Error, Result};

/// Per-channel polynomial converter from physical values to device raw
/// units: `raw = Σ coefs[k]·(v − origin)^k`, clipped to
/// `[min_data, max_data]`.
#[derive(Debug, Clone)]
pub struct Converter {
    pub coefs: Vec<f64>,
    pub origin: f64,
    pub min_data: i32,
    pub max_data: i32,
}

impl Converter {
    /// A linear converter with `gain` raw units per physical unit.
    pub fn linear(gain: f64, min_data: i32, max_data: i32) -> Converter {
        Converter {
            coefs: vec![0.0, gain],
            origin: 0.0,
            min_data,
            max_data,
        }
    }

    fn raw_value(&self, v: f64) -> f64 {
        let x = v - self.origin;
        let mut acc = 0.0;
        for &c in self.coefs.iter().rev() {
            acc = acc * x + c;
        }
        acc
    }

    /// Quantizes; the flag reports whether clipping occurred.
    pub fn to_raw(&self, v: f64) -> (i32, bool) {
        let raw = self.raw_value(v).round();
        if raw > self.max_data as f64 {
            (self.max_data, true)
        } else if raw < self.min_data as f64 {
            (self.min_data, true)
        } else {
            (raw as i32, false)
        }
    }

    /// Inverse through the linear term; adequate for reporting and for
    /// the simulation loopback.
    pub fn to_value(&self, raw: i32) -> f64 {
        let c0 = self.coefs.first().copied().unwrap_or(0.0);
        let c1 = self.coefs.get(1).copied().unwrap_or(1.0);
        self.origin + (raw as f64 - c0) / c1
    }

    /// Largest representable physical value.
    pub fn max_value(&self) -> f64 {
        self.to_value(self.max_data)
    }

    /// Smallest representable physical value.
    pub fn min_value(&self) -> f64 {
        self.to_value(self.min_data)
    }
}

pub trait AnalogInput: Send {
    fn id(&self) -> &str;
    fn open(&mut self, channels: &[usize], rate: f64) -> Result<()>;
    fn is_open(&self) -> bool;
    fn max_rate(&self) -> f64;
    fn start(&mut self) -> Result<()>;
    /// Appends every sample acquired since the last call to the
    /// per-channel vectors (one per opened channel, in open order).
    /// Returns the number of new samples per channel.
    fn read(&mut self, out: &mut [Vec<f64>]) -> Result<usize>;
    /// Drops queued data on one channel after a fault and rearms it.
    fn reset_channel(&mut self, channel: usize) -> Result<()>;
    fn close(&mut self);
}

/// Prepared raw samples for one output channel.
pub struct RawSignal {
    pub channel: usize,
    pub raw: Vec<i32>,
    pub sample_interval: f64,
    pub delay: f64,
    pub trigger: StartTrigger,
}

/// Confirmation that a written group started playing; `onset_index` is
/// the acquisition-side sample index of its first sample.
#[derive(Debug, Clone, Copy)]
pub struct StartedGroup {
    pub token: u64,
    pub onset_index: usize,
}

pub trait AnalogOutput: Send {
    fn id(&self) -> &str;
    fn open(&mut self, channels: &[usize]) -> Result<()>;
    fn is_open(&self) -> bool;
    fn max_rate(&self) -> f64;
    fn converter(&self, channel: usize) -> Option<&Converter>;
    /// Enqueues a group of prepared signals that start on the same
    /// hardware tick. Writes on one channel are FIFO. Returns a token
    /// that `started` reports once the first sample has played.
    fn write(&mut self, signals: Vec<RawSignal>) -> Result<u64>;
    /// Groups whose first sample the hardware confirmed since the last
    /// poll.
    fn started(&mut self) -> Vec<StartedGroup>;
    /// Cancels pending and playing signals on a channel.
    fn cancel(&mut self, channel: usize) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn close(&mut self);
}

// --- simulation ---

enum SimClock {
    RealTime(Instant),
    Manual(usize),
}

struct SimSignal {
    token: u64,
    channel: usize,
    samples: Vec<f64>,
    onset: usize,
    confirmed: bool,
}

struct SimState {
    rate: f64,
    channels: Vec<usize>,
    clock: SimClock,
    generated: usize,
    signals: Vec<SimSignal>,
    armed: Vec<SimSignal>,
    next_token: u64,
    noise: f64,
}

impl SimState {
    fn target(&self) -> usize {
        match &self.clock {
            SimClock::RealTime(start) => (start.elapsed().as_secs_f64() * self.rate) as usize,
            SimClock::Manual(n) => *n,
        }
    }

    fn sample(&self, channel: usize, index: usize, rng: &mut impl Rng) -> f64 {
        for s in &self.signals {
            if s.channel == channel && index >= s.onset && index < s.onset + s.samples.len() {
                return s.samples[index - s.onset];
            }
        }
        // resting model: small noise around a slow oscillation
        let t = index as f64 / self.rate;
        let base = 0.02 * (2.0 * std::f64::consts::PI * 2.0 * t).sin();
        if self.noise > 0.0 {
            base + rng.random_range(-self.noise..self.noise)
        } else {
            base
        }
    }
}

/// Shared control handle over the simulated hardware clock.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Advances the manual clock by `n` input samples.
    pub fn advance(&self, n: usize) {
        let mut st = self.state.lock();
        if let SimClock::Manual(c) = &mut st.clock {
            *c += n;
        }
    }

    /// Releases every armed hardware-trigger group at the current clock.
    pub fn fire_trigger(&self) {
        let mut st = self.state.lock();
        let generated = st.generated;
        let armed: Vec<SimSignal> = st.armed.drain(..).collect();
        for mut s in armed {
            s.onset += generated;
            st.signals.push(s);
        }
    }
}

pub struct SimAnalogInput {
    id: String,
    state: Arc<Mutex<SimState>>,
    open: bool,
    rng: StdRng,
}

pub struct SimAnalogOutput {
    id: String,
    state: Arc<Mutex<SimState>>,
    open: bool,
    converters: Vec<Converter>,
}

/// Builds a coupled input/output pair over one virtual clock.
/// `manual_clock` freezes time for deterministic tests; otherwise the
/// clock free-runs against the wall clock.
pub fn sim_devices(
    rate: f64,
    channels: usize,
    noise: f64,
    manual_clock: bool,
) -> (SimAnalogInput, SimAnalogOutput, SimHandle) {
    let state = Arc::new(Mutex::new(SimState {
        rate,
        channels: (0..channels).collect(),
        clock: if manual_clock {
            SimClock::Manual(0)
        } else {
            SimClock::RealTime(Instant::now())
        },
        generated: 0,
        signals: Vec::new(),
        armed: Vec::new(),
        next_token: 1,
        noise,
    }));
    let input = SimAnalogInput {
        id: "sim-ai".to_string(),
        state: state.clone(),
        open: false,
        rng: StdRng::from_os_rng(),
    };
    let output = SimAnalogOutput {
        id: "sim-ao".to_string(),
        state: state.clone(),
        open: false,
        converters: (0..channels)
            .map(|_| Converter::linear(3276.8, -32768, 32767))
            .collect(),
    };
    (input, output, SimHandle { state })
}

impl AnalogInput for SimAnalogInput {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(&mut self, channels: &[usize], rate: f64) -> Result<()> {
        let st = self.state.lock();
        if rate > st.rate * 2.0 {
            return Err(Error::InvalidSampleRate {
                requested: rate,
                max: st.rate * 2.0,
            });
        }
        for &c in channels {
            if !st.channels.contains(&c) {
                return Err(Error::InvalidChannel {
                    device: self.id.clone(),
                    channel: c,
                });
            }
        }
        drop(st);
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn max_rate(&self) -> f64 {
        self.state.lock().rate * 2.0
    }

    fn start(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen(self.id.clone()));
        }
        Ok(())
    }

    fn read(&mut self, out: &mut [Vec<f64>]) -> Result<usize> {
        if !self.open {
            return Err(Error::NotOpen(self.id.clone()));
        }
        let mut st = self.state.lock();
        let target = st.target();
        let from = st.generated;
        let n = target.saturating_sub(from);
        let channels = st.channels.clone();
        for i in from..target {
            for (slot, &ch) in channels.iter().enumerate() {
                if slot < out.len() {
                    let v = st.sample(ch, i, &mut self.rng);
                    out[slot].push(v);
                }
            }
        }
        st.generated = target;
        // played-out signals are dropped once fully behind the clock
        let generated = st.generated;
        st.signals
            .retain(|s| !s.confirmed || s.onset + s.samples.len() > generated);
        Ok(n)
    }

    fn reset_channel(&mut self, _channel: usize) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

impl AnalogOutput for SimAnalogOutput {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(&mut self, channels: &[usize]) -> Result<()> {
        let st = self.state.lock();
        for &c in channels {
            if !st.channels.contains(&c) {
                return Err(Error::InvalidChannel {
                    device: self.id.clone(),
                    channel: c,
                });
            }
        }
        drop(st);
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn max_rate(&self) -> f64 {
        self.state.lock().rate * 2.0
    }

    fn converter(&self, channel: usize) -> Option<&Converter> {
        self.converters.get(channel)
    }

    fn write(&mut self, signals: Vec<RawSignal>) -> Result<u64> {
        if !self.open {
            return Err(Error::NotOpen(self.id.clone()));
        }
        let mut st = self.state.lock();
        let token = st.next_token;
        st.next_token += 1;
        // all signals of the group share the start tick; the largest
        // per-signal delay wins
        let rate = st.rate;
        let base = st.generated;
        for sig in signals {
            let conv = self
                .converters
                .get(sig.channel)
                .cloned()
                .unwrap_or_else(|| Converter::linear(1.0, i32::MIN, i32::MAX));
            let samples: Vec<f64> = sig.raw.iter().map(|&r| conv.to_value(r)).collect();
            let delay_samples = (sig.delay * rate).round() as usize;
            let sim = SimSignal {
                token,
                channel: sig.channel,
                samples,
                onset: base + delay_samples,
                confirmed: false,
            };
            match sig.trigger {
                StartTrigger::Now => st.signals.push(sim),
                StartTrigger::HardwareTrigger => {
                    let mut armed = sim;
                    armed.onset = delay_samples;
                    st.armed.push(armed);
                }
            }
        }
        Ok(token)
    }

    fn started(&mut self) -> Vec<StartedGroup> {
        let mut st = self.state.lock();
        let generated = st.target().max(st.generated);
        let mut confirmed = Vec::new();
        for s in &mut st.signals {
            if !s.confirmed && generated >= s.onset {
                s.confirmed = true;
                confirmed.push(StartedGroup {
                    token: s.token,
                    onset_index: s.onset,
                });
            }
        }
        // one confirmation per group
        confirmed.sort_by_key(|g| g.token);
        confirmed.dedup_by_key(|g| g.token);
        confirmed
    }

    fn cancel(&mut self, channel: usize) -> Result<()> {
        let mut st = self.state.lock();
        st.signals.retain(|s| s.channel != channel);
        st.armed.retain(|s| s.channel != channel);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut st = self.state.lock();
        st.signals.clear();
        st.armed.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converter_clips_and_reports() {
        let c = Converter::linear(3276.8, -32768, 32767);
        let (raw, clipped) = c.to_raw(5.0);
        assert_eq!(raw, 16384);
        assert!(!clipped);
        let (raw, clipped) = c.to_raw(100.0);
        assert_eq!(raw, 32767);
        assert!(clipped);
        assert!((c.max_value() - 10.0).abs() < 0.01);
    }

    #[test]
    fn loopback_reproduces_written_samples() {
        let (mut ai, mut ao, sim) = sim_devices(1000.0, 1, 0.0, true);
        ai.open(&[0], 1000.0).unwrap();
        ao.open(&[0]).unwrap();

        let conv = ao.converter(0).unwrap().clone();
        let raw: Vec<i32> = [0.0, 1.0, 2.0].iter().map(|&v| conv.to_raw(v).0).collect();
        ao.write(vec![RawSignal {
            channel: 0,
            raw,
            sample_interval: 1e-3,
            delay: 0.0,
            trigger: StartTrigger::Now,
        }])
        .unwrap();

        sim.advance(5);
        let started = ao.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].onset_index, 0);

        let mut out = vec![Vec::new()];
        ai.read(&mut out).unwrap();
        assert_eq!(out[0].len(), 5);
        assert_eq!(out[0][0], 0.0);
        assert!((out[0][1] - 1.0).abs() < 1e-3);
        assert!((out[0][2] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn delay_shifts_the_onset() {
        let (mut ai, mut ao, sim) = sim_devices(1000.0, 1, 0.0, true);
        ai.open(&[0], 1000.0).unwrap();
        ao.open(&[0]).unwrap();
        let conv = ao.converter(0).unwrap().clone();
        ao.write(vec![RawSignal {
            channel: 0,
            raw: vec![conv.to_raw(1.0).0; 3],
            sample_interval: 1e-3,
            delay: 0.01,
            trigger: StartTrigger::Now,
        }])
        .unwrap();

        sim.advance(5);
        assert!(ao.started().is_empty());
        sim.advance(10);
        let started = ao.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].onset_index, 10);
    }

    #[test]
    fn invalid_channel_rejected() {
        let (mut ai, _ao, _sim) = sim_devices(1000.0, 2, 0.0, true);
        assert!(matches!(
            ai.open(&[7], 1000.0),
            Err(Error::InvalidChannel { channel: 7, .. })
        ));
    }
}
