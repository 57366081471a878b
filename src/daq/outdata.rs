//! Output signals and the stimulus descriptors they leave behind.
//!
//! An `OutData` is a fully prepared stimulus: samples, timing, the
//! requested intensity for the attenuator, and a free-form description
//! that ends up in the stimulus index on disk. When the engine starts
//! the signal it records a `StimulusDescriptor` tying the stimulus to
//! the exact sample index of its onset in every input trace and the
//! next event index in every event stream.

use crate::options::Options;

/// How an output signal is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartTrigger {
    /// Start on the next service tick (plus the signal's delay).
    #[default]
    Now,
    /// Armed; starts on the device's hardware trigger line.
    HardwareTrigger,
}

#[derive(Debug, Clone)]
pub struct OutData {
    /// Name of the output port this signal plays on.
    pub trace: String,
    pub samples: Vec<f64>,
    /// Sample interval in seconds.
    pub sample_interval: f64,
    /// Requested intensity for the port's attenuator, if any.
    pub intensity: Option<f64>,
    /// Carrier frequency handed to the attenuator (Hz).
    pub carrier_freq: f64,
    /// Delay between release and the first sample, in seconds.
    pub delay: f64,
    pub trigger: StartTrigger,
    /// Whether the engine stamps `signal_time` on every input trace at
    /// the acquisition-exact onset of this signal.
    pub set_signal_time: bool,
    /// Free key/values describing the stimulus shape.
    pub description: Options,
    pub ident: String,
}

impl OutData {
    pub fn new(trace: &str, sample_interval: f64) -> OutData {
        OutData {
            trace: trace.to_string(),
            samples: Vec::new(),
            sample_interval,
            intensity: None,
            carrier_freq: 0.0,
            delay: 0.0,
            trigger: StartTrigger::Now,
            set_signal_time: true,
            description: Options::new("stimulus"),
            ident: String::new(),
        }
    }

    /// A sine stimulus starting at phase zero.
    pub fn sine(trace: &str, sample_interval: f64, freq: f64, duration: f64, ampl: f64) -> OutData {
        let n = (duration / sample_interval).round() as usize;
        let mut out = OutData::new(trace, sample_interval);
        out.samples = (0..n)
            .map(|i| ampl * (2.0 * std::f64::consts::PI * freq * i as f64 * sample_interval).sin())
            .collect();
        out.ident = format!("sine-{freq}Hz");
        out.description.add_text("shape", "Waveform", "sine");
        out.description.add_number("freq", "Frequency", freq, "Hz");
        out.description.add_number("ampl", "Amplitude", ampl, "");
        out
    }

    /// A constant pulse of the given amplitude.
    pub fn pulse(trace: &str, sample_interval: f64, duration: f64, ampl: f64) -> OutData {
        let n = (duration / sample_interval).round() as usize;
        let mut out = OutData::new(trace, sample_interval);
        out.samples = vec![ampl; n];
        out.ident = format!("pulse-{ampl}");
        out.description.add_text("shape", "Waveform", "pulse");
        out.description.add_number("ampl", "Amplitude", ampl, "");
        out
    }

    /// A single zero sample, as written by `write_zero`.
    pub fn zero(trace: &str, sample_interval: f64) -> OutData {
        let mut out = OutData::new(trace, sample_interval);
        out.samples = vec![0.0];
        out.set_signal_time = false;
        out.ident = "zero".to_string();
        out
    }

    pub fn with_delay(mut self, delay: f64) -> OutData {
        self.delay = delay;
        self
    }

    pub fn with_intensity(mut self, intensity: f64) -> OutData {
        self.intensity = Some(intensity);
        self
    }

    pub fn with_carrier(mut self, freq: f64) -> OutData {
        self.carrier_freq = freq;
        self
    }

    /// Duration of the sample block in seconds (delay excluded).
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 * self.sample_interval
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn max_amplitude(&self) -> f64 {
        self.samples.iter().fold(0.0, |m, v| v.abs().max(m))
    }
}

/// Several output signals released on the same hardware tick.
pub type OutList = Vec<OutData>;

/// Everything persistence needs to relocate a stimulus in O(1).
#[derive(Debug, Clone)]
pub struct StimulusDescriptor {
    pub out_trace: String,
    pub ident: String,
    /// Name of the procedure that emitted the stimulus.
    pub repro: String,
    /// Onset time in seconds of acquisition time.
    pub time: f64,
    /// Start sample index in every input trace at emission.
    pub trace_indices: Vec<(String, usize)>,
    /// Next event index in every event stream at emission.
    pub event_indices: Vec<(String, usize)>,
    pub duration: f64,
    pub sample_interval: f64,
    /// Realized intensity (after attenuation), if an attenuator is involved.
    pub intensity: Option<f64>,
    pub delay: f64,
    pub description: Options,
    /// False when the running procedure requested `no_saving`.
    pub save: bool,
}
