//! Built-in procedures: the idle fallback and a repeating sine
//! stimulation paradigm.

use log::warn;

use crate::daq::OutData;
use crate::options::Options;
use crate::repro::context::ReProContext;
use crate::repro::scheduler::{Outcome, RePro};

/// Does nothing for a configurable stretch of time. Serves as the
/// fallback procedure: it keeps acquisition alive between runs and
/// yields immediately when interrupted.
pub struct Pause {
    options: Options,
}

impl Pause {
    pub fn new() -> Pause {
        let mut options = Options::new("Pause");
        options.add_number("duration", "Pause duration", 1.0, "s");
        Pause { options }
    }
}

impl Default for Pause {
    fn default() -> Self {
        Pause::new()
    }
}

impl RePro for Pause {
    fn name(&self) -> &str {
        "Pause"
    }

    fn options(&self) -> &Options {
        &self.options
    }

    fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    fn main(&mut self, cx: &mut ReProContext) -> Outcome {
        let duration = self.options.number("duration", "s");
        if cx.sleep(duration) {
            return Outcome::Aborted;
        }
        Outcome::Completed
    }
}

/// Repeatedly plays a sine pulse and waits out a pause, the shape of a
/// simple search/tuning paradigm.
pub struct SinePulse {
    options: Options,
}

impl SinePulse {
    pub fn new() -> SinePulse {
        let mut options = Options::new("SinePulse");
        options.add_text("outtrace", "Output port", "Out-1");
        options.add_number("freq", "Frequency", 1000.0, "Hz");
        options.add_number("amplitude", "Amplitude", 1.0, "");
        options.add_number("duration", "Pulse duration", 0.1, "s");
        options.add_number("delay", "Onset delay", 0.0, "s");
        options.add_number("pause", "Pause between pulses", 0.1, "s");
        options.add_integer("repeats", "Number of pulses (0: until stopped)", 10);
        SinePulse { options }
    }
}

impl Default for SinePulse {
    fn default() -> Self {
        SinePulse::new()
    }
}

impl RePro for SinePulse {
    fn name(&self) -> &str {
        "SinePulse"
    }

    fn options(&self) -> &Options {
        &self.options
    }

    fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    fn main(&mut self, cx: &mut ReProContext) -> Outcome {
        let out_trace = self.options.text("outtrace");
        let freq = self.options.number("freq", "Hz");
        let amplitude = self.options.number("amplitude", "");
        let duration = self.options.number("duration", "s");
        let delay = self.options.number("delay", "s");
        let pause = self.options.number("pause", "s");
        let repeats = self.options.integer("repeats").max(0) as u64;

        let interval = match cx.traces().first() {
            Some(t) => t.sample_interval(),
            None => return Outcome::Failed,
        };

        let mut count = 0u64;
        loop {
            if cx.interrupted() || cx.soft_stop_requested() {
                return Outcome::Aborted;
            }
            cx.time_stamp();
            let out = OutData::sine(&out_trace, interval, freq, duration, amplitude)
                .with_delay(delay);
            if let Err(e) = cx.write(out) {
                warn!("SinePulse write failed: {e}");
                let _ = cx.write_zero(&out_trace);
                return Outcome::Failed;
            }
            if cx.sleep_on(delay + duration + pause) {
                let _ = cx.write_zero(&out_trace);
                return Outcome::Aborted;
            }
            count += 1;
            if repeats > 0 && count >= repeats {
                return Outcome::Completed;
            }
        }
    }
}
