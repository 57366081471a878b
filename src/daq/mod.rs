//! Data acquisition: device contracts, attenuation, output signals and
//! the real-time engine.

pub mod attenuate;
pub mod device;
pub mod engine;
pub mod outdata;

pub use attenuate::{Attenuate, LinearAttenuate, LogAttenuate};
pub use device::{AnalogInput, AnalogOutput, Converter, RawSignal, SimHandle, sim_devices};
pub use engine::{DaqEngine, OutPortSpec, SafetyMonitor, TraceSpec};
pub use outdata::{OutData, OutList, StartTrigger, StimulusDescriptor};
