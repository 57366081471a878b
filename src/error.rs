//! Crate-wide error type.
//!
//! Hardware and configuration failures are surfaced as values, never
//! panics: device errors carry the offending trace or channel so the
//! running procedure can decide to continue, retry, or fail its run.
//! Intensity and range errors carry the closest achievable value.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("device not open: {0}")]
    NotOpen(String),

    #[error("invalid device: {0}")]
    InvalidDevice(String),

    #[error("invalid channel {channel} on device {device}")]
    InvalidChannel { device: String, channel: usize },

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("invalid sample rate {requested} Hz (device maximum {max} Hz)")]
    InvalidSampleRate { requested: f64, max: f64 },

    #[error("continuous acquisition not supported: {0}")]
    InvalidContinuous(String),

    #[error("invalid channel sequence: {0}")]
    InvalidChannelSequence(String),

    /// Signal exceeds the upper DAC limit; `achievable` is the clipped value.
    #[error("signal above DAC range, achievable {achievable}")]
    Overflow { achievable: f64 },

    /// Signal exceeds the lower DAC limit; `achievable` is the clipped value.
    #[error("signal below DAC range, achievable {achievable}")]
    Underflow { achievable: f64 },

    /// Requested intensity too large for the attenuator; `achievable` is the maximum.
    #[error("intensity too large, achievable {achievable}")]
    IntensityOverflow { achievable: f64 },

    /// Requested intensity too small for the attenuator; `achievable` is the minimum.
    #[error("intensity too small, achievable {achievable}")]
    IntensityUnderflow { achievable: f64 },

    #[error("intensity could not be converted to an attenuation level: {0}")]
    IntensityError(String),

    #[error("read error on trace {trace}: {message}")]
    ReadError { trace: String, message: String },

    #[error("write error on trace {trace}: {message}")]
    WriteError { trace: String, message: String },

    #[error("buffer underrun on trace {trace}")]
    BufferUnderrun { trace: String },

    #[error("buffer overflow on trace {trace}")]
    BufferOverflow { trace: String },

    #[error("device busy: {0}")]
    Busy(String),

    #[error("unknown error: {0}")]
    Unknown(String),

    /// Buffer index fell below the oldest accessible element.
    #[error("index {index} below minimum accessible index {min}")]
    OutOfRange { index: usize, min: usize },

    #[error("{file}:{line}: {message}")]
    ConfigSyntax {
        file: String,
        line: usize,
        message: String,
    },

    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("no fallback procedure resolvable")]
    MissingFallback,
}

impl Error {
    /// Classifies errors that terminate startup versus ones a running
    /// procedure may recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigSyntax { .. } | Error::UnknownPlugin(_) | Error::MissingFallback
        )
    }

    pub fn syntax(file: impl Into<String>, line: usize, message: impl Into<String>) -> Error {
        Error::ConfigSyntax {
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::WriteError {
            trace: String::new(),
            message: e.to_string(),
        }
    }
}
