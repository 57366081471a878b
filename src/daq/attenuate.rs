//! Intensity-to-attenuation mapping.
//!
//! An attenuator translates a requested stimulus intensity (whatever
//! quantity is natural for the setup: output level in dB, sound
//! pressure, field amplitude) into an attenuation level in decibel for
//! one analog output channel. `decibel` and `intensity` must be
//! mathematical inverses up to the device resolution, so the engine can
//! always report the intensity that was actually realized. Requests
//! outside the reachable range fail loudly and carry the closest
//! achievable intensity.

use crate::error::{Error, Result};

pub trait Attenuate: Send {
    /// Converts a requested intensity (plus carrier frequency, for
    /// frequency-dependent hardware) into an attenuation level.
    fn decibel(&self, intensity: f64, frequency: f64) -> Result<f64>;

    /// Inverse of `decibel`: the intensity realized at a given level.
    fn intensity(&self, decibel: f64, frequency: f64) -> f64;

    /// Lowest settable attenuation level.
    fn min_decibel(&self) -> f64;

    /// Highest settable attenuation level.
    fn max_decibel(&self) -> f64;

    /// Level granularity of the hardware.
    fn resolution(&self) -> f64 {
        0.0
    }

    /// Validates and quantizes a request without touching hardware.
    /// Returns the realized intensity, or an error carrying the closest
    /// achievable one.
    fn test_write(&self, intensity: f64, frequency: f64) -> Result<f64> {
        if !intensity.is_finite() {
            return Err(Error::IntensityError(format!(
                "intensity {intensity} is not a number"
            )));
        }
        let db = self.decibel(intensity, frequency)?;
        if db > self.max_decibel() {
            return Err(Error::Overflow {
                achievable: self.intensity(self.max_decibel(), frequency),
            });
        }
        if db < self.min_decibel() {
            return Err(Error::Underflow {
                achievable: self.intensity(self.min_decibel(), frequency),
            });
        }
        let db = self.quantize(db);
        Ok(self.intensity(db, frequency))
    }

    /// Sets the attenuation for a request; the default implementation
    /// has no hardware side effects beyond `test_write`.
    fn write(&self, intensity: f64, frequency: f64) -> Result<f64> {
        self.test_write(intensity, frequency)
    }

    fn quantize(&self, db: f64) -> f64 {
        let r = self.resolution();
        if r > 0.0 { (db / r).round() * r } else { db }
    }
}

/// An attenuator whose intensity is the output level in decibel
/// itself: `decibel` is the identity within `[min_db, max_db]`.
pub struct LinearAttenuate {
    min_db: f64,
    max_db: f64,
    resolution: f64,
}

impl LinearAttenuate {
    pub fn new(min_db: f64, max_db: f64, resolution: f64) -> LinearAttenuate {
        LinearAttenuate {
            min_db,
            max_db,
            resolution,
        }
    }
}

impl Attenuate for LinearAttenuate {
    fn decibel(&self, intensity: f64, _frequency: f64) -> Result<f64> {
        Ok(intensity)
    }

    fn intensity(&self, decibel: f64, _frequency: f64) -> f64 {
        decibel
    }

    fn min_decibel(&self) -> f64 {
        self.min_db
    }

    fn max_decibel(&self) -> f64 {
        self.max_db
    }

    fn resolution(&self) -> f64 {
        self.resolution
    }
}

/// Sound-pressure style attenuator: intensity is a linear amplitude
/// relative to a reference, attenuation is `20 log10(intensity/ref)`.
/// Non-positive intensities cannot be expressed as a level at all.
pub struct LogAttenuate {
    reference: f64,
    min_db: f64,
    max_db: f64,
    resolution: f64,
}

impl LogAttenuate {
    pub fn new(reference: f64, min_db: f64, max_db: f64, resolution: f64) -> LogAttenuate {
        LogAttenuate {
            reference,
            min_db,
            max_db,
            resolution,
        }
    }
}

impl Attenuate for LogAttenuate {
    fn decibel(&self, intensity: f64, _frequency: f64) -> Result<f64> {
        if intensity <= 0.0 {
            return Err(Error::IntensityUnderflow {
                achievable: self.intensity(self.min_db, 0.0),
            });
        }
        let db = 20.0 * (intensity / self.reference).log10();
        if !db.is_finite() {
            return Err(Error::IntensityError(format!(
                "cannot express intensity {intensity} as a level"
            )));
        }
        Ok(db)
    }

    fn intensity(&self, decibel: f64, _frequency: f64) -> f64 {
        self.reference * 10f64.powf(decibel / 20.0)
    }

    fn min_decibel(&self) -> f64 {
        self.min_db
    }

    fn max_decibel(&self) -> f64 {
        self.max_db
    }

    fn resolution(&self) -> f64 {
        self.resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_above_range_fails_with_achievable_maximum() {
        let att = LinearAttenuate::new(-25.0, 80.0, 0.0);
        match att.write(200.0, 0.0) {
            Err(Error::Overflow { achievable }) => assert_eq!(achievable, 80.0),
            other => panic!("expected Overflow, got {other:?}"),
        }
    }

    #[test]
    fn request_below_range_fails_with_achievable_minimum() {
        let att = LinearAttenuate::new(-25.0, 80.0, 0.0);
        match att.write(-100.0, 0.0) {
            Err(Error::Underflow { achievable }) => assert_eq!(achievable, -25.0),
            other => panic!("expected Underflow, got {other:?}"),
        }
    }

    #[test]
    fn quantized_to_resolution() {
        let att = LinearAttenuate::new(0.0, 80.0, 0.5);
        assert_eq!(att.write(10.3, 0.0).unwrap(), 10.5);
    }

    #[test]
    fn decibel_and_intensity_are_inverses() {
        let att = LogAttenuate::new(1.0, -60.0, 60.0, 0.0);
        for &i in &[0.01, 0.5, 1.0, 7.3, 100.0] {
            let db = att.decibel(i, 0.0).unwrap();
            let back = att.intensity(db, 0.0);
            assert!((back - i).abs() < 1e-9 * i);
        }
    }

    #[test]
    fn nonpositive_intensity_is_an_intensity_error() {
        let att = LogAttenuate::new(1.0, -60.0, 60.0, 0.0);
        assert!(matches!(
            att.write(0.0, 0.0),
            Err(Error::IntensityUnderflow { .. })
        ));
        assert!(matches!(att.write(f64::NAN, 0.0), Err(Error::IntensityError(_))));
    }
}
