//! The stimulus index: one wide CSV-like row per stimulus, locating it
//! by sample index in every trace and by event index in every stream.
//! Section-break comment rows separate procedure runs.

use std::fs::File;
use std::path::Path;

use crate::daq::StimulusDescriptor;
use crate::error::Result;

pub struct StimulusIndexWriter {
    writer: csv::Writer<File>,
    last_repro: Option<String>,
    rows: usize,
}

impl StimulusIndexWriter {
    pub fn create(path: &Path, trace_names: &[String], event_names: &[String]) -> Result<StimulusIndexWriter> {
        let file = File::create(path).map_err(crate::error::Error::from)?;
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);
        let mut header: Vec<String> = vec!["time".to_string()];
        header.extend(trace_names.iter().map(|n| format!("index:{n}")));
        header.extend(event_names.iter().map(|n| format!("events:{n}")));
        header.extend(
            ["amplitude", "duration", "delay", "stimulus"]
                .iter()
                .map(|s| s.to_string()),
        );
        writer
            .write_record(&header)
            .map_err(|e| crate::error::Error::WriteError {
                trace: "stimulus index".to_string(),
                message: e.to_string(),
            })?;
        Ok(StimulusIndexWriter {
            writer,
            last_repro: None,
            rows: 0,
        })
    }

    /// Appends one stimulus row, `session_t0` is subtracted from the
    /// onset time so rows carry session time.
    pub fn write(&mut self, desc: &StimulusDescriptor, session_t0: f64) -> Result<()> {
        if self.last_repro.as_deref() != Some(desc.repro.as_str()) {
            // section break between procedure runs
            self.write_record(&[format!("# {}", desc.repro)])?;
            self.last_repro = Some(desc.repro.clone());
        }
        let mut row: Vec<String> = vec![format!("{:.6}", desc.time - session_t0)];
        row.extend(desc.trace_indices.iter().map(|(_, i)| i.to_string()));
        row.extend(desc.event_indices.iter().map(|(_, i)| i.to_string()));
        row.push(
            desc.intensity
                .map(|i| format!("{i}"))
                .unwrap_or_else(|| "-".to_string()),
        );
        row.push(format!("{:.6}", desc.duration));
        row.push(format!("{:.6}", desc.delay));
        row.push(desc.description.save_string());
        self.write_record(&row)?;
        self.rows += 1;
        Ok(())
    }

    fn write_record(&mut self, record: &[String]) -> Result<()> {
        self.writer
            .write_record(record)
            .map_err(|e| crate::error::Error::WriteError {
                trace: "stimulus index".to_string(),
                message: e.to_string(),
            })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(crate::error::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    fn descriptor(repro: &str, time: f64) -> StimulusDescriptor {
        let mut description = Options::new("stimulus");
        description.add_number("freq", "Frequency", 100.0, "Hz");
        StimulusDescriptor {
            out_trace: "Out-1".to_string(),
            ident: "sine-100Hz".to_string(),
            repro: repro.to_string(),
            time,
            trace_indices: vec![("V-1".to_string(), (time * 1000.0) as usize)],
            event_indices: vec![("Spikes-1".to_string(), 3)],
            duration: 0.1,
            sample_interval: 1e-3,
            intensity: Some(60.0),
            delay: 0.0,
            description,
            save: true,
        }
    }

    #[test]
    fn rows_carry_indices_and_sections_split_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stimuli.dat");
        {
            let mut w = StimulusIndexWriter::create(
                &path,
                &["V-1".to_string()],
                &["Spikes-1".to_string()],
            )
            .unwrap();
            w.write(&descriptor("SinePulse", 1.0), 0.5).unwrap();
            w.write(&descriptor("SinePulse", 2.0), 0.5).unwrap();
            w.write(&descriptor("Tuning", 3.0), 0.5).unwrap();
            w.flush().unwrap();
            assert_eq!(w.rows(), 3);
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("time,index:V-1,events:Spikes-1"));
        assert_eq!(lines[1], "# SinePulse");
        assert!(lines[2].starts_with("0.500000,1000,3,60,"));
        assert_eq!(lines[4], "# Tuning");
        assert_eq!(
            lines.iter().filter(|l| l.starts_with('#')).count(),
            2,
            "one section break per procedure run"
        );
    }
}
