//! Table headers for the tabular text data files.
//!
//! A key describes the columns of a data file: label, unit and a
//! printf-style number format per column. The key block is written as
//! `#`-prefixed lines after the metadata, and data rows are rendered
//! column by column with the declared widths; `-` marks missing values.

use std::io::{self, Write};

use crate::options::format_number;

#[derive(Debug, Clone)]
pub struct Column {
    pub label: String,
    pub unit: String,
    pub format: String,
}

impl Column {
    /// Column width taken from the format string (`%7.2f` → 7), wide
    /// enough for label and unit.
    fn width(&self) -> usize {
        let body = self.format.trim_start_matches('%');
        let digits: String = body
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let w = digits.parse::<usize>().unwrap_or(0);
        w.max(self.label.len()).max(self.unit.len())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TableKey {
    columns: Vec<Column>,
}

pub const MISSING: &str = "-";
const SEPARATOR: &str = "  ";

impl TableKey {
    pub fn new() -> TableKey {
        TableKey {
            columns: Vec::new(),
        }
    }

    pub fn add_number(&mut self, label: &str, unit: &str, format: &str) -> &mut TableKey {
        self.columns.push(Column {
            label: label.to_string(),
            unit: unit.to_string(),
            format: format.to_string(),
        });
        self
    }

    pub fn add_text(&mut self, label: &str) -> &mut TableKey {
        self.columns.push(Column {
            label: label.to_string(),
            unit: "-".to_string(),
            format: "%s".to_string(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.label.as_str())
    }

    /// Writes the key block: a `# Key` marker followed by label, unit
    /// and format lines.
    pub fn write_key(&self, w: &mut impl Write) -> io::Result<()> {
        writeln!(w, "# Key")?;
        for line in [
            self.render_row(|c| c.label.clone()),
            self.render_row(|c| c.unit.clone()),
            self.render_row(|c| c.format.clone()),
        ] {
            writeln!(w, "# {line}")?;
        }
        Ok(())
    }

    fn render_row(&self, f: impl Fn(&Column) -> String) -> String {
        self.columns
            .iter()
            .map(|c| format!("{:>width$}", f(c), width = c.width()))
            .collect::<Vec<_>>()
            .join(SEPARATOR)
    }

    /// Renders one data row; `None` cells become the missing marker.
    pub fn render_data(&self, values: &[Option<f64>]) -> String {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let cell = match values.get(i).copied().flatten() {
                    Some(v) => format_number(&c.format, v),
                    None => MISSING.to_string(),
                };
                format!("{:>width$}", cell, width = c.width())
            })
            .collect::<Vec<_>>()
            .join(SEPARATOR)
    }

    /// Renders one row of preformatted cells (text columns padded).
    pub fn render_text_data(&self, values: &[String]) -> String {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let cell = values.get(i).map(String::as_str).unwrap_or(MISSING);
                format!("{:>width$}", cell, width = c.width())
            })
            .collect::<Vec<_>>()
            .join(SEPARATOR)
    }
}
