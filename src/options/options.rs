//! An ordered collection of parameters with named sub-sections.
//!
//! Procedures expose their tunable inputs as an `Options`, macros bind
//! values into them, stimulus descriptors carry one as their free-form
//! description, and the session metadata is one. Parameters are
//! addressed by plain name (searched recursively) or by dotted path
//! (`section.name`).

use crate::options::parameter::{Parameter, ValueType, split_number_unit};

#[derive(Debug, Clone, Default)]
pub struct Options {
    name: String,
    params: Vec<Parameter>,
    sections: Vec<Options>,
}

impl Options {
    pub fn new(name: &str) -> Options {
        Options {
            name: name.to_string(),
            params: Vec::new(),
            sections: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.sections.is_empty()
    }

    // construction

    pub fn push(&mut self, p: Parameter) -> &mut Parameter {
        self.params.push(p);
        self.params.last_mut().expect("just pushed")
    }

    pub fn add_number(&mut self, name: &str, request: &str, value: f64, unit: &str) -> &mut Parameter {
        self.push(Parameter::number_param(name, request, value, unit))
    }

    pub fn add_integer(&mut self, name: &str, request: &str, value: i64) -> &mut Parameter {
        self.push(Parameter::integer_param(name, request, value, ""))
    }

    pub fn add_text(&mut self, name: &str, request: &str, value: &str) -> &mut Parameter {
        self.push(Parameter::text_param(name, request, value))
    }

    pub fn add_boolean(&mut self, name: &str, request: &str, value: bool) -> &mut Parameter {
        self.push(Parameter::boolean_param(name, request, value))
    }

    pub fn new_section(&mut self, name: &str) -> &mut Options {
        self.sections.push(Options::new(name));
        self.sections.last_mut().expect("just pushed")
    }

    // lookup

    pub fn section(&self, name: &str) -> Option<&Options> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_mut(&mut self, name: &str) -> Option<&mut Options> {
        self.sections.iter_mut().find(|s| s.name == name)
    }

    pub fn sections(&self) -> &[Options] {
        &self.sections
    }

    /// Finds a parameter by plain name (recursive, this level first) or
    /// by dotted path addressing into sections.
    pub fn get(&self, path: &str) -> Option<&Parameter> {
        if let Some((section, rest)) = path.split_once('.') {
            if let Some(p) = self.section(section).and_then(|s| s.get(rest)) {
                return Some(p);
            }
        }
        self.params
            .iter()
            .find(|p| p.name() == path)
            .or_else(|| self.sections.iter().find_map(|s| s.get(path)))
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Parameter> {
        if let Some((section, rest)) = path.split_once('.') {
            let hit = self
                .section(section)
                .map(|s| s.get(rest).is_some())
                .unwrap_or(false);
            if hit {
                return self.section_mut(section).and_then(|s| s.get_mut(rest));
            }
        }
        if self.params.iter().any(|p| p.name() == path) {
            return self.params.iter_mut().find(|p| p.name() == path);
        }
        for i in 0..self.sections.len() {
            if self.sections[i].get(path).is_some() {
                return self.sections[i].get_mut(path);
            }
        }
        None
    }

    pub fn index(&self, i: usize) -> Option<&Parameter> {
        self.params.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Iterates parameters whose flags contain all bits of `flags`
    /// (all parameters when `flags` is zero).
    pub fn iter_flags(&self, flags: u32) -> impl Iterator<Item = &Parameter> {
        self.params
            .iter()
            .filter(move |p| flags == 0 || p.flags() & flags == flags)
    }

    // typed convenience accessors

    pub fn number(&self, path: &str, unit: &str) -> f64 {
        self.get(path).map(|p| p.number(unit, 0)).unwrap_or(f64::NAN)
    }

    pub fn integer(&self, path: &str) -> i64 {
        self.get(path).map(|p| p.integer(0)).unwrap_or(0)
    }

    pub fn boolean(&self, path: &str) -> bool {
        self.get(path).map(|p| p.boolean(0)).unwrap_or(false)
    }

    pub fn text(&self, path: &str) -> String {
        self.get(path).map(|p| p.text(0)).unwrap_or_default()
    }

    pub fn set_number(&mut self, path: &str, v: f64) -> bool {
        match self.get_mut(path) {
            Some(p) => {
                p.set_number(v);
                true
            }
            None => false,
        }
    }

    pub fn set_text(&mut self, path: &str, v: &str) -> bool {
        match self.get_mut(path) {
            Some(p) => {
                p.set_text_value(v);
                true
            }
            None => false,
        }
    }

    /// A parameter is logically enabled when every one of its activation
    /// conditions holds against the parameters of this collection.
    pub fn active(&self, path: &str) -> bool {
        let p = match self.get(path) {
            Some(p) => p,
            None => return false,
        };
        p.activations().iter().all(|a| match self.get(&a.name) {
            Some(gate) => a.matches(gate),
            None => false,
        })
    }

    // string I/O

    /// Assigns `name=value` pairs (separated by `;`) to existing
    /// parameters with type conversion. Returns the names that did not
    /// resolve.
    pub fn assign_from(&mut self, s: &str) -> Vec<String> {
        let mut unknown = Vec::new();
        for (name, value) in split_assignments(s) {
            match self.get_mut(&name) {
                Some(p) => p.assign(&value),
                None => unknown.push(name),
            }
        }
        unknown
    }

    /// Loads `name=value` pairs, creating parameters for unknown names
    /// with the type inferred from the value.
    pub fn load(&mut self, s: &str) {
        for (name, value) in split_assignments(s) {
            if let Some(p) = self.get_mut(&name) {
                p.assign(&value);
                continue;
            }
            let mut p = match infer_type(&value) {
                ValueType::Number => Parameter::number_param(&name, "", 0.0, ""),
                ValueType::Boolean => Parameter::boolean_param(&name, "", false),
                _ => Parameter::text_param(&name, "", ""),
            };
            p.assign(&value);
            self.params.push(p);
        }
    }

    /// Serializes all parameters as `name=value` joined by `; `.
    /// Sections are rendered with their dotted prefix.
    pub fn save_string(&self) -> String {
        let mut parts: Vec<String> = self.params.iter().map(|p| p.save()).collect();
        for s in &self.sections {
            for p in s.params.iter() {
                parts.push(format!("{}.{}", s.name, p.save()));
            }
        }
        parts.join("; ")
    }

    /// One `label: value` line per parameter, sections indented; the
    /// shape used for `#`-prefixed metadata headers in data files.
    pub fn save_lines(&self, indent: usize) -> Vec<String> {
        let pad = " ".repeat(indent);
        let mut lines = Vec::new();
        for p in &self.params {
            lines.push(format!("{pad}{}: {}", p.name(), p.text(0)));
        }
        for s in &self.sections {
            lines.push(format!("{pad}{}:", s.name));
            lines.extend(s.save_lines(indent + 4));
        }
        lines
    }

    /// Snapshot of everything that differs from its default value.
    pub fn diff(&self) -> Options {
        let mut out = Options::new(&self.name);
        for p in &self.params {
            if p.differs_from_default() {
                out.params.push(p.clone());
            }
        }
        for s in &self.sections {
            let d = s.diff();
            if !d.is_empty() {
                out.sections.push(d);
            }
        }
        out
    }

    pub fn set_to_defaults(&mut self) {
        for p in &mut self.params {
            p.set_to_default();
        }
        for s in &mut self.sections {
            s.set_to_defaults();
        }
    }

    pub fn set_defaults_to_values(&mut self) {
        for p in &mut self.params {
            p.set_default_to_value();
        }
        for s in &mut self.sections {
            s.set_defaults_to_values();
        }
    }

    pub fn clear_changed(&mut self) {
        for p in &mut self.params {
            p.clear_changed();
        }
        for s in &mut self.sections {
            s.clear_changed();
        }
    }
}

/// Splits `"a=1; b=\"x; y\"; c=2mV"` into pairs, respecting quotes.
fn split_assignments(s: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut depth_quote = false;
    let mut current = String::new();
    let mut parts: Vec<String> = Vec::new();
    for c in s.chars() {
        match c {
            '"' => {
                depth_quote = !depth_quote;
                current.push(c);
            }
            ';' if !depth_quote => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((k, v)) => pairs.push((k.trim().to_string(), v.trim().to_string())),
            None => pairs.push((part.to_string(), String::new())),
        }
    }
    pairs
}

fn infer_type(value: &str) -> ValueType {
    let v = value.trim();
    if v == "true" || v == "false" {
        ValueType::Boolean
    } else if v.starts_with('[') || split_number_unit(v).is_some() {
        ValueType::Number
    } else {
        ValueType::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stimulus_options() -> Options {
        let mut o = Options::new("stimulus");
        o.add_number("amp", "Amplitude", 1.0, "mV");
        o.add_number("dur", "Duration", 0.1, "s");
        o.add_text("shape", "Waveform shape", "sine");
        let s = o.new_section("carrier");
        s.add_number("freq", "Carrier frequency", 1.0, "kHz");
        o
    }

    #[test]
    fn dotted_path_and_recursive_lookup() {
        let o = stimulus_options();
        assert_eq!(o.number("carrier.freq", "Hz"), 1000.0);
        // plain name searched recursively
        assert_eq!(o.number("freq", "kHz"), 1.0);
    }

    #[test]
    fn assign_from_reports_unknown_names() {
        let mut o = stimulus_options();
        let unknown = o.assign_from("amp=2.5mV; nosuch=1; shape=noise");
        assert_eq!(unknown, vec!["nosuch".to_string()]);
        assert_eq!(o.number("amp", "mV"), 2.5);
        assert_eq!(o.text("shape"), "noise");
    }

    #[test]
    fn load_infers_types() {
        let mut o = Options::new("vars");
        o.load("n=5; amp=0.3mV; label=probe; on=true");
        assert_eq!(o.number("n", ""), 5.0);
        assert!((o.number("amp", "V") - 0.0003).abs() < 1e-15);
        assert_eq!(o.text("label"), "probe");
        assert!(o.boolean("on"));
    }

    #[test]
    fn quoted_semicolons_survive_splitting() {
        let mut o = Options::new("vars");
        o.load("note=\"a; b\"; x=1");
        assert_eq!(o.text("note"), "a; b");
        assert_eq!(o.number("x", ""), 1.0);
    }

    #[test]
    fn diff_reports_only_changes() {
        let mut o = stimulus_options();
        o.assign_from("dur=0.2s");
        let d = o.diff();
        assert_eq!(d.len(), 1);
        assert_eq!(d.index(0).map(|p| p.name().to_string()), Some("dur".into()));
    }

    #[test]
    fn activation_via_collection() {
        let mut o = Options::new("opts");
        o.add_text("mode", "Mode", "burst");
        o.push(
            crate::options::parameter::Parameter::number_param("period", "Burst period", 0.5, "s")
                .with_activation("mode", "burst|train", true),
        );
        assert!(o.active("period"));
        o.set_text("mode", "single");
        assert!(!o.active("period"));
    }

    #[test]
    fn save_string_round_trips_through_load() {
        let mut o = stimulus_options();
        o.assign_from("amp=2mV");
        let s = o.save_string();
        let mut o2 = Options::new("copy");
        o2.load(&s);
        assert_eq!(o2.number("amp", "mV"), 2.0);
        assert_eq!(o2.number("carrier.freq", "kHz"), 1.0);
    }
}
