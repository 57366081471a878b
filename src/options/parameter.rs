//! A single typed parameter: name, request string, value(s), unit,
//! numeric range, flags, and activation conditions.
//!
//! Parameters are the exchange currency between procedures, macros, the
//! stimulus descriptors, and the metadata written to disk. A parameter
//! holds an ordered sequence of values of one kind; numbers carry an
//! internal unit (storage) and a display unit (serialization), plus an
//! optional uncertainty per value.

use crate::options::units::change_unit;

/// Flag bit marking a parameter whose value differs from its default or
/// was assigned since the last `clear_changed`.
pub const CHANGED_FLAG: u32 = 1 << 0;

/// The kinds a parameter value can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Text,
    Number,
    Integer,
    Boolean,
    Date,
    Time,
    Section,
}

/// Calendar date as (year, month, day).
pub type Date = (i32, u32, u32);
/// Wall time as (hour, minute, second, millisecond).
pub type Time = (u32, u32, u32, u32);

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(Vec<String>),
    Number {
        values: Vec<f64>,
        errors: Vec<Option<f64>>,
    },
    Integer(Vec<i64>),
    Boolean(Vec<bool>),
    Date(Vec<Date>),
    Time(Vec<Time>),
    Section,
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Text(_) => ValueType::Text,
            Value::Number { .. } => ValueType::Number,
            Value::Integer(_) => ValueType::Integer,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Date(_) => ValueType::Date,
            Value::Time(_) => ValueType::Time,
            Value::Section => ValueType::Section,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Text(v) => v.len(),
            Value::Number { values, .. } => values.len(),
            Value::Integer(v) => v.len(),
            Value::Boolean(v) => v.len(),
            Value::Date(v) => v.len(),
            Value::Time(v) => v.len(),
            Value::Section => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Comparison operator of a numeric activation condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
}

/// A condition gating this parameter on the value of another one.
///
/// Text conditions match against `|`-separated alternatives; numeric
/// conditions compare with unit conversion.
#[derive(Debug, Clone)]
pub struct Activation {
    pub name: String,
    pub alternatives: Vec<String>,
    pub comparison: Option<Comparison>,
    pub number: f64,
    pub unit: String,
    /// true: active when the condition holds; false: active when it fails.
    pub activate: bool,
}

impl Activation {
    /// Parses a condition string like `">=0.5 mV"` or `"sine|noise"`.
    pub fn parse(name: &str, condition: &str, activate: bool) -> Activation {
        let c = condition.trim();
        let (comparison, rest) = if let Some(r) = c.strip_prefix(">=") {
            (Some(Comparison::GreaterEqual), r)
        } else if let Some(r) = c.strip_prefix("<=") {
            (Some(Comparison::LessEqual), r)
        } else if let Some(r) = c.strip_prefix('>') {
            (Some(Comparison::Greater), r)
        } else if let Some(r) = c.strip_prefix('<') {
            (Some(Comparison::Less), r)
        } else if let Some(r) = c.strip_prefix('=') {
            (Some(Comparison::Equal), r)
        } else {
            (None, c)
        };

        if comparison.is_some() {
            let (number, unit) = split_number_unit(rest).unwrap_or((f64::NAN, String::new()));
            return Activation {
                name: name.to_string(),
                alternatives: Vec::new(),
                comparison,
                number,
                unit,
                activate,
            };
        }

        Activation {
            name: name.to_string(),
            alternatives: c.split('|').map(|s| s.trim().to_string()).collect(),
            comparison: None,
            number: f64::NAN,
            unit: String::new(),
            activate,
        }
    }

    /// Evaluates the condition against the referenced parameter.
    pub fn matches(&self, other: &Parameter) -> bool {
        let holds = match self.comparison {
            Some(cmp) => {
                let v = other.number(&self.unit, 0);
                match cmp {
                    Comparison::Equal => v == self.number,
                    Comparison::Greater => v > self.number,
                    Comparison::GreaterEqual => v >= self.number,
                    Comparison::Less => v < self.number,
                    Comparison::LessEqual => v <= self.number,
                }
            }
            None => {
                let t = other.text(0);
                self.alternatives.iter().any(|a| *a == t)
            }
        };
        holds == self.activate
    }
}

/// Splits "3.5mV" / "3.5 mV" / "-2e-3 V" into number and unit.
pub fn split_number_unit(s: &str) -> Option<(f64, String)> {
    let s = s.trim();
    let mut end = 0;
    let bytes = s.as_bytes();
    let mut seen_digit = false;
    while end < bytes.len() {
        let c = bytes[end] as char;
        let ok = c.is_ascii_digit()
            || c == '.'
            || ((c == '+' || c == '-') && (end == 0 || (bytes[end - 1] | 0x20) == b'e'))
            || ((c == 'e' || c == 'E') && seen_digit && end + 1 < bytes.len());
        if !ok {
            break;
        }
        seen_digit |= c.is_ascii_digit();
        end += 1;
    }
    if !seen_digit {
        return None;
    }
    let number = s[..end].parse::<f64>().ok()?;
    Some((number, s[end..].trim().to_string()))
}

/// Formats a value according to a printf-style `%w.pg` format string.
/// Supported conversions: `f`, `g`, `e`, `d`; anything else falls back
/// to shortest-representation formatting.
pub fn format_number(format: &str, v: f64) -> String {
    let spec = format.strip_prefix('%').unwrap_or(format);
    let conv = spec.chars().last().unwrap_or('g');
    let body = &spec[..spec.len().saturating_sub(1)];
    let (width_s, precision_s) = match body.split_once('.') {
        Some((w, p)) => (w, Some(p)),
        None => (body, None),
    };
    let width = width_s.trim_start_matches('-').parse::<usize>().unwrap_or(0);
    let left = width_s.starts_with('-');
    let precision = precision_s.and_then(|p| p.parse::<usize>().ok());

    let body = match conv {
        'f' => format!("{:.*}", precision.unwrap_or(6), v),
        'e' => format!("{:.*e}", precision.unwrap_or(6), v),
        'd' => format!("{}", v.round() as i64),
        _ => {
            // %g: shortest of fixed/scientific at the given significance.
            let p = precision.unwrap_or(6).max(1);
            let s = format!("{:.*e}", p - 1, v);
            let plain = format!("{v}");
            if plain.len() <= s.len() { plain } else { s }
        }
    };
    if body.len() >= width {
        body
    } else if left {
        format!("{body:<width$}")
    } else {
        format!("{body:>width$}")
    }
}

/// A typed key/value with unit, range, defaults, flags and activations.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    request: String,
    value: Value,
    default: Value,
    intern_unit: String,
    out_unit: String,
    format: String,
    minimum: f64,
    maximum: f64,
    step: f64,
    flags: u32,
    style: u32,
    activations: Vec<Activation>,
}

impl Parameter {
    fn base(name: &str, request: &str, value: Value) -> Parameter {
        Parameter {
            name: name.to_string(),
            request: if request.is_empty() {
                name.to_string()
            } else {
                request.to_string()
            },
            default: value.clone(),
            value,
            intern_unit: String::new(),
            out_unit: String::new(),
            format: "%g".to_string(),
            minimum: f64::NEG_INFINITY,
            maximum: f64::INFINITY,
            step: 1.0,
            flags: 0,
            style: 0,
            activations: Vec::new(),
        }
    }

    pub fn number_param(name: &str, request: &str, value: f64, unit: &str) -> Parameter {
        let mut p = Parameter::base(
            name,
            request,
            Value::Number {
                values: vec![value],
                errors: vec![None],
            },
        );
        p.intern_unit = unit.to_string();
        p.out_unit = unit.to_string();
        p
    }

    pub fn integer_param(name: &str, request: &str, value: i64, unit: &str) -> Parameter {
        let mut p = Parameter::base(name, request, Value::Integer(vec![value]));
        p.intern_unit = unit.to_string();
        p.out_unit = unit.to_string();
        p.format = "%d".to_string();
        p
    }

    pub fn text_param(name: &str, request: &str, value: &str) -> Parameter {
        Parameter::base(name, request, Value::Text(vec![value.to_string()]))
    }

    pub fn boolean_param(name: &str, request: &str, value: bool) -> Parameter {
        Parameter::base(name, request, Value::Boolean(vec![value]))
    }

    pub fn date_param(name: &str, request: &str, date: Date) -> Parameter {
        Parameter::base(name, request, Value::Date(vec![date]))
    }

    pub fn time_param(name: &str, request: &str, time: Time) -> Parameter {
        Parameter::base(name, request, Value::Time(vec![time]))
    }

    pub fn section_param(name: &str) -> Parameter {
        Parameter::base(name, name, Value::Section)
    }

    // builder-style refinements

    pub fn with_units(mut self, intern: &str, out: &str) -> Parameter {
        self.intern_unit = intern.to_string();
        self.out_unit = if out.is_empty() { intern } else { out }.to_string();
        self
    }

    pub fn with_format(mut self, format: &str) -> Parameter {
        self.format = format.to_string();
        self
    }

    pub fn with_range(mut self, minimum: f64, maximum: f64, step: f64) -> Parameter {
        self.minimum = minimum;
        self.maximum = maximum;
        self.step = step;
        self
    }

    pub fn with_error(mut self, error: f64) -> Parameter {
        if let Value::Number { errors, .. } = &mut self.value {
            if let Some(e) = errors.first_mut() {
                *e = Some(error);
            }
        }
        self.default = self.value.clone();
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Parameter {
        self.flags = flags;
        self
    }

    pub fn with_style(mut self, style: u32) -> Parameter {
        self.style = style;
        self
    }

    pub fn with_activation(mut self, name: &str, condition: &str, activate: bool) -> Parameter {
        self.activations
            .push(Activation::parse(name, condition, activate));
        self
    }

    // accessors

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }

    pub fn is_section(&self) -> bool {
        self.value_type() == ValueType::Section
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self.value_type(),
            ValueType::Number | ValueType::Integer | ValueType::Boolean
        )
    }

    pub fn size(&self) -> usize {
        self.value.len()
    }

    pub fn unit(&self) -> &str {
        &self.intern_unit
    }

    pub fn out_unit(&self) -> &str {
        &self.out_unit
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn minimum(&self) -> f64 {
        self.minimum
    }

    pub fn maximum(&self) -> f64 {
        self.maximum
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn add_flags(&mut self, flags: u32) {
        self.flags |= flags;
    }

    pub fn del_flags(&mut self, flags: u32) {
        self.flags &= !flags;
    }

    pub fn style(&self) -> u32 {
        self.style
    }

    pub fn changed(&self) -> bool {
        self.flags & CHANGED_FLAG != 0
    }

    pub fn clear_changed(&mut self) {
        self.flags &= !CHANGED_FLAG;
    }

    pub fn activations(&self) -> &[Activation] {
        &self.activations
    }

    /// Numeric value at `index`, converted from the internal unit to `unit`.
    /// Booleans read as 0/1; non-numeric kinds yield NaN.
    pub fn number(&self, unit: &str, index: usize) -> f64 {
        let raw = match &self.value {
            Value::Number { values, .. } => values.get(index).copied(),
            Value::Integer(v) => v.get(index).map(|i| *i as f64),
            Value::Boolean(v) => v.get(index).map(|b| if *b { 1.0 } else { 0.0 }),
            Value::Text(v) => v
                .get(index)
                .and_then(|s| split_number_unit(s))
                .map(|(n, _)| n),
            _ => None,
        };
        let raw = match raw {
            Some(r) => r,
            None => return f64::NAN,
        };
        if unit.is_empty() || unit == self.intern_unit {
            raw
        } else {
            change_unit(raw, &self.intern_unit, unit)
        }
    }

    /// All numeric values converted to `unit`.
    pub fn numbers(&self, unit: &str) -> Vec<f64> {
        (0..self.size().max(1))
            .map(|i| self.number(unit, i))
            .take(self.size())
            .collect()
    }

    /// Uncertainty of the value at `index`, converted to `unit`.
    pub fn error(&self, unit: &str, index: usize) -> Option<f64> {
        if let Value::Number { errors, .. } = &self.value {
            let e = errors.get(index).copied().flatten()?;
            if unit.is_empty() || unit == self.intern_unit {
                Some(e)
            } else {
                Some(change_unit(e, &self.intern_unit, unit))
            }
        } else {
            None
        }
    }

    pub fn integer(&self, index: usize) -> i64 {
        match &self.value {
            Value::Integer(v) => v.get(index).copied().unwrap_or(0),
            _ => self.number("", index).round() as i64,
        }
    }

    pub fn boolean(&self, index: usize) -> bool {
        match &self.value {
            Value::Boolean(v) => v.get(index).copied().unwrap_or(false),
            Value::Text(v) => v
                .get(index)
                .map(|s| s == "true" || s == "1" || s == "yes")
                .unwrap_or(false),
            _ => self.number("", index) != 0.0,
        }
    }

    pub fn date(&self, index: usize) -> Option<Date> {
        match &self.value {
            Value::Date(v) => v.get(index).copied(),
            _ => None,
        }
    }

    pub fn time(&self, index: usize) -> Option<Time> {
        match &self.value {
            Value::Time(v) => v.get(index).copied(),
            _ => None,
        }
    }

    /// Value at `index` rendered as text. Numbers are formatted with the
    /// parameter's format string and display unit.
    pub fn text(&self, index: usize) -> String {
        match &self.value {
            Value::Text(v) => v.get(index).cloned().unwrap_or_default(),
            Value::Number { values, .. } => match values.get(index) {
                Some(_) => {
                    let v = self.number(&self.out_unit.clone(), index);
                    format!("{}{}", format_number(&self.format, v).trim(), self.out_unit)
                }
                None => String::new(),
            },
            Value::Integer(v) => v
                .get(index)
                .map(|i| format!("{}{}", i, self.out_unit))
                .unwrap_or_default(),
            Value::Boolean(v) => v
                .get(index)
                .map(|b| if *b { "true" } else { "false" }.to_string())
                .unwrap_or_default(),
            Value::Date(v) => v
                .get(index)
                .map(|(y, m, d)| format!("{y:04}-{m:02}-{d:02}"))
                .unwrap_or_default(),
            Value::Time(v) => v
                .get(index)
                .map(|(h, m, s, _)| format!("{h:02}:{m:02}:{s:02}"))
                .unwrap_or_default(),
            Value::Section => String::new(),
        }
    }

    // assignment

    fn mark_changed(&mut self) {
        self.flags |= CHANGED_FLAG;
    }

    pub fn set_number(&mut self, v: f64) {
        let v = v.clamp(self.minimum, self.maximum);
        self.value = Value::Number {
            values: vec![v],
            errors: vec![None],
        };
        self.mark_changed();
    }

    pub fn add_number(&mut self, v: f64) {
        let v = v.clamp(self.minimum, self.maximum);
        if let Value::Number { values, errors } = &mut self.value {
            values.push(v);
            errors.push(None);
        } else {
            self.set_number(v);
        }
        self.mark_changed();
    }

    pub fn set_integer(&mut self, v: i64) {
        self.value = Value::Integer(vec![v]);
        self.mark_changed();
    }

    pub fn set_boolean(&mut self, v: bool) {
        self.value = Value::Boolean(vec![v]);
        self.mark_changed();
    }

    pub fn set_text_value(&mut self, v: &str) {
        self.value = Value::Text(vec![v.to_string()]);
        self.mark_changed();
    }

    /// Assigns from a string with type conversion. Numbers may carry a
    /// unit which is converted to the internal unit; when the parameter
    /// has no unit yet, the parsed unit is adopted. Lists use
    /// `[ a, b, c ]`; `~` denotes the empty string.
    pub fn assign(&mut self, s: &str) {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            let items: Vec<&str> = inner.split(',').map(|p| p.trim()).collect();
            self.assign_list(&items);
            return;
        }
        self.assign_single(s, false);
    }

    fn assign_list(&mut self, items: &[&str]) {
        let mut first = true;
        for item in items {
            self.assign_single(item, !first);
            first = false;
        }
    }

    fn assign_single(&mut self, s: &str, append: bool) {
        match self.value.value_type() {
            ValueType::Number => {
                if let Some((n, unit)) = split_number_unit(s) {
                    let v = if unit.is_empty() {
                        n
                    } else if self.intern_unit.is_empty() {
                        self.intern_unit = unit.clone();
                        self.out_unit = unit;
                        n
                    } else {
                        change_unit(n, &unit, &self.intern_unit)
                    };
                    if append {
                        self.add_number(v);
                    } else {
                        self.set_number(v);
                    }
                }
            }
            ValueType::Integer => {
                if let Some((n, _)) = split_number_unit(s) {
                    if append {
                        if let Value::Integer(v) = &mut self.value {
                            v.push(n.round() as i64);
                            self.mark_changed();
                        }
                    } else {
                        self.set_integer(n.round() as i64);
                    }
                }
            }
            ValueType::Boolean => {
                self.set_boolean(s == "true" || s == "1" || s == "yes");
            }
            ValueType::Date => {
                if let Some(d) = parse_date(s) {
                    self.value = Value::Date(vec![d]);
                    self.mark_changed();
                }
            }
            ValueType::Time => {
                if let Some(t) = parse_time(s) {
                    self.value = Value::Time(vec![t]);
                    self.mark_changed();
                }
            }
            ValueType::Text | ValueType::Section => {
                let text = unquote(s);
                if append {
                    if let Value::Text(v) = &mut self.value {
                        v.push(text);
                        self.mark_changed();
                    }
                } else {
                    self.set_text_value(&text);
                }
            }
        }
    }

    /// Resets the value to the stored default and clears the changed flag.
    pub fn set_to_default(&mut self) {
        self.value = self.default.clone();
        self.clear_changed();
    }

    /// Makes the current value the new default.
    pub fn set_default_to_value(&mut self) {
        self.default = self.value.clone();
        self.clear_changed();
    }

    /// True if the current value differs from the default.
    pub fn differs_from_default(&self) -> bool {
        self.value != self.default
    }

    /// Serializes as `name=value` with list and quoting conventions.
    pub fn save(&self) -> String {
        if self.size() > 1 {
            let items: Vec<String> = (0..self.size()).map(|i| self.save_item(i)).collect();
            format!("{}=[ {} ]", self.name, items.join(", "))
        } else {
            format!("{}={}", self.name, self.save_item(0))
        }
    }

    fn save_item(&self, index: usize) -> String {
        match &self.value {
            Value::Text(v) => {
                let t = v.get(index).map(String::as_str).unwrap_or("");
                quote(t)
            }
            _ => self.text(index),
        }
    }
}

fn parse_date(s: &str) -> Option<Date> {
    let mut it = s.split('-');
    let y = it.next()?.trim().parse().ok()?;
    let m = it.next()?.trim().parse().ok()?;
    let d = it.next()?.trim().parse().ok()?;
    Some((y, m, d))
}

fn parse_time(s: &str) -> Option<Time> {
    let mut it = s.split(':');
    let h = it.next()?.trim().parse().ok()?;
    let m = it.next()?.trim().parse().ok()?;
    let sec: f64 = it.next().unwrap_or("0").trim().parse().ok()?;
    Some((h, m, sec as u32, ((sec.fract()) * 1000.0).round() as u32))
}

/// Quotes a text value when it contains separators; `~` encodes empty.
fn quote(s: &str) -> String {
    if s.is_empty() {
        "~".to_string()
    } else if s.contains([';', ',', '=', '[', ']']) || s.contains(char::is_whitespace) {
        format!("\"{}\"", s.replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s == "~" {
        return String::new();
    }
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\\\"", "\"")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serialize_round_trip() {
        let mut p = Parameter::number_param("amp", "Amplitude", 0.0, "");
        p.assign("3.5 mV");
        assert_eq!(p.save(), "amp=3.5mV");
        assert!((p.number("V", 0) - 0.0035).abs() < 1e-12);
    }

    #[test]
    fn unit_adopted_on_first_assign_then_converted() {
        let mut p = Parameter::number_param("dur", "Duration", 0.1, "s");
        p.assign("250ms");
        assert!((p.number("s", 0) - 0.25).abs() < 1e-12);
        assert!((p.number("ms", 0) - 250.0).abs() < 1e-9);
    }

    #[test]
    fn list_assignment_and_save() {
        let mut p = Parameter::number_param("freq", "Frequency", 0.0, "Hz");
        p.assign("[ 100, 200, 300 ]");
        assert_eq!(p.numbers("Hz"), vec![100.0, 200.0, 300.0]);
        assert_eq!(p.save(), "freq=[ 100Hz, 200Hz, 300Hz ]");
    }

    #[test]
    fn empty_text_is_tilde() {
        let mut p = Parameter::text_param("label", "Label", "x");
        p.assign("~");
        assert_eq!(p.text(0), "");
        assert_eq!(p.save(), "label=~");
    }

    #[test]
    fn quoted_text_round_trips() {
        let mut p = Parameter::text_param("note", "Note", "");
        p.assign("\"a; b\"");
        assert_eq!(p.text(0), "a; b");
        assert_eq!(p.save(), "note=\"a; b\"");
    }

    #[test]
    fn range_clamps_assignment() {
        let mut p = Parameter::number_param("gain", "Gain", 1.0, "").with_range(0.0, 10.0, 0.5);
        p.set_number(42.0);
        assert_eq!(p.number("", 0), 10.0);
    }

    #[test]
    fn text_activation_with_alternatives() {
        let gate = Parameter::text_param("shape", "Shape", "sine");
        let act = Activation::parse("shape", "sine|sweep", true);
        assert!(act.matches(&gate));
        let gate2 = Parameter::text_param("shape", "Shape", "noise");
        assert!(!act.matches(&gate2));
    }

    #[test]
    fn numeric_activation_converts_units() {
        let gate = Parameter::number_param("amp", "Amplitude", 2.0, "mV");
        // 2 mV >= 0.001 V
        let act = Activation::parse("amp", ">=0.001V", true);
        assert!(act.matches(&gate));
        let act2 = Activation::parse("amp", ">0.5V", true);
        assert!(!act2.matches(&gate));
    }

    #[test]
    fn default_diffing() {
        let mut p = Parameter::number_param("rate", "Rate", 20.0, "kHz");
        assert!(!p.differs_from_default());
        p.assign("40kHz");
        assert!(p.differs_from_default());
        assert!(p.changed());
        p.set_to_default();
        assert_eq!(p.number("kHz", 0), 20.0);
        assert!(!p.changed());
    }

    #[test]
    fn boolean_and_integer_coercion() {
        let mut b = Parameter::boolean_param("on", "Enabled", false);
        b.assign("true");
        assert!(b.boolean(0));
        let mut i = Parameter::integer_param("count", "Count", 0, "");
        i.assign("7");
        assert_eq!(i.integer(0), 7);
    }
}
