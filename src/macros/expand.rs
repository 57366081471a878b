//! Parameter expansion for macro commands.
//!
//! Values passed into procedures may reference macro variables
//! (`$name`), draw random numbers (`$(rand 1..5 mV)` for a uniform
//! range, `$(rand 1,2,3 mV)` for a pick), or expand a whole range
//! (`freq=(100..400..100)Hz`), which repeats the procedure once per
//! value in declaration order.

use rand::Rng;

use crate::options::{Options, split_number_unit};

/// Substitutes `$name` and `$(rand …)` in a parameter string against
/// the bound variables. Unknown variables are left for the caller to
/// warn about and expand to the empty string.
pub fn expand_variables(params: &str, vars: &Options, rng: &mut impl Rng) -> (String, Vec<String>) {
    let mut unknown = Vec::new();
    let mut out_parts = Vec::new();
    for part in params.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((name, value)) = part.split_once('=') else {
            out_parts.push(part.to_string());
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        let expanded = if let Some(inner) = value.strip_prefix("$(").and_then(|v| v.strip_suffix(')'))
        {
            expand_generator(inner, rng).unwrap_or_else(|| {
                unknown.push(value.to_string());
                String::new()
            })
        } else if let Some(var) = value.strip_prefix('$') {
            match vars.get(var) {
                Some(p) => p.text(0),
                None => {
                    unknown.push(var.to_string());
                    String::new()
                }
            }
        } else {
            value.to_string()
        };
        out_parts.push(format!("{name}={expanded}"));
    }
    (out_parts.join("; "), unknown)
}

/// `rand a..b unit` or `rand v1,v2,v3 unit`.
fn expand_generator(inner: &str, rng: &mut impl Rng) -> Option<String> {
    let rest = inner.trim().strip_prefix("rand")?.trim();
    // split the trailing unit off the spec
    let (spec, unit) = match rest.split_once(char::is_whitespace) {
        Some((s, u)) => (s.trim(), u.trim()),
        None => (rest, ""),
    };
    if let Some((lo, hi)) = spec.split_once("..") {
        let lo: f64 = lo.trim().parse().ok()?;
        let hi: f64 = hi.trim().parse().ok()?;
        let v = if hi > lo {
            rng.random_range(lo..hi)
        } else {
            lo
        };
        return Some(format!("{v}{unit}"));
    }
    let choices: Vec<&str> = spec.split(',').map(str::trim).collect();
    if choices.is_empty() {
        return None;
    }
    let pick = choices[rng.random_range(0..choices.len())];
    Some(format!("{pick}{unit}"))
}

/// Expands every `(a..b[..step])unit` range value into the cartesian
/// product of parameter strings, first range outermost, in declaration
/// order. A string without ranges expands to itself.
pub fn expand_ranges(params: &str) -> Vec<String> {
    let parts: Vec<&str> = params
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    for (i, part) in parts.iter().enumerate() {
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };
        if let Some(values) = parse_range(value.trim()) {
            let mut out = Vec::new();
            for v in values {
                let mut replaced: Vec<String> =
                    parts.iter().map(|p| p.to_string()).collect();
                replaced[i] = format!("{}={v}", name.trim());
                for expanded in expand_ranges(&replaced.join("; ")) {
                    out.push(expanded);
                }
            }
            return out;
        }
    }
    vec![parts.join("; ")]
}

/// `(100..400..100)Hz` → ["100Hz", "200Hz", "300Hz", "400Hz"].
fn parse_range(value: &str) -> Option<Vec<String>> {
    let inner = value.strip_prefix('(')?;
    let close = inner.find(')')?;
    let unit = inner[close + 1..].trim();
    let spec = &inner[..close];
    let mut fields = spec.split("..");
    let (first, _) = split_number_unit(fields.next()?)?;
    let (last, _) = split_number_unit(fields.next()?)?;
    let step = match fields.next() {
        Some(s) => split_number_unit(s)?.0,
        None => 1.0,
    };
    if fields.next().is_some() || step == 0.0 {
        return None;
    }
    let step = if last >= first { step.abs() } else { -step.abs() };
    let n = ((last - first) / step).round() as i64;
    let mut values = Vec::new();
    for k in 0..=n.max(0) {
        let v = first + k as f64 * step;
        values.push(format!("{v}{unit}"));
    }
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn vars() -> Options {
        let mut o = Options::new("vars");
        o.add_number("amplitude", "", 2.0, "mV");
        o.add_text("shape", "", "sine");
        o
    }

    #[test]
    fn dollar_names_substitute_with_units() {
        let mut rng = StdRng::seed_from_u64(1);
        let (s, unknown) =
            expand_variables("amp=$amplitude; shape=$shape; n=3", &vars(), &mut rng);
        assert_eq!(s, "amp=2mV; shape=sine; n=3");
        assert!(unknown.is_empty());
    }

    #[test]
    fn unknown_variables_are_reported() {
        let mut rng = StdRng::seed_from_u64(1);
        let (_, unknown) = expand_variables("x=$nosuch", &vars(), &mut rng);
        assert_eq!(unknown, vec!["nosuch".to_string()]);
    }

    #[test]
    fn rand_range_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let (s, _) = expand_variables("x=$(rand 1..5 mV)", &vars(), &mut rng);
            let v: f64 = s
                .trim_start_matches("x=")
                .trim_end_matches("mV")
                .parse()
                .unwrap();
            assert!((1.0..5.0).contains(&v));
        }
    }

    #[test]
    fn rand_pick_selects_a_listed_value() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let (s, _) = expand_variables("x=$(rand 1,2,3 s)", &vars(), &mut rng);
            assert!(["x=1s", "x=2s", "x=3s"].contains(&s.as_str()), "{s}");
        }
    }

    #[test]
    fn range_expansion_in_declaration_order() {
        let out = expand_ranges("freq=(100..400..100)Hz");
        assert_eq!(
            out,
            vec![
                "freq=100Hz".to_string(),
                "freq=200Hz".to_string(),
                "freq=300Hz".to_string(),
                "freq=400Hz".to_string(),
            ]
        );
    }

    #[test]
    fn range_expansion_keeps_other_parameters() {
        let out = expand_ranges("amp=1mV; freq=(1..2)kHz");
        assert_eq!(
            out,
            vec![
                "amp=1mV; freq=1kHz".to_string(),
                "amp=1mV; freq=2kHz".to_string(),
            ]
        );
    }

    #[test]
    fn nested_ranges_form_a_product() {
        let out = expand_ranges("a=(1..2); b=(10..20..10)");
        assert_eq!(
            out,
            vec![
                "a=1; b=10".to_string(),
                "a=1; b=20".to_string(),
                "a=2; b=10".to_string(),
                "a=2; b=20".to_string(),
            ]
        );
    }

    #[test]
    fn plain_params_pass_through() {
        assert_eq!(expand_ranges("a=1; b=2"), vec!["a=1; b=2".to_string()]);
    }
}
